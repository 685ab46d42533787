//! Fan-out over independent provider tasks.
//!
//! Every task runs on its own tokio task, bounded by the governor's timeout
//! for its provider. A task that fails, panics or times out contributes
//! nothing; the others are unaffected. `aggregate` waits for every task to
//! settle and never returns an error.

use crate::cache::{CachePolicy, CacheStore};
use crate::error::ProviderError;
use crate::metrics::{LatencyRecorder, Outcome};
use crate::models::{SourceRequest, StreamSource};
use crate::provider::Provider;
use crate::timeout_governor::TimeoutGovernor;
use futures_util::future::{join_all, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Namespace used for whole-request results from `aggregate_providers_cached`
pub const SOURCES_NAMESPACE: &str = "sources";

/// A named, idempotent unit of upstream work
pub struct ProviderTask<T> {
    name: String,
    future: BoxFuture<'static, Result<Vec<T>, ProviderError>>,
}

impl<T> ProviderTask<T> {
    pub fn new<F>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = Result<Vec<T>, ProviderError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            future: future.boxed(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Aborts the spawned provider task once nobody is waiting on it, whether
/// the timer fired or the caller dropped `aggregate`
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct TaskReport<T> {
    items: Vec<T>,
    outcome: Outcome,
}

#[derive(Clone)]
pub struct Aggregator {
    governor: Arc<TimeoutGovernor>,
    cache: CacheStore,
}

impl Aggregator {
    pub fn new(governor: Arc<TimeoutGovernor>, cache: CacheStore) -> Self {
        Self { governor, cache }
    }

    pub fn governor(&self) -> &Arc<TimeoutGovernor> {
        &self.governor
    }

    pub fn recorder(&self) -> &Arc<LatencyRecorder> {
        self.governor.recorder()
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Run one task under its provider's timeout, recording the outcome.
    /// Returns an empty list on timeout, error or panic.
    pub async fn with_timeout<T: Send + 'static>(&self, task: ProviderTask<T>) -> Vec<T> {
        self.run(task).await.items
    }

    async fn run<T: Send + 'static>(&self, task: ProviderTask<T>) -> TaskReport<T> {
        let ProviderTask { name, future } = task;
        let timeout = self.governor.timeout_for(&name);
        let recorder = self.recorder();
        let started = Instant::now();
        let mut handle = AbortOnDrop(tokio::spawn(future));

        match tokio::time::timeout(timeout, &mut handle.0).await {
            Ok(Ok(Ok(items))) => {
                recorder.record(&name, started.elapsed(), Outcome::Success, items.len());
                TaskReport {
                    items,
                    outcome: Outcome::Success,
                }
            }
            Ok(Ok(Err(e))) => {
                log::warn!("[{}] failed: {}", name, e);
                recorder.record_error(&name, started.elapsed(), &e.to_string());
                TaskReport {
                    items: Vec::new(),
                    outcome: Outcome::Error,
                }
            }
            Ok(Err(join_error)) => {
                let e = ProviderError::Panicked(join_error.to_string());
                log::error!("[{}] {}", name, e);
                recorder.record_error(&name, started.elapsed(), &e.to_string());
                TaskReport {
                    items: Vec::new(),
                    outcome: Outcome::Error,
                }
            }
            Err(_) => {
                let e = ProviderError::Timeout(timeout.as_millis() as u64);
                log::warn!("[{}] {}", name, e);
                recorder.record(&name, started.elapsed(), Outcome::Timeout, 0);
                TaskReport {
                    items: Vec::new(),
                    outcome: Outcome::Timeout,
                }
            }
        }
    }

    /// Run all tasks concurrently and flatten their results in task order
    pub async fn aggregate<T: Send + 'static>(&self, tasks: Vec<ProviderTask<T>>) -> Vec<T> {
        let total = tasks.len();
        let reports = join_all(tasks.into_iter().map(|task| self.run(task))).await;

        let timed_out = reports
            .iter()
            .filter(|r| r.outcome == Outcome::Timeout)
            .count();
        let failed = reports
            .iter()
            .filter(|r| r.outcome == Outcome::Error)
            .count();

        let results: Vec<T> = reports.into_iter().flat_map(|r| r.items).collect();
        log::info!(
            "Aggregated {} results from {} providers ({} timed out, {} failed)",
            results.len(),
            total,
            timed_out,
            failed
        );
        results
    }

    /// `aggregate` behind the coalescing cache. A hit performs no upstream
    /// calls; concurrent misses for the same key run the tasks once.
    pub async fn aggregate_cached<T>(
        &self,
        namespace: &str,
        key: &str,
        policy: CachePolicy,
        tasks: Vec<ProviderTask<T>>,
    ) -> Vec<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let aggregator = self.clone();
        let fetch = move || async move { Ok::<_, Infallible>(aggregator.aggregate(tasks).await) };

        match self.cache.get_or_fetch(namespace, key, policy, fetch).await {
            Ok(results) => results,
            Err(e) => {
                log::warn!("Cached aggregation for {}/{} failed: {}", namespace, key, e);
                Vec::new()
            }
        }
    }

    /// Wrap a single task so its results go through the cache
    pub fn cached_task<T>(
        &self,
        namespace: &str,
        key: &str,
        policy: CachePolicy,
        task: ProviderTask<T>,
    ) -> ProviderTask<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let cache = self.cache.clone();
        let (namespace, key) = (namespace.to_string(), key.to_string());
        let ProviderTask { name, future } = task;

        ProviderTask::new(name, async move {
            cache
                .get_or_fetch(&namespace, &key, policy, move || future)
                .await
                .map_err(|e| ProviderError::upstream(e.to_string()))
        })
    }

    /// Query every provider for `request`
    pub async fn aggregate_providers(
        &self,
        providers: &[Arc<dyn Provider>],
        request: &SourceRequest,
    ) -> Vec<StreamSource> {
        let names: Vec<&str> = providers.iter().map(|p| p.name()).collect();
        self.governor.prewarm(&names).await;
        self.aggregate(provider_tasks(providers, request)).await
    }

    /// `aggregate_providers` behind the cache, keyed by the request
    pub async fn aggregate_providers_cached(
        &self,
        providers: &[Arc<dyn Provider>],
        request: &SourceRequest,
        policy: CachePolicy,
    ) -> Vec<StreamSource> {
        let names: Vec<&str> = providers.iter().map(|p| p.name()).collect();
        self.governor.prewarm(&names).await;
        self.aggregate_cached(
            SOURCES_NAMESPACE,
            &request.cache_key(),
            policy,
            provider_tasks(providers, request),
        )
        .await
    }
}

fn provider_tasks(
    providers: &[Arc<dyn Provider>],
    request: &SourceRequest,
) -> Vec<ProviderTask<StreamSource>> {
    providers
        .iter()
        .map(|provider| {
            let provider = provider.clone();
            let request = request.clone();
            ProviderTask::new(provider.name().to_string(), async move {
                provider.fetch(&request).await
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdaptiveTimeoutConfig;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    fn aggregator() -> Aggregator {
        let config = AdaptiveTimeoutConfig {
            default_timeout_ms: 1_000,
            ..AdaptiveTimeoutConfig::default()
        };
        let recorder = Arc::new(LatencyRecorder::from_config(&config));
        Aggregator::new(
            Arc::new(TimeoutGovernor::new(recorder, config)),
            CacheStore::disabled(),
        )
    }

    fn task(name: &str, delay_ms: u64, items: Vec<u32>) -> ProviderTask<u32> {
        ProviderTask::new(name, async move {
            sleep(Duration::from_millis(delay_ms)).await;
            Ok(items)
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_isolated() {
        let agg = aggregator();
        let tasks = vec![
            task("ok", 100, vec![1, 2]),
            ProviderTask::new("broken", async { Err(ProviderError::upstream("500")) }),
            ProviderTask::new("hangs", std::future::pending()),
            ProviderTask::new("panics", async {
                if true {
                    panic!("parser bug");
                }
                Ok(vec![9])
            }),
            task("empty", 10, vec![]),
        ];

        let results = agg.aggregate(tasks).await;
        assert_eq!(results, vec![1, 2]);

        let stats = |name: &str| agg.recorder().stats(name).unwrap();
        assert_eq!(stats("ok").successful_requests, 1);
        assert_eq!(stats("broken").error_count, 1);
        assert_eq!(stats("hangs").timeout_count, 1);
        assert_eq!(stats("panics").error_count, 1);
        assert_eq!(stats("empty").successful_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_keep_task_order() {
        let agg = aggregator();
        let tasks = vec![
            task("slow", 500, vec![1]),
            task("fast", 10, vec![2, 3]),
            task("mid", 200, vec![4]),
        ];
        assert_eq!(agg.aggregate(tasks).await, vec![1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_task_is_aborted() {
        let agg = aggregator();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let results = agg
            .aggregate(vec![ProviderTask::new("slow", async move {
                sleep(Duration::from_secs(5)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(vec![1u32])
            })])
            .await;
        assert!(results.is_empty());

        sleep(Duration::from_secs(10)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_aggregate_aborts_running_tasks() {
        let agg = aggregator();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        // Finishes well inside its 1s timeout if left running
        let tasks = vec![ProviderTask::new("steady", async move {
            sleep(Duration::from_millis(500)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(vec![1u32])
        })];
        let gave_up = tokio::time::timeout(Duration::from_millis(100), agg.aggregate(tasks)).await;
        assert!(gave_up.is_err());

        sleep(Duration::from_secs(60)).await;
        assert!(!finished.load(Ordering::SeqCst));
        assert!(agg.recorder().stats("steady").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_tasks_settle_before_return() {
        let agg = aggregator();
        let started = Instant::now();
        let results = agg
            .aggregate(vec![
                ProviderTask::new("fails-fast", async { Err(ProviderError::upstream("x")) }),
                task("slow", 800, vec![7]),
            ])
            .await;
        assert_eq!(results, vec![7]);
        assert!(started.elapsed() >= Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_cached_task_skips_upstream_on_hit() {
        let backend = crate::cache::SqliteBackend::open_in_memory().unwrap();
        let agg = Aggregator::new(
            aggregator().governor().clone(),
            CacheStore::new(Arc::new(backend)),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = CachePolicy::new(Duration::from_secs(60));

        for _ in 0..2 {
            let calls = calls.clone();
            let inner = ProviderTask::new("cached", async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![5u32])
            });
            let wrapped = agg.cached_task("provider:cached", "k", policy, inner);
            assert_eq!(wrapped.name(), "cached");
            assert_eq!(agg.with_timeout(wrapped).await, vec![5]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
