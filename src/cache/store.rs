use super::{CacheBackend, CacheHit, DisabledBackend};
use crate::config::CacheConfig;
use crate::error::FetchError;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

type SharedFetch = Shared<BoxFuture<'static, Result<Value, FetchError>>>;
type InflightMap = Arc<Mutex<HashMap<String, SharedFetch>>>;

/// How `get_or_fetch` stores and serves one kind of value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachePolicy {
    pub ttl: Duration,
    /// When set, a value older than `ttl` but younger than `ttl + grace` is
    /// returned immediately while a refresh runs in the background.
    pub stale_grace: Option<Duration>,
    /// Store empty results (`null` or `[]`). Off by default so a transient
    /// "nothing found" does not stick for a full TTL.
    pub cache_empty: bool,
}

impl CachePolicy {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            stale_grace: None,
            cache_empty: false,
        }
    }

    pub fn with_stale_grace(mut self, grace: Duration) -> Self {
        self.stale_grace = Some(grace);
        self
    }

    pub fn caching_empty(mut self) -> Self {
        self.cache_empty = true;
        self
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        let policy = Self::new(Duration::from_secs(config.default_ttl_secs));
        if config.stale_while_revalidate {
            policy.with_stale_grace(Duration::from_secs(config.stale_grace_secs))
        } else {
            policy
        }
    }

    /// Lifetime of the stored record, which covers the stale window too
    fn storage_ttl(&self) -> Duration {
        self.ttl + self.stale_grace.unwrap_or_default()
    }

    fn serves_stale(&self, age: Duration) -> bool {
        matches!(self.stale_grace, Some(grace) if age < self.ttl + grace)
    }

    fn should_store(&self, value: &Value) -> bool {
        if self.cache_empty {
            return true;
        }
        match value {
            Value::Null => false,
            Value::Array(items) => !items.is_empty(),
            _ => true,
        }
    }
}

/// Cache facade used by the rest of the crate.
///
/// Backend errors are logged and degrade to a miss (reads) or a no-op
/// (writes). Concurrent `get_or_fetch` calls for the same key share one
/// underlying fetch.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    inflight: InflightMap,
}

/// Removes the in-flight entry once its fetch task ends, even if it panicked
struct InflightGuard {
    inflight: InflightMap,
    key: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(DisabledBackend))
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_enabled()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Fetches currently in flight
    pub fn inflight_count(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub async fn get(&self, namespace: &str, key: &str) -> Option<CacheHit> {
        if !self.is_enabled() {
            return None;
        }
        match self.backend.get(namespace, key).await {
            Ok(hit) => hit,
            Err(e) => {
                log::warn!("[cache:{}] get {}/{} failed: {}", self.backend_name(), namespace, key, e);
                None
            }
        }
    }

    /// Store a value; returns whether it was written
    pub async fn set(&self, namespace: &str, key: &str, value: &Value, ttl: Duration) -> bool {
        if !self.is_enabled() {
            return false;
        }
        match self.backend.set(namespace, key, value, ttl).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[cache:{}] set {}/{} failed: {}", self.backend_name(), namespace, key, e);
                false
            }
        }
    }

    pub async fn delete(&self, namespace: &str, key: &str) {
        if let Err(e) = self.backend.delete(namespace, key).await {
            log::warn!("[cache:{}] delete {}/{} failed: {}", self.backend_name(), namespace, key, e);
        }
    }

    pub async fn purge_expired(&self) -> u64 {
        match self.backend.purge_expired().await {
            Ok(removed) => removed,
            Err(e) => {
                log::warn!("[cache:{}] purge failed: {}", self.backend_name(), e);
                0
            }
        }
    }

    /// Return the cached value for `(namespace, key)` or run `fetch` to
    /// produce it.
    ///
    /// Fetch errors are returned to every waiting caller and nothing is
    /// stored.
    pub async fn get_or_fetch<T, E, F, Fut>(
        &self,
        namespace: &str,
        key: &str,
        policy: CachePolicy,
        fetch: F,
    ) -> Result<T, FetchError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if let Some(hit) = self.get(namespace, key).await {
            let age = hit.age();
            match serde_json::from_value::<T>(hit.value) {
                Ok(value) if age < policy.ttl => {
                    log::debug!("[cache] hit {}/{}", namespace, key);
                    return Ok(value);
                }
                Ok(value) if policy.serves_stale(age) => {
                    log::debug!(
                        "[cache] serving stale {}/{} ({}ms old), refreshing",
                        namespace,
                        key,
                        age.as_millis()
                    );
                    // the refresh runs on its own task; nobody waits for it here
                    drop(self.start_fetch(namespace, key, policy, fetch));
                    return Ok(value);
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("[cache] dropping undecodable {}/{}: {}", namespace, key, e);
                    self.delete(namespace, key).await;
                }
            }
        }

        let value = self.start_fetch(namespace, key, policy, fetch).await?;
        serde_json::from_value(value).map_err(|e| FetchError::Decode(e.to_string().into()))
    }

    /// Join the fetch already running for this key, or spawn a new one.
    ///
    /// The fetch runs on its own task so it completes (and populates the
    /// cache) even when every caller has gone away.
    fn start_fetch<T, E, F, Fut>(
        &self,
        namespace: &str,
        key: &str,
        policy: CachePolicy,
        fetch: F,
    ) -> SharedFetch
    where
        T: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let map_key = format!("{}\u{1f}{}", namespace, key);
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = inflight.get(&map_key) {
            log::debug!("[cache] joining in-flight fetch for {}/{}", namespace, key);
            return existing.clone();
        }

        let store = self.clone();
        let guard = InflightGuard {
            inflight: self.inflight.clone(),
            key: map_key.clone(),
        };
        let (namespace, key) = (namespace.to_string(), key.to_string());

        let task = tokio::spawn(async move {
            let _guard = guard;
            let result = match fetch().await {
                Ok(value) => serde_json::to_value(&value)
                    .map_err(|e| FetchError::Decode(e.to_string().into())),
                Err(e) => Err(FetchError::upstream(e)),
            };

            match &result {
                Ok(value) if policy.should_store(value) => {
                    store.set(&namespace, &key, value, policy.storage_ttl()).await;
                }
                Ok(_) => log::debug!("[cache] not storing empty result for {}/{}", namespace, key),
                Err(e) => log::debug!("[cache] fetch for {}/{} failed: {}", namespace, key, e),
            }
            result
        });

        let shared = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(FetchError::Aborted(e.to_string().into())),
            }
        }
        .boxed()
        .shared();

        inflight.insert(map_key, shared.clone());
        shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SqliteBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sqlite_store() -> CacheStore {
        CacheStore::new(Arc::new(SqliteBackend::open_in_memory().unwrap()))
    }

    fn policy() -> CachePolicy {
        CachePolicy::new(Duration::from_secs(60))
    }

    async fn wait_idle(store: &CacheStore) {
        for _ in 0..200 {
            if store.inflight_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("fetch never finished");
    }

    #[tokio::test]
    async fn test_second_call_served_from_cache() {
        let store = sqlite_store();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let value: Vec<String> = store
                .get_or_fetch("ns", "k", policy(), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(vec!["a".to_string()])
                })
                .await
                .unwrap();
            assert_eq!(value, vec!["a".to_string()]);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let store = sqlite_store();
        let calls = Arc::new(AtomicUsize::new(0));

        let callers = (0..10).map(|_| {
            let calls = calls.clone();
            let store = store.clone();
            async move {
                store
                    .get_or_fetch("ns", "shared", policy(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, String>(vec![1u32, 2, 3])
                    })
                    .await
            }
        });
        let results = futures_util::future::join_all(callers).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap(), vec![1, 2, 3]);
        }
        assert_eq!(store.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_coalescing_without_backend() {
        let store = CacheStore::disabled();
        let calls = Arc::new(AtomicUsize::new(0));

        let callers = (0..5).map(|_| {
            let calls = calls.clone();
            let store = store.clone();
            async move {
                store
                    .get_or_fetch("ns", "k", policy(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, String>(7u32)
                    })
                    .await
            }
        });
        let results = futures_util::future::join_all(callers).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.into_iter().all(|r| r.unwrap() == 7));
        assert!(!store.set("ns", "k", &Value::from(1), Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_errors_not_cached() {
        let store = sqlite_store();
        let err = store
            .get_or_fetch("ns", "k", policy(), || async { Err::<Vec<u32>, _>("boom") })
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Upstream(ref m) if m.contains("boom")));
        assert!(store.get("ns", "k").await.is_none());

        let ok: Vec<u32> = store
            .get_or_fetch("ns", "k", policy(), || async { Ok::<_, String>(vec![1]) })
            .await
            .unwrap();
        assert_eq!(ok, vec![1]);
    }

    #[tokio::test]
    async fn test_empty_results_not_stored_by_default() {
        let store = sqlite_store();
        let empty: Vec<u32> = store
            .get_or_fetch("ns", "k", policy(), || async { Ok::<_, String>(Vec::new()) })
            .await
            .unwrap();
        assert!(empty.is_empty());
        wait_idle(&store).await;
        assert!(store.get("ns", "k").await.is_none());

        let _: Vec<u32> = store
            .get_or_fetch("ns", "k2", policy().caching_empty(), || async {
                Ok::<_, String>(Vec::new())
            })
            .await
            .unwrap();
        wait_idle(&store).await;
        assert!(store.get("ns", "k2").await.is_some());
    }

    #[tokio::test]
    async fn test_panicking_fetch_clears_inflight() {
        let store = sqlite_store();
        let err = store
            .get_or_fetch("ns", "k", policy(), || async {
                if true {
                    panic!("provider blew up");
                }
                Ok::<u32, String>(1)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Aborted(_)));
        wait_idle(&store).await;

        let value: u32 = store
            .get_or_fetch("ns", "k", policy(), || async { Ok::<_, String>(2) })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn test_stale_value_served_while_refreshing() {
        let store = sqlite_store();
        let policy = CachePolicy::new(Duration::from_millis(50))
            .with_stale_grace(Duration::from_secs(30));

        let first: String = store
            .get_or_fetch("ns", "k", policy, || async { Ok::<_, String>("old".to_string()) })
            .await
            .unwrap();
        assert_eq!(first, "old");
        wait_idle(&store).await;

        tokio::time::sleep(Duration::from_millis(80)).await;

        let stale: String = store
            .get_or_fetch("ns", "k", policy, || async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, String>("new".to_string())
            })
            .await
            .unwrap();
        assert_eq!(stale, "old");
        // the detached refresh is still running after the caller returned
        assert_eq!(store.inflight_count(), 1);

        wait_idle(&store).await;
        let hit = store.get("ns", "k").await.unwrap();
        assert_eq!(hit.value, Value::from("new"));
    }

    #[test]
    fn test_policy_from_config() {
        let cfg = CacheConfig {
            default_ttl_secs: 120,
            stale_while_revalidate: true,
            stale_grace_secs: 30,
            ..CacheConfig::default()
        };
        let policy = CachePolicy::from_config(&cfg);
        assert_eq!(policy.ttl, Duration::from_secs(120));
        assert_eq!(policy.storage_ttl(), Duration::from_secs(150));
        assert!(policy.serves_stale(Duration::from_secs(140)));
        assert!(!policy.serves_stale(Duration::from_secs(151)));
    }
}
