//! Adaptive per-provider timeouts.
//!
//! A provider's timeout is its recent P95 latency plus a buffer, clamped to
//! provider-specific bounds. Until enough samples exist the static default
//! applies. Computed values are cached for a refresh interval so the hot
//! path inside the orchestrator is a map lookup.

use crate::config::AdaptiveTimeoutConfig;
use crate::metrics::LatencyRecorder;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct ProviderTimeoutState {
    pub provider: String,
    pub computed_timeout: Duration,
    pub last_computed_at: Instant,
    pub sample_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeoutSnapshot {
    pub provider: String,
    pub timeout_ms: u64,
    pub age_ms: u64,
    pub sample_count: usize,
}

pub struct TimeoutGovernor {
    recorder: Arc<LatencyRecorder>,
    config: AdaptiveTimeoutConfig,
    computed: Mutex<HashMap<String, ProviderTimeoutState>>,
}

impl TimeoutGovernor {
    pub fn new(recorder: Arc<LatencyRecorder>, config: AdaptiveTimeoutConfig) -> Self {
        Self {
            recorder,
            config,
            computed: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ProviderTimeoutState>> {
        self.computed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn recorder(&self) -> &Arc<LatencyRecorder> {
        &self.recorder
    }

    /// Timeout to use for the next call to `provider`.
    pub fn timeout_for(&self, provider: &str) -> Duration {
        if !self.config.enabled {
            return self.config.bounds_for(provider).default;
        }

        if let Some(state) = self.lock().get(provider) {
            if state.last_computed_at.elapsed() < self.config.refresh_interval() {
                return state.computed_timeout;
            }
        }

        match self.compute(provider) {
            Some(state) => {
                let timeout = state.computed_timeout;
                self.lock().insert(provider.to_string(), state);
                timeout
            }
            None => self.config.bounds_for(provider).default,
        }
    }

    /// Force computation for a batch of providers before a request starts.
    pub async fn prewarm<S: AsRef<str>>(&self, providers: &[S]) {
        if !self.config.enabled {
            return;
        }
        let mut warmed = 0usize;
        for provider in providers {
            let provider = provider.as_ref();
            match self.compute(provider) {
                Some(state) => {
                    self.lock().insert(provider.to_string(), state);
                    warmed += 1;
                }
                None => {
                    self.lock().remove(provider);
                }
            }
            tokio::task::yield_now().await;
        }
        log::debug!(
            "Pre-warmed adaptive timeouts: {}/{} providers have enough samples",
            warmed,
            providers.len()
        );
    }

    /// Drop the cached value so the next read recomputes it
    pub fn invalidate(&self, provider: &str) {
        self.lock().remove(provider);
    }

    pub fn snapshot(&self) -> Vec<TimeoutSnapshot> {
        let mut out: Vec<TimeoutSnapshot> = self
            .lock()
            .values()
            .map(|s| TimeoutSnapshot {
                provider: s.provider.clone(),
                timeout_ms: s.computed_timeout.as_millis() as u64,
                age_ms: s.last_computed_at.elapsed().as_millis() as u64,
                sample_count: s.sample_count,
            })
            .collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }

    fn compute(&self, provider: &str) -> Option<ProviderTimeoutState> {
        let p95 = self.recorder.percentile(provider, self.config.percentile)?;
        let bounds = self.config.bounds_for(provider);

        let buffered = p95.mul_f64(1.0 + self.config.buffer);
        let computed = buffered.max(bounds.floor).min(bounds.ceiling);

        log::debug!(
            "[{}] adaptive timeout {}ms (p{}={}ms, bounds {}..{}ms)",
            provider,
            computed.as_millis(),
            self.config.percentile,
            p95.as_millis(),
            bounds.floor.as_millis(),
            bounds.ceiling.as_millis()
        );

        Some(ProviderTimeoutState {
            provider: provider.to_string(),
            computed_timeout: computed,
            last_computed_at: Instant::now(),
            sample_count: self.recorder.sample_count(provider),
        })
    }
}
