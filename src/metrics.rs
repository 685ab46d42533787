//! Latency recording and per-provider statistics
//!
//! Keeps a rolling, time-bounded window of samples per provider. The timeout
//! governor reads percentiles from it and the diagnostics endpoints read
//! the derived statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Timeout,
    Error,
}

/// One settled provider call. Never mutated after recording.
#[derive(Debug, Clone)]
pub struct LatencySample {
    pub provider: String,
    pub duration: Duration,
    pub outcome: Outcome,
    pub result_count: usize,
    pub recorded_at: Instant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStats {
    pub provider: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub timeout_count: u64,
    pub error_count: u64,
    pub total_results: u64,
    pub average_response_time_ms: f64,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ProviderStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.successful_requests as f64 / self.total_requests as f64) * 100.0
        }
    }
}

#[derive(Debug, Default)]
struct ProviderWindow {
    samples: VecDeque<LatencySample>,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Rolling latency window per provider
pub struct LatencyRecorder {
    windows: Mutex<HashMap<String, ProviderWindow>>,
    window: Duration,
    min_samples: usize,
    max_samples: usize,
}

impl LatencyRecorder {
    pub fn new(window: Duration, min_samples: usize, max_samples: usize) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            window,
            min_samples: min_samples.max(1),
            max_samples: max_samples.max(1),
        }
    }

    pub fn from_config(config: &crate::config::AdaptiveTimeoutConfig) -> Self {
        Self::new(
            config.window(),
            config.min_samples,
            config.max_samples_per_provider,
        )
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ProviderWindow>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn min_samples(&self) -> usize {
        self.min_samples
    }

    pub fn record(&self, provider: &str, duration: Duration, outcome: Outcome, result_count: usize) {
        let mut windows = self.lock();
        let now = Instant::now();
        let entry = windows.entry(provider.to_string()).or_default();

        evict_expired(entry, now, self.window);
        if entry.samples.len() >= self.max_samples {
            entry.samples.pop_front();
        }
        entry.samples.push_back(LatencySample {
            provider: provider.to_string(),
            duration,
            outcome,
            result_count,
            recorded_at: now,
        });

        match outcome {
            Outcome::Success => entry.last_success = Some(Utc::now()),
            Outcome::Timeout | Outcome::Error => entry.last_failure = Some(Utc::now()),
        }

        log::debug!(
            "[{}] {:?} in {}ms ({} results)",
            provider,
            outcome,
            duration.as_millis(),
            result_count
        );
    }

    /// Record an error outcome along with its message
    pub fn record_error(&self, provider: &str, duration: Duration, error: &str) {
        self.record(provider, duration, Outcome::Error, 0);
        let mut windows = self.lock();
        if let Some(entry) = windows.get_mut(provider) {
            entry.last_error = Some(error.to_string());
        }
    }

    /// The `p`-th percentile of successful call durations within the window,
    /// or `None` with fewer than the minimum number of samples.
    pub fn percentile(&self, provider: &str, p: f64) -> Option<Duration> {
        let mut windows = self.lock();
        let entry = windows.get_mut(provider)?;
        evict_expired(entry, Instant::now(), self.window);

        let mut values: Vec<Duration> = entry
            .samples
            .iter()
            .filter(|s| s.outcome == Outcome::Success)
            .map(|s| s.duration)
            .collect();
        if values.len() < self.min_samples {
            return None;
        }
        values.sort_unstable();
        percentile_of(&values, p)
    }

    /// Number of successful samples currently inside the window
    pub fn sample_count(&self, provider: &str) -> usize {
        let mut windows = self.lock();
        match windows.get_mut(provider) {
            Some(entry) => {
                evict_expired(entry, Instant::now(), self.window);
                entry
                    .samples
                    .iter()
                    .filter(|s| s.outcome == Outcome::Success)
                    .count()
            }
            None => 0,
        }
    }

    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn stats(&self, provider: &str) -> Option<ProviderStats> {
        let mut windows = self.lock();
        let entry = windows.get_mut(provider)?;
        evict_expired(entry, Instant::now(), self.window);
        Some(build_stats(provider, entry))
    }

    pub fn all_stats(&self) -> Vec<ProviderStats> {
        let mut windows = self.lock();
        let now = Instant::now();
        let mut stats: Vec<ProviderStats> = windows
            .iter_mut()
            .map(|(name, entry)| {
                evict_expired(entry, now, self.window);
                build_stats(name, entry)
            })
            .collect();
        stats.sort_by(|a, b| a.provider.cmp(&b.provider));
        stats
    }

    pub fn log_summary(&self) {
        let mut stats = self.all_stats();
        stats.sort_by(|a, b| b.success_rate().total_cmp(&a.success_rate()));

        log::info!("=== Provider Performance Summary ===");
        for m in stats {
            log::info!(
                "[{}] success {:.2}% of {} | timeouts {} | errors {} | avg {:.0}ms | p95 {} | results {}",
                m.provider,
                m.success_rate(),
                m.total_requests,
                m.timeout_count,
                m.error_count,
                m.average_response_time_ms,
                m.p95_ms.map(|v| format!("{}ms", v)).unwrap_or_else(|| "-".to_string()),
                m.total_results
            );
            if let Some(last_error) = &m.last_error {
                log::info!("[{}] last error: {}", m.provider, last_error);
            }
        }
    }

    pub fn export_json(&self) -> String {
        serde_json::to_string_pretty(&self.all_stats()).unwrap_or_else(|_| "[]".to_string())
    }
}

impl Default for LatencyRecorder {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600), 5, 2000)
    }
}

fn evict_expired(entry: &mut ProviderWindow, now: Instant, window: Duration) {
    while let Some(front) = entry.samples.front() {
        if now.saturating_duration_since(front.recorded_at) > window {
            entry.samples.pop_front();
        } else {
            break;
        }
    }
}

/// Nearest-rank percentile over sorted values
fn percentile_of(sorted: &[Duration], p: f64) -> Option<Duration> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = ((p.clamp(0.0, 100.0) / 100.0) * n as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(n - 1);
    Some(sorted[idx])
}

fn build_stats(provider: &str, entry: &ProviderWindow) -> ProviderStats {
    let mut successes: Vec<Duration> = Vec::new();
    let mut timeouts = 0u64;
    let mut errors = 0u64;
    let mut results = 0u64;

    for s in &entry.samples {
        match s.outcome {
            Outcome::Success => successes.push(s.duration),
            Outcome::Timeout => timeouts += 1,
            Outcome::Error => errors += 1,
        }
        results += s.result_count as u64;
    }
    successes.sort_unstable();

    let average = if successes.is_empty() {
        0.0
    } else {
        successes.iter().map(|d| d.as_millis() as f64).sum::<f64>() / successes.len() as f64
    };

    ProviderStats {
        provider: provider.to_string(),
        total_requests: entry.samples.len() as u64,
        successful_requests: successes.len() as u64,
        timeout_count: timeouts,
        error_count: errors,
        total_results: results,
        average_response_time_ms: average,
        p50_ms: percentile_of(&successes, 50.0).map(|d| d.as_millis() as u64),
        p95_ms: percentile_of(&successes, 95.0).map(|d| d.as_millis() as u64),
        last_success: entry.last_success,
        last_failure: entry.last_failure,
        last_error: entry.last_error.clone(),
    }
}
