//! Application state shared by the diagnostics server and the scheduler.
//!
//! Every resilience component is built once here from the immutable
//! `Config` and handed out by reference; nothing is a global.

use crate::bypass::BypassClient;
use crate::cache::{self, CacheStore};
use crate::config::Config;
use crate::error::StartupError;
use crate::gatekeeper::Gatekeeper;
use crate::http_client::DirectClient;
use crate::metrics::LatencyRecorder;
use crate::orchestrator::Aggregator;
use crate::timeout_governor::TimeoutGovernor;
use std::sync::Arc;

pub struct AppState {
    pub config: Config,
    pub recorder: Arc<LatencyRecorder>,
    pub governor: Arc<TimeoutGovernor>,
    pub gatekeeper: Gatekeeper,
    pub cache: CacheStore,
    pub aggregator: Aggregator,
    pub direct: DirectClient,
    pub bypass: BypassClient,
}

impl AppState {
    /// Build all components. A cache backend that cannot be opened is
    /// logged and replaced by the disabled backend.
    pub async fn build(config: Config) -> Result<Self, StartupError> {
        let recorder = Arc::new(LatencyRecorder::from_config(&config.adaptive_timeout));
        let governor = Arc::new(TimeoutGovernor::new(
            recorder.clone(),
            config.adaptive_timeout.clone(),
        ));
        let gatekeeper = Gatekeeper::new(config.gatekeeper.clone());

        let cache = match cache::open_backend(&config.cache).await {
            Ok(backend) => CacheStore::new(backend),
            Err(e) => {
                log::error!("Cache backend unavailable, continuing without cache: {}", e);
                CacheStore::disabled()
            }
        };

        let aggregator = Aggregator::new(governor.clone(), cache.clone());
        let direct = config.http.create_http_client()?;
        let bypass = BypassClient::new(config.bypass.clone(), gatekeeper.clone())?;

        log::info!("Bypass service: {}", bypass.endpoint());
        log::info!(
            "  Max concurrent: {}, queue depth: {}, hourly limit: {}",
            config.gatekeeper.max_concurrent,
            config.gatekeeper.queue_max_depth,
            config.gatekeeper.per_identity_hourly_limit
        );
        log::info!(
            "Adaptive timeouts: {} (p{} + {:.0}%, {} samples minimum)",
            if config.adaptive_timeout.enabled { "on" } else { "off" },
            config.adaptive_timeout.percentile,
            config.adaptive_timeout.buffer * 100.0,
            config.adaptive_timeout.min_samples
        );

        Ok(Self {
            config,
            recorder,
            governor,
            gatekeeper,
            cache,
            aggregator,
            direct,
            bypass,
        })
    }
}
