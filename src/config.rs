use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Immutable process configuration, built once at startup and handed to
/// each component constructor.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gatekeeper: GatekeeperConfig,
    #[serde(default)]
    pub bypass: BypassConfig,
    #[serde(default)]
    pub adaptive_timeout: AdaptiveTimeoutConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address the diagnostics server binds to
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Providers whose timeouts are pre-computed by the scheduler
    #[serde(default)]
    pub prewarm_providers: Vec<String>,

    /// Seconds between scheduler cycles (cache purge + timeout pre-warm)
    #[serde(default = "default_scheduler_interval")]
    pub scheduler_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatekeeperConfig {
    /// Maximum simultaneous calls to the bypass service
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Maximum number of callers waiting for a slot
    #[serde(default = "default_queue_max_depth")]
    pub queue_max_depth: usize,

    /// How long a queued caller waits before giving up
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_ms: u64,

    /// Failures (or slow responses) that open the circuit
    #[serde(default = "default_circuit_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long the circuit stays open
    #[serde(default = "default_circuit_cooldown")]
    pub circuit_cooldown_ms: u64,

    /// A successful call slower than this counts as a slow response
    #[serde(default = "default_slow_response")]
    pub slow_response_ms: u64,

    /// Consecutive slow responses that open the circuit
    #[serde(default = "default_slow_threshold")]
    pub slow_response_threshold: u32,

    /// Requests per identity per rolling hour, 0 disables the quota
    #[serde(default = "default_hourly_limit")]
    pub per_identity_hourly_limit: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BypassConfig {
    /// FlareSolverr-compatible endpoint, without the trailing `/v1`
    #[serde(default = "default_bypass_url")]
    pub base_url: String,

    /// `maxTimeout` sent with each request
    #[serde(default = "default_bypass_max_timeout")]
    pub max_timeout_ms: u64,

    /// Reuse one browser session per domain
    #[serde(default = "default_true")]
    pub session_reuse: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdaptiveTimeoutConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Fraction added on top of the percentile, 0.5 means +50%
    #[serde(default = "default_buffer")]
    pub buffer: f64,

    #[serde(default = "default_percentile")]
    pub percentile: f64,

    /// Rolling window of latency samples
    #[serde(default = "default_window")]
    pub window_secs: u64,

    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Hard cap on retained samples per provider
    #[serde(default = "default_max_samples")]
    pub max_samples_per_provider: usize,

    /// Age after which a computed timeout is recomputed
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    #[serde(default = "default_floor_ms")]
    pub floor_ms: u64,

    #[serde(default = "default_ceiling_ms")]
    pub ceiling_ms: u64,

    /// Per-provider overrides, keyed by provider name
    #[serde(default)]
    pub providers: HashMap<String, ProviderTimeoutOverride>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProviderTimeoutOverride {
    pub default_ms: Option<u64>,
    pub floor_ms: Option<u64>,
    pub ceiling_ms: Option<u64>,
}

/// Resolved timeout bounds for one provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderTimeoutBounds {
    pub default: Duration,
    pub floor: Duration,
    pub ceiling: Duration,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Sqlite,
    Postgres,
    None,
}

impl FromStr for CacheBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(CacheBackendKind::Sqlite),
            "postgres" | "postgresql" | "pg" => Ok(CacheBackendKind::Postgres),
            "none" | "off" | "disabled" => Ok(CacheBackendKind::None),
            other => Err(format!("unknown cache backend '{}'", other)),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackendKind,

    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    #[serde(default)]
    pub postgres: PostgresConfig,

    #[serde(default = "default_ttl")]
    pub default_ttl_secs: u64,

    /// Serve expired values while refreshing them in the background
    #[serde(default = "default_true")]
    pub stale_while_revalidate: bool,

    /// How long past expiry a value may still be served
    #[serde(default = "default_stale_grace")]
    pub stale_grace_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PostgresConfig {
    #[serde(default = "default_pg_host")]
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    #[serde(default = "default_pg_dbname")]
    pub dbname: String,
    #[serde(default = "default_pg_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_pg_pool_size")]
    pub pool_size: usize,
}

/// Settings for the direct (non-bypass) HTTP client
#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    /// Maximum number of retry attempts for failed requests
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Initial retry delay in milliseconds
    #[serde(default = "default_initial_retry_delay")]
    pub initial_retry_delay_ms: u64,

    /// Maximum retry delay in milliseconds
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_ms: u64,

    /// Timeout for HTTP requests in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_true")]
    pub enable_cookies: bool,

    #[serde(default = "default_true")]
    pub enable_compression: bool,
}

fn default_true() -> bool { true }
fn default_bind() -> String { "127.0.0.1:8080".to_string() }
fn default_scheduler_interval() -> u64 { 300 }
fn default_max_concurrent() -> usize { 3 }
fn default_queue_max_depth() -> usize { 20 }
fn default_queue_timeout() -> u64 { 30_000 }
fn default_circuit_threshold() -> u32 { 5 }
fn default_circuit_cooldown() -> u64 { 60_000 }
fn default_slow_response() -> u64 { 45_000 }
fn default_slow_threshold() -> u32 { 3 }
fn default_hourly_limit() -> u32 { 60 }
fn default_bypass_url() -> String { "http://localhost:8191".to_string() }
fn default_bypass_max_timeout() -> u64 { 60_000 }
fn default_buffer() -> f64 { 0.5 }
fn default_percentile() -> f64 { 95.0 }
fn default_window() -> u64 { 3600 }
fn default_min_samples() -> usize { 5 }
fn default_max_samples() -> usize { 2000 }
fn default_refresh_interval() -> u64 { 60 }
fn default_timeout_ms() -> u64 { 8_000 }
fn default_floor_ms() -> u64 { 2_000 }
fn default_ceiling_ms() -> u64 { 20_000 }
fn default_cache_backend() -> CacheBackendKind { CacheBackendKind::Sqlite }
fn default_sqlite_path() -> String { "cache.db".to_string() }
fn default_ttl() -> u64 { 3600 }
fn default_stale_grace() -> u64 { 600 }
fn default_pg_host() -> String { "localhost".to_string() }
fn default_pg_port() -> u16 { 5432 }
fn default_pg_dbname() -> String { "source_cache".to_string() }
fn default_pg_user() -> String { "postgres".to_string() }
fn default_pg_pool_size() -> usize { 8 }
fn default_max_retries() -> usize { 2 }
fn default_initial_retry_delay() -> u64 { 500 }
fn default_max_retry_delay() -> u64 { 8000 }
fn default_http_timeout() -> u64 { 15 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            prewarm_providers: Vec::new(),
            scheduler_interval_secs: default_scheduler_interval(),
        }
    }
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            queue_max_depth: default_queue_max_depth(),
            queue_timeout_ms: default_queue_timeout(),
            circuit_failure_threshold: default_circuit_threshold(),
            circuit_cooldown_ms: default_circuit_cooldown(),
            slow_response_ms: default_slow_response(),
            slow_response_threshold: default_slow_threshold(),
            per_identity_hourly_limit: default_hourly_limit(),
        }
    }
}

impl GatekeeperConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_cooldown_ms)
    }

    pub fn slow_response(&self) -> Duration {
        Duration::from_millis(self.slow_response_ms)
    }
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            base_url: default_bypass_url(),
            max_timeout_ms: default_bypass_max_timeout(),
            session_reuse: true,
        }
    }
}

impl Default for AdaptiveTimeoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer: default_buffer(),
            percentile: default_percentile(),
            window_secs: default_window(),
            min_samples: default_min_samples(),
            max_samples_per_provider: default_max_samples(),
            refresh_interval_secs: default_refresh_interval(),
            default_timeout_ms: default_timeout_ms(),
            floor_ms: default_floor_ms(),
            ceiling_ms: default_ceiling_ms(),
            providers: HashMap::new(),
        }
    }
}

impl AdaptiveTimeoutConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// Bounds for `provider`, with per-provider overrides applied
    pub fn bounds_for(&self, provider: &str) -> ProviderTimeoutBounds {
        let o = self.providers.get(provider).cloned().unwrap_or_default();
        ProviderTimeoutBounds {
            default: Duration::from_millis(o.default_ms.unwrap_or(self.default_timeout_ms)),
            floor: Duration::from_millis(o.floor_ms.unwrap_or(self.floor_ms)),
            ceiling: Duration::from_millis(o.ceiling_ms.unwrap_or(self.ceiling_ms)),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            sqlite_path: default_sqlite_path(),
            postgres: PostgresConfig::default(),
            default_ttl_secs: default_ttl(),
            stale_while_revalidate: true,
            stale_grace_secs: default_stale_grace(),
        }
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_pg_host(),
            port: default_pg_port(),
            dbname: default_pg_dbname(),
            user: default_pg_user(),
            password: String::new(),
            pool_size: default_pg_pool_size(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_retry_delay_ms: default_initial_retry_delay(),
            max_retry_delay_ms: default_max_retry_delay(),
            timeout_secs: default_http_timeout(),
            enable_cookies: true,
            enable_compression: true,
        }
    }
}

impl HttpConfig {
    /// Create the direct HTTP client from this configuration
    pub fn create_http_client(&self) -> Result<crate::http_client::DirectClient, reqwest::Error> {
        use crate::http_client::{DirectClient, HttpClientConfig};

        let config = HttpClientConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            max_retries: self.max_retries,
            initial_retry_delay_ms: self.initial_retry_delay_ms,
            max_retry_delay_ms: self.max_retry_delay_ms,
            enable_cookies: self.enable_cookies,
            enable_gzip: self.enable_compression,
        };

        DirectClient::with_config(config)
    }
}

impl Config {
    /// Load `config.toml` from the working directory (defaults when absent),
    /// then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = Self::from_file(Path::new("config.toml"))?;
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str::<Config>(content)?)
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };

        if let Some(v) = env.string("BIND_ADDR") {
            self.server.bind = v;
        }
        if let Some(v) = env.string("FLARESOLVERR_URL") {
            self.bypass.base_url = v.trim_end_matches('/').to_string();
        }
        env.parse_into("BYPASS_MAX_TIMEOUT_MS", &mut self.bypass.max_timeout_ms)?;
        env.parse_into("BYPASS_SESSION_REUSE", &mut self.bypass.session_reuse)?;

        let gk = &mut self.gatekeeper;
        env.parse_into("BYPASS_MAX_CONCURRENT", &mut gk.max_concurrent)?;
        env.parse_into("BYPASS_QUEUE_MAX_DEPTH", &mut gk.queue_max_depth)?;
        env.parse_into("BYPASS_QUEUE_TIMEOUT_MS", &mut gk.queue_timeout_ms)?;
        env.parse_into("BYPASS_CIRCUIT_THRESHOLD", &mut gk.circuit_failure_threshold)?;
        env.parse_into("BYPASS_CIRCUIT_COOLDOWN_MS", &mut gk.circuit_cooldown_ms)?;
        env.parse_into("BYPASS_SLOW_RESPONSE_MS", &mut gk.slow_response_ms)?;
        env.parse_into("BYPASS_SLOW_RESPONSE_THRESHOLD", &mut gk.slow_response_threshold)?;
        env.parse_into("BYPASS_HOURLY_LIMIT", &mut gk.per_identity_hourly_limit)?;

        let at = &mut self.adaptive_timeout;
        env.parse_into("ADAPTIVE_TIMEOUT_ENABLED", &mut at.enabled)?;
        env.parse_into("ADAPTIVE_TIMEOUT_BUFFER", &mut at.buffer)?;
        env.parse_into("ADAPTIVE_TIMEOUT_WINDOW_SECS", &mut at.window_secs)?;
        env.parse_into("ADAPTIVE_TIMEOUT_MIN_SAMPLES", &mut at.min_samples)?;

        let cache = &mut self.cache;
        if let Some(v) = env.string("CACHE_BACKEND") {
            cache.backend = v.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "CACHE_BACKEND".to_string(),
                value: v.clone(),
            })?;
        }
        if let Some(v) = env.string("CACHE_SQLITE_PATH") {
            cache.sqlite_path = v;
        }
        env.parse_into("CACHE_DEFAULT_TTL_SECS", &mut cache.default_ttl_secs)?;
        env.parse_into("CACHE_STALE_WHILE_REVALIDATE", &mut cache.stale_while_revalidate)?;
        if let Some(v) = env.string("CACHE_PG_HOST") {
            cache.postgres.host = v;
        }
        env.parse_into("CACHE_PG_PORT", &mut cache.postgres.port)?;
        if let Some(v) = env.string("CACHE_PG_DB") {
            cache.postgres.dbname = v;
        }
        if let Some(v) = env.string("CACHE_PG_USER") {
            cache.postgres.user = v;
        }
        if let Some(v) = env.string("CACHE_PG_PASSWORD") {
            cache.postgres.password = v;
        }
        env.parse_into("CACHE_PG_POOL_SIZE", &mut cache.postgres.pool_size)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gatekeeper.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "gatekeeper.max_concurrent must be at least 1".to_string(),
            ));
        }
        let at = &self.adaptive_timeout;
        if at.buffer < 0.0 || !at.buffer.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "adaptive_timeout.buffer must be a non-negative number, got {}",
                at.buffer
            )));
        }
        if !(0.0..=100.0).contains(&at.percentile) {
            return Err(ConfigError::Invalid(format!(
                "adaptive_timeout.percentile must be within 0..=100, got {}",
                at.percentile
            )));
        }
        let mut names: Vec<&str> = vec![""];
        names.extend(at.providers.keys().map(String::as_str));
        for name in names {
            let b = at.bounds_for(name);
            if b.floor > b.ceiling {
                let label = if name.is_empty() { "default" } else { name };
                return Err(ConfigError::Invalid(format!(
                    "timeout floor {}ms exceeds ceiling {}ms for {}",
                    b.floor.as_millis(),
                    b.ceiling.as_millis(),
                    label
                )));
            }
        }
        Ok(())
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse_into<T: FromStr>(&self, key: &str, target: &mut T) -> Result<(), ConfigError> {
        if let Some(raw) = self.string(key) {
            *target = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value: raw.clone(),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.cache.backend, CacheBackendKind::Sqlite);
        assert_eq!(cfg.bypass.base_url, "http://localhost:8191");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg = Config::from_toml_str(
            r#"
            [gatekeeper]
            max_concurrent = 1

            [adaptive_timeout.providers.torrentio]
            floor_ms = 15000
            ceiling_ms = 40000
            "#,
        )
        .unwrap();

        assert_eq!(cfg.gatekeeper.max_concurrent, 1);
        assert_eq!(cfg.gatekeeper.queue_max_depth, 20);

        let bounds = cfg.adaptive_timeout.bounds_for("torrentio");
        assert_eq!(bounds.floor, Duration::from_millis(15_000));
        assert_eq!(bounds.ceiling, Duration::from_millis(40_000));
        assert_eq!(bounds.default, Duration::from_millis(8_000));

        let other = cfg.adaptive_timeout.bounds_for("other");
        assert_eq!(other.floor, Duration::from_millis(2_000));
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = Config::default();
        cfg.apply_env(env(&[
            ("BYPASS_MAX_CONCURRENT", "7"),
            ("BYPASS_HOURLY_LIMIT", "12"),
            ("CACHE_BACKEND", "postgres"),
            ("ADAPTIVE_TIMEOUT_BUFFER", "0.25"),
            ("FLARESOLVERR_URL", "http://solver:8191/"),
        ]))
        .unwrap();

        assert_eq!(cfg.gatekeeper.max_concurrent, 7);
        assert_eq!(cfg.gatekeeper.per_identity_hourly_limit, 12);
        assert_eq!(cfg.cache.backend, CacheBackendKind::Postgres);
        assert_eq!(cfg.adaptive_timeout.buffer, 0.25);
        assert_eq!(cfg.bypass.base_url, "http://solver:8191");
    }

    #[test]
    fn test_invalid_env_value_is_reported() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_env(env(&[("BYPASS_MAX_CONCURRENT", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { ref key, .. } if key == "BYPASS_MAX_CONCURRENT"));
    }

    #[test]
    fn test_floor_above_ceiling_rejected() {
        let cfg = Config::from_toml_str(
            r#"
            [adaptive_timeout.providers.slow]
            floor_ms = 50000
            ceiling_ms = 10000
            "#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut cfg = Config::default();
        cfg.gatekeeper.max_concurrent = 0;
        assert!(cfg.validate().is_err());
    }
}
