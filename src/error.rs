//! Error types shared across the aggregation layer.
//!
//! Only configuration and bypass errors reach callers as `Err`. Provider
//! failures and cache failures are absorbed by the orchestrator and the
//! cache wrapper respectively.

use std::sync::Arc;

/// Failure of a single provider task
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider timed out after {0}ms")]
    Timeout(u64),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("challenge page returned for {0}")]
    Challenge(String),

    #[error("bypass service error: {0}")]
    Bypass(#[from] BypassError),

    #[error("provider task panicked: {0}")]
    Panicked(String),
}

impl ProviderError {
    pub fn upstream(message: impl Into<String>) -> Self {
        ProviderError::Upstream(message.into())
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Upstream(e.to_string())
    }
}

/// Errors raised by cache backends. Never surfaced past the cache layer.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("postgres pool error: {0}")]
    Pool(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Error handed to every caller awaiting one coalesced fetch.
///
/// Cloned once per awaiter, so the source error is kept behind an `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("fetch failed: {0}")]
    Upstream(Arc<str>),

    #[error("cached value has unexpected shape: {0}")]
    Decode(Arc<str>),

    #[error("fetch task aborted: {0}")]
    Aborted(Arc<str>),
}

impl FetchError {
    pub fn upstream(message: impl std::fmt::Display) -> Self {
        FetchError::Upstream(message.to_string().into())
    }
}

impl From<ProviderError> for FetchError {
    fn from(e: ProviderError) -> Self {
        FetchError::upstream(e)
    }
}

/// Errors from the challenge bypass client
#[derive(Debug, thiserror::Error)]
pub enum BypassError {
    #[error("bypass slot rejected: {0}")]
    Rejected(#[from] crate::gatekeeper::Rejection),

    #[error("bypass request timed out after {0}ms")]
    Timeout(u64),

    #[error("bypass transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bypass service returned status '{status}': {message}")]
    Service { status: String, message: String },

    #[error("bypass response missing solution")]
    MissingSolution,

    #[error("invalid url '{0}'")]
    InvalidUrl(String),
}

/// Errors raised while loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: '{value}'")]
    InvalidEnv { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failures that stop the process from starting
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Bypass(#[from] BypassError),
}
