//! Pluggable TTL cache.
//!
//! Backends implement [`CacheBackend`] and report their errors honestly;
//! [`CacheStore`] wraps whichever backend was selected at startup, swallows
//! those errors (the cache is an optimisation, never a dependency) and adds
//! in-flight request coalescing and stale-while-revalidate on top.

pub mod postgres;
pub mod sqlite;
pub mod store;

use crate::config::{CacheBackendKind, CacheConfig};
use crate::error::CacheError;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;
pub use store::{CachePolicy, CacheStore};

/// A live record read back from a backend
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheHit {
    fn from_millis(
        value: serde_json::Value,
        created_at: i64,
        updated_at: i64,
        expires_at: i64,
    ) -> Self {
        Self {
            value,
            created_at: from_millis(created_at),
            updated_at: from_millis(updated_at),
            expires_at: from_millis(expires_at),
        }
    }

    /// Time since the record was last written
    pub fn age(&self) -> Duration {
        (Utc::now() - self.updated_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Storage engine behind the cache. Identity of a record is
/// `(namespace, key)`; `set` is an upsert and `get` treats records past
/// their expiry as missing and deletes them.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_enabled(&self) -> bool {
        true
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheHit>, CacheError>;

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), CacheError>;

    /// Remove every expired record, returning how many were removed
    async fn purge_expired(&self) -> Result<u64, CacheError>;
}

/// Backend used when caching is switched off
pub struct DisabledBackend;

#[async_trait]
impl CacheBackend for DisabledBackend {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn get(&self, _namespace: &str, _key: &str) -> Result<Option<CacheHit>, CacheError> {
        Ok(None)
    }

    async fn set(
        &self,
        _namespace: &str,
        _key: &str,
        _value: &serde_json::Value,
        _ttl: Duration,
    ) -> Result<(), CacheError> {
        Ok(())
    }

    async fn delete(&self, _namespace: &str, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, CacheError> {
        Ok(0)
    }
}

/// Select and open the configured backend. Called once at startup.
pub async fn open_backend(config: &CacheConfig) -> Result<Arc<dyn CacheBackend>, CacheError> {
    let backend: Arc<dyn CacheBackend> = match config.backend {
        CacheBackendKind::Sqlite => Arc::new(SqliteBackend::open(&config.sqlite_path)?),
        CacheBackendKind::Postgres => Arc::new(PostgresBackend::connect(&config.postgres).await?),
        CacheBackendKind::None => Arc::new(DisabledBackend),
    };
    log::info!("Cache backend: {}", backend.name());
    Ok(backend)
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn expiry_millis(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_backend_never_hits() {
        let backend = DisabledBackend;
        assert!(!backend.is_enabled());
        backend
            .set("ns", "k", &serde_json::json!([1, 2]), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(backend.get("ns", "k").await.unwrap().is_none());
    }

    #[test]
    fn test_expiry_saturates() {
        assert_eq!(expiry_millis(1_000, Duration::from_millis(500)), 1_500);
        assert_eq!(expiry_millis(1, Duration::MAX), i64::MAX);
    }
}
