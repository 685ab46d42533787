use super::{expiry_millis, now_millis, CacheBackend, CacheHit};
use crate::config::PostgresConfig;
use crate::error::CacheError;
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Object, Pool, PoolConfig, RecyclingMethod, Runtime};
use log::info;
use std::time::Duration;
use tokio_postgres::NoTls;

/// Shared cache backed by a PostgreSQL connection pool
pub struct PostgresBackend {
    pool: Pool,
}

/// Creates a PostgreSQL connection pool from the cache settings
pub fn create_pool(settings: &PostgresConfig) -> Result<Pool, CacheError> {
    info!(
        "Creating PostgreSQL connection pool ({}:{}/{})...",
        settings.host, settings.port, settings.dbname
    );

    let mut cfg = Config::new();
    cfg.host = Some(settings.host.clone());
    cfg.port = Some(settings.port);
    cfg.dbname = Some(settings.dbname.clone());
    cfg.user = Some(settings.user.clone());
    cfg.password = Some(settings.password.clone());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(PoolConfig::new(settings.pool_size.max(1)));

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| CacheError::Pool(e.to_string()))
}

impl PostgresBackend {
    /// Build the pool and make sure the cache table exists
    pub async fn connect(settings: &PostgresConfig) -> Result<Self, CacheError> {
        let backend = Self {
            pool: create_pool(settings)?,
        };
        backend.ensure_schema().await?;
        info!("PostgreSQL cache ready");
        Ok(backend)
    }

    async fn client(&self) -> Result<Object, CacheError> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Pool(e.to_string()))
    }

    async fn ensure_schema(&self) -> Result<(), CacheError> {
        let client = self.client().await?;
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS cache_entries (
                    namespace TEXT NOT NULL,
                    key TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at BIGINT NOT NULL,
                    updated_at BIGINT NOT NULL,
                    expires_at BIGINT NOT NULL,
                    PRIMARY KEY (namespace, key)
                );
                CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_entries(expires_at);",
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheHit>, CacheError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT payload, created_at, updated_at, expires_at FROM cache_entries
                 WHERE namespace = $1 AND key = $2",
                &[&namespace, &key],
            )
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expires_at: i64 = row.get(3);
        if expires_at <= now_millis() {
            client
                .execute(
                    "DELETE FROM cache_entries WHERE namespace = $1 AND key = $2",
                    &[&namespace, &key],
                )
                .await?;
            return Ok(None);
        }

        let payload: String = row.get(0);
        let value = serde_json::from_str(&payload)?;
        Ok(Some(CacheHit::from_millis(value, row.get(1), row.get(2), expires_at)))
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let payload = serde_json::to_string(value)?;
        let now = now_millis();
        let expires_at = expiry_millis(now, ttl);

        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO cache_entries (namespace, key, payload, created_at, updated_at, expires_at)
                 VALUES ($1, $2, $3, $4, $4, $5)
                 ON CONFLICT (namespace, key) DO UPDATE SET
                    payload = EXCLUDED.payload,
                    updated_at = EXCLUDED.updated_at,
                    expires_at = EXCLUDED.expires_at",
                &[&namespace, &key, &payload, &now, &expires_at],
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), CacheError> {
        let client = self.client().await?;
        client
            .execute(
                "DELETE FROM cache_entries WHERE namespace = $1 AND key = $2",
                &[&namespace, &key],
            )
            .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, CacheError> {
        let client = self.client().await?;
        let removed = client
            .execute(
                "DELETE FROM cache_entries WHERE expires_at <= $1",
                &[&now_millis()],
            )
            .await?;
        Ok(removed)
    }
}
