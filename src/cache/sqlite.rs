use super::{expiry_millis, now_millis, CacheBackend, CacheHit};
use crate::error::CacheError;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Embedded single-file cache backed by SQLite.
///
/// The connection lives behind a mutex and every statement runs on the
/// blocking pool.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        log::info!("Opened SQLite cache at {}", path.as_ref().display());
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, CacheError> {
        create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, CacheError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        let result = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&conn)
        })
        .await?;
        Ok(result?)
    }

    /// Number of stored records, expired ones included
    pub async fn entry_count(&self) -> Result<u64, CacheError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
        })
        .await
    }
}

fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS cache_entries (
            namespace TEXT NOT NULL,
            key TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            PRIMARY KEY (namespace, key)
        );",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_entries(expires_at);",
        [],
    )?;
    Ok(())
}

#[async_trait]
impl CacheBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<CacheHit>, CacheError> {
        let (ns, k) = (namespace.to_string(), key.to_string());
        let row = self
            .with_conn(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT payload, created_at, updated_at, expires_at FROM cache_entries
                         WHERE namespace = ?1 AND key = ?2",
                        params![ns, k],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, i64>(1)?,
                                row.get::<_, i64>(2)?,
                                row.get::<_, i64>(3)?,
                            ))
                        },
                    )
                    .optional()?;

                match row {
                    Some((_, _, _, expires_at)) if expires_at <= now_millis() => {
                        conn.execute(
                            "DELETE FROM cache_entries WHERE namespace = ?1 AND key = ?2",
                            params![ns, k],
                        )?;
                        Ok(None)
                    }
                    other => Ok(other),
                }
            })
            .await?;

        match row {
            Some((payload, created_at, updated_at, expires_at)) => {
                let value = serde_json::from_str(&payload)?;
                Ok(Some(CacheHit::from_millis(value, created_at, updated_at, expires_at)))
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let payload = serde_json::to_string(value)?;
        let (ns, k) = (namespace.to_string(), key.to_string());
        self.with_conn(move |conn| {
            let now = now_millis();
            conn.execute(
                "INSERT INTO cache_entries (namespace, key, payload, created_at, updated_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?4, ?5)
                 ON CONFLICT(namespace, key) DO UPDATE SET
                    payload = excluded.payload,
                    updated_at = excluded.updated_at,
                    expires_at = excluded.expires_at",
                params![ns, k, payload, now, expiry_millis(now, ttl)],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), CacheError> {
        let (ns, k) = (namespace.to_string(), key.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM cache_entries WHERE namespace = ?1 AND key = ?2",
                params![ns, k],
            )
            .map(|_| ())
        })
        .await
    }

    async fn purge_expired(&self) -> Result<u64, CacheError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM cache_entries WHERE expires_at <= ?1",
                params![now_millis()],
            )
            .map(|n| n as u64)
        })
        .await
    }
}
