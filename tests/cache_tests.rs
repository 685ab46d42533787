use serde_json::json;
use source_aggregator::cache::{
    open_backend, CacheBackend, CachePolicy, CacheStore, PostgresBackend, SqliteBackend,
};
use source_aggregator::config::{CacheBackendKind, CacheConfig, PostgresConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn temp_sqlite() -> (tempfile::TempDir, Arc<SqliteBackend>) {
    let dir = tempfile::tempdir().expect("temp dir");
    let backend = SqliteBackend::open(dir.path().join("cache.db")).expect("open sqlite cache");
    (dir, Arc::new(backend))
}

#[tokio::test]
async fn test_ttl_expiry_deletes_record() {
    let (_dir, backend) = temp_sqlite();
    let store = CacheStore::new(backend.clone());

    assert!(store.set("ns", "k", &json!(["v"]), Duration::from_millis(1_000)).await);
    let hit = store.get("ns", "k").await.expect("fresh value");
    assert_eq!(hit.value, json!(["v"]));

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert!(store.get("ns", "k").await.is_none());
    assert_eq!(backend.entry_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_values_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    {
        let backend = SqliteBackend::open(&path).unwrap();
        backend
            .set("sources", "movie:tt1", &json!({"n": 1}), Duration::from_secs(60))
            .await
            .unwrap();
    }
    let reopened = SqliteBackend::open(&path).unwrap();
    let hit = reopened.get("sources", "movie:tt1").await.unwrap().unwrap();
    assert_eq!(hit.value, json!({"n": 1}));
}

#[tokio::test]
async fn test_hit_performs_no_fetch() {
    let (_dir, backend) = temp_sqlite();
    let store = CacheStore::new(backend);
    let calls = Arc::new(AtomicUsize::new(0));
    let policy = CachePolicy::new(Duration::from_secs(60));

    for _ in 0..3 {
        let calls = calls.clone();
        let value: Vec<String> = store
            .get_or_fetch("ns", "title", policy, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(vec!["1080p".to_string()])
            })
            .await
            .unwrap();
        assert_eq!(value, vec!["1080p".to_string()]);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_share_one_fetch() {
    let (_dir, backend) = temp_sqlite();
    let store = CacheStore::new(backend);
    let calls = Arc::new(AtomicUsize::new(0));
    let policy = CachePolicy::new(Duration::from_secs(60));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let store = store.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                store
                    .get_or_fetch("ns", "hot", policy, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok::<_, String>(vec![42u32])
                    })
                    .await
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), vec![42]);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.inflight_count(), 0);
}

#[tokio::test]
async fn test_fetch_error_reaches_every_waiter() {
    let store = CacheStore::disabled();
    let policy = CachePolicy::new(Duration::from_secs(60));

    let callers = (0..3).map(|_| {
        let store = store.clone();
        async move {
            store
                .get_or_fetch("ns", "k", policy, || async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Err::<Vec<u32>, _>("upstream 503")
                })
                .await
        }
    });
    for result in futures_util::future::join_all(callers).await {
        assert!(result.unwrap_err().to_string().contains("upstream 503"));
    }
    assert_eq!(store.inflight_count(), 0);
}

#[tokio::test]
async fn test_open_backend_disabled() {
    let config = CacheConfig {
        backend: CacheBackendKind::None,
        ..CacheConfig::default()
    };
    let backend = open_backend(&config).await.unwrap();
    assert!(!backend.is_enabled());
    assert!(!CacheStore::new(backend).is_enabled());
}

fn pg_test_config() -> Option<PostgresConfig> {
    let host = std::env::var("CACHE_TEST_PG_HOST").ok()?;
    let defaults = PostgresConfig::default();
    Some(PostgresConfig {
        host,
        port: std::env::var("CACHE_TEST_PG_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(defaults.port),
        dbname: std::env::var("CACHE_TEST_PG_DB").unwrap_or(defaults.dbname),
        user: std::env::var("CACHE_TEST_PG_USER").unwrap_or(defaults.user),
        password: std::env::var("CACHE_TEST_PG_PASSWORD").unwrap_or_default(),
        pool_size: 2,
    })
}

#[tokio::test]
async fn test_postgres_backend_roundtrip() {
    let Some(config) = pg_test_config() else {
        eprintln!("Skipping PostgreSQL cache test: CACHE_TEST_PG_HOST not set");
        return;
    };
    let backend = PostgresBackend::connect(&config).await.expect("connect");
    let key = format!("roundtrip-{}", uuid::Uuid::new_v4());

    backend
        .set("test", &key, &json!({"a": 1}), Duration::from_secs(60))
        .await
        .unwrap();
    backend
        .set("test", &key, &json!({"a": 2}), Duration::from_secs(60))
        .await
        .unwrap();
    let hit = backend.get("test", &key).await.unwrap().unwrap();
    assert_eq!(hit.value, json!({"a": 2}));
    assert!(hit.created_at <= hit.updated_at);

    backend.delete("test", &key).await.unwrap();
    assert!(backend.get("test", &key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_postgres_ttl_expiry() {
    let Some(config) = pg_test_config() else {
        eprintln!("Skipping PostgreSQL cache test: CACHE_TEST_PG_HOST not set");
        return;
    };
    let backend = PostgresBackend::connect(&config).await.expect("connect");
    let key = format!("ttl-{}", uuid::Uuid::new_v4());

    backend
        .set("test", &key, &json!("v"), Duration::from_millis(1_000))
        .await
        .unwrap();
    assert!(backend.get("test", &key).await.unwrap().is_some());
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert!(backend.get("test", &key).await.unwrap().is_none());
}
