use actix_web::{test, web, App};
use serde_json::{json, Value};
use source_aggregator::app_state::AppState;
use source_aggregator::config::{CacheBackendKind, Config};
use source_aggregator::metrics::Outcome;
use source_aggregator::{scheduler, server};
use std::time::Duration;

async fn state(backend: CacheBackendKind, dir: &tempfile::TempDir) -> AppState {
    let mut config = Config::default();
    config.cache.backend = backend;
    config.cache.sqlite_path = dir.path().join("cache.db").display().to_string();
    config.server.prewarm_providers = vec!["configured".to_string()];
    AppState::build(config).await.expect("build app state")
}

#[actix_web::test]
async fn test_health_and_stats_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(CacheBackendKind::None, &dir).await;
    state.recorder.record("alpha", Duration::from_millis(120), Outcome::Success, 3);
    state.recorder.record("alpha", Duration::from_millis(900), Outcome::Timeout, 0);

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(server::configure),
    )
    .await;

    let req = test::TestRequest::get().uri("/health").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["cache_backend"], "disabled");
    assert_eq!(body["circuit"], "closed");

    let req = test::TestRequest::get().uri("/stats/providers").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["providers"][0]["provider"], "alpha");
    assert_eq!(body["providers"][0]["total_requests"], 2);
    assert_eq!(body["providers"][0]["timeout_count"], 1);
    assert_eq!(body["providers"][0]["success_rate"], "50.00%");

    let req = test::TestRequest::get().uri("/stats/gatekeeper").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["max_concurrent"], 3);
    assert_eq!(body["active_calls"], 0);
    assert_eq!(body["circuit"], "closed");

    let req = test::TestRequest::get().uri("/stats/timeouts").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["enabled"], true);
    assert_eq!(body["timeouts"], json!([]));
}

#[actix_web::test]
async fn test_delete_cache_entry() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(CacheBackendKind::Sqlite, &dir).await;
    assert!(
        state
            .cache
            .set("sources", "movie:tt1", &json!([1]), Duration::from_secs(60))
            .await
    );
    let data = web::Data::new(state);

    let app = test::init_service(
        App::new()
            .app_data(data.clone())
            .configure(server::configure),
    )
    .await;

    let req = test::TestRequest::delete()
        .uri("/cache/sources/movie:tt1")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 204);
    assert!(data.cache.get("sources", "movie:tt1").await.is_none());
}

#[actix_web::test]
async fn test_maintenance_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(CacheBackendKind::Sqlite, &dir).await;
    state
        .cache
        .set("sources", "old", &json!([1]), Duration::from_millis(10))
        .await;
    state
        .cache
        .set("sources", "new", &json!([2]), Duration::from_secs(60))
        .await;
    for _ in 0..5 {
        state.recorder.record("seen", Duration::from_millis(400), Outcome::Success, 1);
    }
    tokio::time::sleep(Duration::from_millis(30)).await;

    let report = scheduler::run_maintenance(&state).await;
    assert_eq!(report.purged_entries, 1);
    assert_eq!(report.prewarmed_providers, 2);

    let snapshot = state.governor.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].provider, "seen");
    // p95 of 400ms plus 50%, lifted to the 2s floor
    assert_eq!(snapshot[0].timeout_ms, 2_000);
}
