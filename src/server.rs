//! Diagnostics HTTP endpoints.

use crate::app_state::AppState;
use actix_web::{delete, get, web, HttpResponse, Responder};
use log::{error, info};
use serde_json::json;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(provider_stats)
        .service(timeout_stats)
        .service(gatekeeper_stats)
        .service(list_bypass_sessions)
        .service(destroy_bypass_session)
        .service(delete_cache_entry);
}

#[get("/health")]
async fn health(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "cache_backend": data.cache.backend_name(),
        "circuit": data.gatekeeper.circuit_state(),
    }))
}

#[get("/stats/providers")]
async fn provider_stats(data: web::Data<AppState>) -> impl Responder {
    let providers: Vec<serde_json::Value> = data
        .recorder
        .all_stats()
        .into_iter()
        .map(|m| {
            json!({
                "provider": m.provider,
                "success_rate": format!("{:.2}%", m.success_rate()),
                "total_requests": m.total_requests,
                "successful_requests": m.successful_requests,
                "timeout_count": m.timeout_count,
                "error_count": m.error_count,
                "total_results": m.total_results,
                "average_response_time_ms": format!("{:.2}", m.average_response_time_ms),
                "p50_ms": m.p50_ms,
                "p95_ms": m.p95_ms,
                "last_success": m.last_success,
                "last_failure": m.last_failure,
                "last_error": m.last_error,
            })
        })
        .collect();

    HttpResponse::Ok().json(json!({
        "providers": providers,
        "count": providers.len(),
    }))
}

#[get("/stats/timeouts")]
async fn timeout_stats(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(json!({
        "enabled": data.config.adaptive_timeout.enabled,
        "default_timeout_ms": data.config.adaptive_timeout.default_timeout_ms,
        "timeouts": data.governor.snapshot(),
    }))
}

#[get("/stats/gatekeeper")]
async fn gatekeeper_stats(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(data.gatekeeper.status())
}

#[get("/bypass/sessions")]
async fn list_bypass_sessions(data: web::Data<AppState>) -> impl Responder {
    let local: Vec<serde_json::Value> = data
        .bypass
        .local_sessions()
        .into_iter()
        .map(|(domain, session)| json!({"domain": domain, "session": session}))
        .collect();

    match data.bypass.list_sessions().await {
        Ok(remote) => HttpResponse::Ok().json(json!({"local": local, "remote": remote})),
        Err(e) => {
            error!("Failed to list bypass sessions: {}", e);
            HttpResponse::BadGateway().json(json!({"local": local, "error": e.to_string()}))
        }
    }
}

#[delete("/bypass/sessions/{session}")]
async fn destroy_bypass_session(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let session = path.into_inner();
    match data.bypass.destroy_session(&session).await {
        Ok(()) => {
            info!("Destroyed bypass session {}", session);
            HttpResponse::NoContent().finish()
        }
        Err(e) => {
            error!("Failed to destroy bypass session {}: {}", session, e);
            HttpResponse::BadGateway().json(json!({"error": e.to_string()}))
        }
    }
}

#[delete("/cache/{namespace}/{key}")]
async fn delete_cache_entry(
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> impl Responder {
    let (namespace, key) = path.into_inner();
    if !data.cache.is_enabled() {
        return HttpResponse::NotFound().json(json!({"error": "cache disabled"}));
    }
    data.cache.delete(&namespace, &key).await;
    info!("Invalidated cache entry {}/{}", namespace, key);
    HttpResponse::NoContent().finish()
}
