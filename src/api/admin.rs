//! Admin API (port 8081) — operator-facing introspection endpoints.
//!
//! These endpoints are separated onto a different port so they can be
//! network-restricted independently of the client API (e.g. accessible only
//! from the internal Docker network, never exposed to the internet). All of
//! them are read-only.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::AppState;

/// Build the admin-facing axum router (port 8081).
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/admin/health", get(health))
        .route("/admin/traffic", get(traffic))
        .route("/admin/config", get(config))
        .route("/admin/cooldowns", get(cooldowns))
        .route("/admin/metrics", get(crate::api::metrics::metrics))
        .with_state(state)
}

/// GET /admin/health — liveness plus a coarse config summary.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cfg = state.config();
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "backends": cfg.backends.len(),
        "models": cfg.models.len(),
    }))
}

#[derive(Deserialize)]
pub struct TrafficQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}
fn default_limit() -> usize {
    100
}

/// GET /admin/traffic?limit=N — recent N traffic entries (default 100)
pub async fn traffic(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TrafficQuery>,
) -> impl IntoResponse {
    let entries = state.traffic.recent(q.limit).await;
    let stats = state.traffic.stats().await;
    Json(json!({
        "stats": stats,
        "entries": entries,
    }))
}

/// GET /admin/cooldowns — active (backend, model) suppressions.
pub async fn cooldowns(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let active = state.engine.cooldowns.snapshot();
    Json(json!({
        "count": active.len(),
        "entries": active,
    }))
}

/// GET /admin/config — returns the current config with secrets redacted
pub async fn config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cfg = state.config();

    // Redact secrets — show env var name but not its resolved value
    let mut backends: Vec<Value> = cfg
        .backends
        .iter()
        .map(|(id, b)| {
            json!({
                "id": id,
                "base_url": b.base_url,
                "api_key_env": b.api_key_env,
                "protocol": b.protocol.to_string(),
                "enabled": b.enabled,
                "timeout_ms": b.timeout_ms,
                "locale": b.locale,
            })
        })
        .collect();
    backends.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));

    let models: Value = cfg
        .models
        .iter()
        .map(|(alias, model)| {
            let routes: Vec<Value> = model
                .routes
                .iter()
                .map(|r| {
                    json!({
                        "backend": r.backend,
                        "model": r.model,
                        "priority": r.priority,
                        "enabled": r.enabled,
                        "protocol": r.protocol.map(|p| p.to_string()),
                        "reasoning": r.reasoning,
                    })
                })
                .collect();
            (alias.clone(), json!({ "enabled": model.enabled, "routes": routes }))
        })
        .collect::<serde_json::Map<_, _>>()
        .into();

    Json(json!({
        "gateway": {
            "client_port": cfg.gateway.client_port,
            "admin_port": cfg.gateway.admin_port,
            "traffic_log_capacity": cfg.gateway.traffic_log_capacity,
            "max_capture_bytes": cfg.gateway.max_capture_bytes,
        },
        "backends": backends,
        "models": models,
        "fallback": cfg.fallback,
        "load_balancer": { "strategy": cfg.load_balancer.strategy.to_string() },
        "retry": {
            "max_retries": cfg.retry.max_retries,
            "enable_backoff": cfg.retry.enable_backoff,
            "initial_delay_ms": cfg.retry.initial_delay_ms,
            "max_delay_ms": cfg.retry.max_delay_ms,
            "multiplier": cfg.retry.multiplier,
            "jitter": cfg.retry.jitter,
        },
        "system_prompts": cfg.system_prompts.keys().collect::<Vec<_>>(),
    }))
}
