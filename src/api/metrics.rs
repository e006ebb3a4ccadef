//! Prometheus-compatible `/admin/metrics` endpoint.
//!
//! Window metrics are derived from the in-memory ring-buffer: because the
//! buffer has a fixed capacity, those values represent a **sliding window**
//! of recent requests rather than lifetime counters, so they use `TYPE gauge`.
//! The engine counters at the bottom are true monotonic totals.
//!
//! Metric families:
//! - `llr_window_size`            — entries currently in the ring buffer
//! - `llr_requests`               — per-alias/backend/outcome request counts
//! - `llr_latency_ms_sum`         — sum of latencies per alias/backend (for avg)
//! - `llr_latency_ms_count`       — denominator matching the sum above
//! - `llr_cooldown_active`        — currently suppressed (backend, model) pairs
//! - `llr_rate_limit_buckets`     — caller completion budgets currently tracked
//! - `llr_backend_errors_total`   — upstream attempt failures since start
//! - `llr_retries_total`          — retry attempts since start
//! - `llr_cooldowns_total`        — cooldowns triggered since start

use std::{collections::HashMap, sync::atomic::Ordering, sync::Arc};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};

use crate::api::AppState;

/// `GET /admin/metrics` — renders Prometheus text format.
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    // Grab the full ring-buffer window in one lock acquisition.
    let entries = state.traffic.recent(usize::MAX).await;

    // --- aggregate ---
    let window_size = entries.len();

    // (alias, backend, success) → count
    let mut request_counts: HashMap<(String, String, bool), u64> = HashMap::new();
    // (alias, backend) → (latency_sum_ms, count)
    let mut latency: HashMap<(String, String), (u64, u64)> = HashMap::new();

    for e in &entries {
        let backend = e.backend.clone().unwrap_or_else(|| "unknown".to_string());
        *request_counts
            .entry((e.alias.clone(), backend.clone(), e.success))
            .or_default() += 1;

        let lat = latency.entry((e.alias.clone(), backend)).or_default();
        lat.0 += e.latency_ms;
        lat.1 += 1;
    }

    // --- render ---
    let mut out = String::with_capacity(1024);

    // window_size
    out.push_str("# HELP llr_window_size Number of requests currently held in the ring-buffer window.\n");
    out.push_str("# TYPE llr_window_size gauge\n");
    out.push_str(&format!("llr_window_size {window_size}\n\n"));

    // request counts
    out.push_str("# HELP llr_requests Request count in the current window, labelled by alias, backend, and outcome.\n");
    out.push_str("# TYPE llr_requests gauge\n");
    let mut req_rows: Vec<_> = request_counts.iter().collect();
    req_rows.sort_by(|a, b| a.0.cmp(b.0));
    for ((alias, backend, success), count) in req_rows {
        let success_str = if *success { "true" } else { "false" };
        out.push_str(&format!(
            "llr_requests{{alias=\"{alias}\",backend=\"{backend}\",success=\"{success_str}\"}} {count}\n"
        ));
    }
    out.push('\n');

    // latency sum + count
    out.push_str("# HELP llr_latency_ms_sum Sum of request latency (ms) in the current window, grouped by alias and backend.\n");
    out.push_str("# TYPE llr_latency_ms_sum gauge\n");
    out.push_str("# HELP llr_latency_ms_count Number of observations for the latency sum above.\n");
    out.push_str("# TYPE llr_latency_ms_count gauge\n");
    let mut lat_rows: Vec<_> = latency.iter().collect();
    lat_rows.sort_by(|a, b| a.0.cmp(b.0));
    for ((alias, backend), (sum, count)) in lat_rows {
        out.push_str(&format!(
            "llr_latency_ms_sum{{alias=\"{alias}\",backend=\"{backend}\"}} {sum}\n"
        ));
        out.push_str(&format!(
            "llr_latency_ms_count{{alias=\"{alias}\",backend=\"{backend}\"}} {count}\n"
        ));
    }
    out.push('\n');

    // active cooldowns
    let active_cooldowns = state.engine.cooldowns.snapshot().len();
    out.push_str("# HELP llr_cooldown_active Currently suppressed (backend, model) pairs.\n");
    out.push_str("# TYPE llr_cooldown_active gauge\n");
    out.push_str(&format!("llr_cooldown_active {active_cooldowns}\n\n"));

    // caller completion budgets
    let budgets = state
        .rate_limiter
        .as_ref()
        .map(|limiter| limiter.active_buckets())
        .unwrap_or(0);
    out.push_str("# HELP llr_rate_limit_buckets Caller completion budgets currently tracked.\n");
    out.push_str("# TYPE llr_rate_limit_buckets gauge\n");
    out.push_str(&format!("llr_rate_limit_buckets {budgets}\n\n"));

    // engine counters — true monotonic totals
    let counters = &state.engine.counters;
    out.push_str("# HELP llr_backend_errors_total Upstream attempt failures since start.\n");
    out.push_str("# TYPE llr_backend_errors_total counter\n");
    out.push_str(&format!(
        "llr_backend_errors_total {}\n\n",
        counters.backend_errors.load(Ordering::Relaxed)
    ));

    out.push_str("# HELP llr_retries_total Retry attempts since start.\n");
    out.push_str("# TYPE llr_retries_total counter\n");
    out.push_str(&format!("llr_retries_total {}\n\n", counters.retries.load(Ordering::Relaxed)));

    out.push_str("# HELP llr_cooldowns_total Cooldowns triggered since start.\n");
    out.push_str("# TYPE llr_cooldowns_total counter\n");
    out.push_str(&format!(
        "llr_cooldowns_total {}\n",
        counters.cooldowns_set.load(Ordering::Relaxed)
    ));

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        out,
    )
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, sync::Arc, time::Duration};

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::{
        api::AppState,
        config::Config,
        traffic::{TrafficEntry, TrafficLog},
    };

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(
            Arc::new(Config::default()),
            PathBuf::default(),
            Arc::new(TrafficLog::new(100)),
        ))
    }

    async fn render(state: Arc<AppState>) -> String {
        let resp = crate::api::admin::router(state)
            .oneshot(Request::get("/admin/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn renders_window_and_request_families() {
        let state = state();
        state
            .traffic
            .push(TrafficEntry::new("m/a".into(), 120, true).with_backend("b1"));
        state
            .traffic
            .push(TrafficEntry::new("m/a".into(), 80, false).with_backend("b1").with_error("500"));

        let out = render(state).await;
        assert!(out.contains("llr_window_size 2"));
        assert!(out.contains("llr_requests{alias=\"m/a\",backend=\"b1\",success=\"true\"} 1"));
        assert!(out.contains("llr_requests{alias=\"m/a\",backend=\"b1\",success=\"false\"} 1"));
        assert!(out.contains("llr_latency_ms_sum{alias=\"m/a\",backend=\"b1\"} 200"));
        assert!(out.contains("llr_latency_ms_count{alias=\"m/a\",backend=\"b1\"} 2"));
    }

    #[tokio::test]
    async fn renders_cooldown_and_engine_counters() {
        let state = state();
        state.engine.cooldowns.set_cooldown("b1", "m", Duration::from_secs(30));
        state
            .engine
            .counters
            .backend_errors
            .store(7, std::sync::atomic::Ordering::Relaxed);

        let out = render(state).await;
        assert!(out.contains("llr_cooldown_active 1"));
        assert!(out.contains("llr_backend_errors_total 7"));
        assert!(out.contains("llr_retries_total 0"));
    }

    #[tokio::test]
    async fn entries_without_backend_use_unknown_label() {
        let state = state();
        state.traffic.push(TrafficEntry::new("m/a".into(), 10, false).with_error("no backend"));

        let out = render(state).await;
        assert!(out.contains("backend=\"unknown\""));
    }

    #[tokio::test]
    async fn rate_limit_bucket_gauge_tracks_active_callers() {
        // No limiter configured — gauge renders zero.
        let out = render(state()).await;
        assert!(out.contains("llr_rate_limit_buckets 0"));

        // With a limiter, each distinct caller shows up as one budget.
        let config: Config = toml::from_str("[gateway]\nrate_limit_rpm = 60").unwrap();
        let state = Arc::new(AppState::new(
            Arc::new(config),
            PathBuf::default(),
            Arc::new(TrafficLog::new(100)),
        ));
        let limiter = state.rate_limiter.as_ref().expect("limiter should be built");
        limiter.check(crate::api::rate_limit::CallerKey::Credential(1));
        limiter.check(crate::api::rate_limit::CallerKey::Credential(2));

        let out = render(state).await;
        assert!(out.contains("llr_rate_limit_buckets 2"));
    }
}
