//! Completion-budget rate limiting for the client port.
//!
//! Only dispatch work is metered: `POST /v1/chat/completions` and
//! `POST /v1/messages` each cost one token, while health probes, model
//! listings, and other read-only traffic pass free. Budgets belong to the
//! caller's credential when one is presented (so a fleet of agents behind one
//! NAT doesn't share a single budget, and one noisy key can't starve the
//! others), falling back to the peer IP for unauthenticated setups.
//!
//! Tokens refill at `rpm / 60` per second. The burst allowance is ten
//! seconds of budget (`rpm / 6`, minimum one call) — completions are
//! expensive upstream, so short spikes are absorbed but a full minute can
//! never land at once. Disabled when `rate_limit_rpm` is absent.
//!
//! A rejected request receives the proxy's standard error envelope with code
//! `RATE_LIMIT_ERROR`, a `Retry-After` header, and the `X-RateLimit-*`
//! budget headers that metered successes also carry.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Instant,
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use tracing::debug;

use crate::{
    api::AppState,
    error::{ErrorKind, ProxyError},
};

/// Who a completion budget belongs to.
///
/// Credentials are stored as a hash so raw API keys never sit in the bucket
/// map; collisions merely merge two budgets, which fails safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallerKey {
    Credential(u64),
    Ip(IpAddr),
}

impl CallerKey {
    /// Derive the bucket key for a request: the Bearer / `x-api-key`
    /// credential when one is offered, the connecting IP otherwise.
    fn for_request(req: &Request) -> Self {
        let credential = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .or_else(|| req.headers().get("x-api-key").and_then(|v| v.to_str().ok()))
            .filter(|v| !v.is_empty());

        if let Some(credential) = credential {
            let mut hasher = DefaultHasher::new();
            credential.hash(&mut hasher);
            return Self::Credential(hasher.finish());
        }
        let ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|c| c.0.ip())
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        Self::Ip(ip)
    }
}

/// Per-caller token bucket state.
struct Bucket {
    last_refill: Instant,
    /// Fractional to avoid refill drift.
    tokens: f64,
}

/// Outcome of spending one token.
pub enum Decision {
    /// Request may proceed; `remaining` whole tokens are left in the bucket.
    Allowed { remaining: u32 },
    /// Budget exhausted; the bucket has a full token again after the wait.
    Limited { retry_after_secs: u64 },
}

/// Shared completion-budget limiter: one token bucket per [`CallerKey`].
pub struct RateLimiter {
    /// Configured limit in completions per minute.
    pub rpm: u32,
    /// Token refill rate (tokens / second = rpm / 60).
    fill_rate: f64,
    /// Burst cap: ten seconds of budget, never less than one call.
    burst: f64,
    buckets: DashMap<CallerKey, Bucket>,
}

impl RateLimiter {
    pub fn new(rpm: u32) -> Self {
        Self {
            rpm,
            fill_rate: rpm as f64 / 60.0,
            burst: (rpm as f64 / 6.0).max(1.0),
            buckets: DashMap::new(),
        }
    }

    /// Spend one token from the caller's bucket.
    pub fn check(&self, key: CallerKey) -> Decision {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(key).or_insert_with(|| Bucket {
            last_refill: now,
            tokens: self.burst,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        let refilled = (bucket.tokens + elapsed * self.fill_rate).min(self.burst);

        if refilled < 1.0 {
            let wait = (1.0 - refilled) / self.fill_rate;
            return Decision::Limited { retry_after_secs: wait.ceil() as u64 };
        }

        bucket.last_refill = now;
        bucket.tokens = refilled - 1.0;
        Decision::Allowed { remaining: bucket.tokens.floor() as u32 }
    }

    /// Number of caller budgets currently tracked, for the metrics endpoint.
    pub fn active_buckets(&self) -> usize {
        self.buckets.len()
    }
}

/// True for requests that perform dispatch work and therefore cost a token.
fn is_metered(req: &Request) -> bool {
    req.method() == Method::POST
        && matches!(req.uri().path(), "/v1/chat/completions" | "/v1/messages")
}

/// Axum middleware enforcing the completion budget.
///
/// No-ops when `state.rate_limiter` is `None` and for unmetered paths.
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(limiter) = &state.rate_limiter else {
        return next.run(req).await;
    };
    if !is_metered(&req) {
        return next.run(req).await;
    }

    let key = CallerKey::for_request(&req);
    match limiter.check(key) {
        Decision::Allowed { remaining } => {
            let mut response = next.run(req).await;
            set_budget_headers(&mut response, limiter.rpm, remaining);
            response
        }
        Decision::Limited { retry_after_secs } => {
            debug!(?key, retry_after_secs, "completion budget exhausted");
            let mut err = ProxyError::new(
                ErrorKind::RateLimited,
                "completion budget exhausted; retry after the indicated delay",
            );
            err.retry_after_secs = Some(retry_after_secs);
            let mut response = err.into_response();
            set_budget_headers(&mut response, limiter.rpm, 0);
            response
        }
    }
}

fn set_budget_headers(response: &mut Response, rpm: u32, remaining: u32) {
    if let Ok(value) = HeaderValue::from_str(&rpm.to_string()) {
        response.headers_mut().insert("x-ratelimit-limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        response.headers_mut().insert("x-ratelimit-remaining", value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{net::Ipv4Addr, path::PathBuf};

    use axum::{
        body::{to_bytes, Body},
        http::{Request as HttpRequest, StatusCode},
        middleware,
        routing::{get, post},
        Router,
    };
    use tower::ServiceExt;

    use crate::{config::Config, traffic::TrafficLog};

    fn ip_key(a: u8) -> CallerKey {
        CallerKey::Ip(IpAddr::V4(Ipv4Addr::new(127, 0, 0, a)))
    }

    // -----------------------------------------------------------------------
    // Bucket policy
    // -----------------------------------------------------------------------

    #[test]
    fn fresh_caller_gets_ten_seconds_of_burst() {
        let limiter = RateLimiter::new(60); // burst = 10
        let key = ip_key(1);

        let allowed = (0..20)
            .filter(|_| matches!(limiter.check(key), Decision::Allowed { .. }))
            .count();
        assert_eq!(allowed, 10, "burst must be rpm/6");
    }

    #[test]
    fn burst_never_drops_below_one_call() {
        let limiter = RateLimiter::new(1); // rpm/6 < 1 → clamped to 1
        let key = ip_key(2);
        assert!(matches!(limiter.check(key), Decision::Allowed { .. }));
        assert!(matches!(limiter.check(key), Decision::Limited { .. }));
    }

    #[test]
    fn limited_decision_reports_wait_until_next_token() {
        let limiter = RateLimiter::new(60); // 1 token/sec
        let key = ip_key(3);
        while matches!(limiter.check(key), Decision::Allowed { .. }) {}

        match limiter.check(key) {
            Decision::Limited { retry_after_secs } => {
                assert!(retry_after_secs >= 1, "wait must round up to a full second")
            }
            Decision::Allowed { .. } => panic!("bucket should be exhausted"),
        }
    }

    #[test]
    fn remaining_counts_down_per_call() {
        let limiter = RateLimiter::new(60); // burst = 10
        let key = ip_key(4);
        match limiter.check(key) {
            Decision::Allowed { remaining } => assert_eq!(remaining, 9),
            Decision::Limited { .. } => panic!("fresh bucket must allow"),
        }
    }

    #[test]
    fn credential_and_ip_budgets_are_independent() {
        let limiter = RateLimiter::new(6); // burst = 1
        let by_key = CallerKey::Credential(42);
        let by_ip = ip_key(5);

        assert!(matches!(limiter.check(by_key), Decision::Allowed { .. }));
        assert!(matches!(limiter.check(by_key), Decision::Limited { .. }));
        // The IP bucket is untouched by the credential bucket's exhaustion.
        assert!(matches!(limiter.check(by_ip), Decision::Allowed { .. }));
        assert_eq!(limiter.active_buckets(), 2);
    }

    // -----------------------------------------------------------------------
    // Middleware: metering scope and rejection shape
    // -----------------------------------------------------------------------

    fn state_with_rpm(rpm: u32) -> Arc<AppState> {
        let config: Config = toml::from_str(&format!("[gateway]\nrate_limit_rpm = {rpm}")).unwrap();
        Arc::new(AppState::new(
            Arc::new(config),
            PathBuf::default(),
            Arc::new(TrafficLog::new(10)),
        ))
    }

    fn app(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/v1/chat/completions", post(|| async { "dispatched" }))
            .route("/v1/models", get(|| async { "models" }))
            .route("/healthz", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(
                state.clone(),
                super::rate_limit_middleware,
            ))
            .with_state(state)
    }

    #[tokio::test]
    async fn unmetered_paths_never_cost_budget() {
        let app = app(state_with_rpm(1)); // budget of exactly one completion
        for _ in 0..5 {
            let resp = app
                .clone()
                .oneshot(HttpRequest::get("/healthz").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            let resp = app
                .clone()
                .oneshot(HttpRequest::get("/v1/models").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn metered_success_carries_budget_headers() {
        let app = app(state_with_rpm(60));
        let resp = app
            .oneshot(
                HttpRequest::post("/v1/chat/completions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("x-ratelimit-limit").unwrap(), "60");
        assert_eq!(resp.headers().get("x-ratelimit-remaining").unwrap(), "9");
    }

    #[tokio::test]
    async fn exhausted_budget_returns_rate_limit_envelope() {
        let app = app(state_with_rpm(1));
        let ok = app
            .clone()
            .oneshot(
                HttpRequest::post("/v1/chat/completions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let limited = app
            .oneshot(
                HttpRequest::post("/v1/messages")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(limited.headers().get("retry-after").is_some());

        let bytes = to_bytes(limited.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "RATE_LIMIT_ERROR");
    }

    #[tokio::test]
    async fn distinct_credentials_get_distinct_budgets() {
        let app = app(state_with_rpm(1));

        // Drain the first credential's budget.
        let first = app
            .clone()
            .oneshot(
                HttpRequest::post("/v1/chat/completions")
                    .header("authorization", "Bearer caller-one")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let drained = app
            .clone()
            .oneshot(
                HttpRequest::post("/v1/chat/completions")
                    .header("authorization", "Bearer caller-one")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(drained.status(), StatusCode::TOO_MANY_REQUESTS);

        // A different credential still has its own token.
        let second = app
            .oneshot(
                HttpRequest::post("/v1/chat/completions")
                    .header("x-api-key", "caller-two")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);
    }
}
