//! Token authentication for the admin port.
//!
//! When `admin_token_env` is configured in `[gateway]`, every admin route
//! except `/admin/health` requires the token — as `Authorization: Bearer
//! <token>` or as `x-admin-token: <token>` (the latter keeps Prometheus
//! scrape configs to a single static header line). `/admin/health` stays
//! open so orchestrator liveness probes need no credentials, mirroring
//! `/healthz` on the client port; it exposes nothing beyond coarse counts.
//!
//! Rejections use the proxy's standard error envelope, and each failed
//! attempt is logged with the path it targeted — repeated 401s against
//! `/admin/config` are worth noticing.
//!
//! When `admin_token_env` is absent the middleware is a no-op — admin auth is
//! disabled. This is acceptable only when the admin port is strictly
//! firewalled to trusted hosts.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::{
    api::AppState,
    error::{ErrorKind, ProxyError},
};

/// Axum middleware guarding the admin routes.
pub async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.admin_token else {
        // Auth disabled — pass through.
        return next.run(req).await;
    };

    // Liveness stays probeable without credentials.
    if req.uri().path() == "/admin/health" {
        return next.run(req).await;
    }

    let bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let header_token = req.headers().get("x-admin-token").and_then(|v| v.to_str().ok());

    let authorized = bearer.map(|t| t == expected).unwrap_or(false)
        || header_token.map(|t| t == expected).unwrap_or(false);

    if authorized {
        return next.run(req).await;
    }

    warn!(path = %req.uri().path(), "rejected admin request with missing or invalid token");
    let err = ProxyError::new(
        ErrorKind::Unauthorized,
        "admin API requires a valid token (Authorization: Bearer or x-admin-token)",
    );
    let mut response = err.into_response();
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        header::HeaderValue::from_static("Bearer realm=\"llm-relay admin\""),
    );
    response
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::{config::Config, traffic::TrafficLog};

    fn state_with_token(token: Option<&str>) -> Arc<AppState> {
        let mut state = AppState::new(
            Arc::new(Config::default()),
            PathBuf::default(),
            Arc::new(TrafficLog::new(10)),
        );
        state.admin_token = token.map(String::from);
        Arc::new(state)
    }

    fn app(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/admin/health", get(|| async { "alive" }))
            .route("/admin/config", get(|| async { "secrets-adjacent" }))
            .layer(middleware::from_fn_with_state(
                state.clone(),
                super::admin_auth_middleware,
            ))
            .with_state(state)
    }

    #[tokio::test]
    async fn no_token_configured_passes_through() {
        let resp = app(state_with_token(None))
            .oneshot(Request::get("/admin/config").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_is_probeable_without_credentials() {
        let resp = app(state_with_token(Some("tok-1")))
            .oneshot(Request::get("/admin/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn bearer_token_is_accepted() {
        let resp = app(state_with_token(Some("tok-1")))
            .oneshot(
                Request::get("/admin/config")
                    .header("authorization", "Bearer tok-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn x_admin_token_header_is_accepted() {
        let resp = app(state_with_token(Some("tok-1")))
            .oneshot(
                Request::get("/admin/config")
                    .header("x-admin-token", "tok-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rejection_is_401_with_error_envelope() {
        let resp = app(state_with_token(Some("tok-1")))
            .oneshot(
                Request::get("/admin/config")
                    .header("authorization", "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(resp.headers().get("www-authenticate").is_some());

        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "AUTHENTICATION_ERROR");
    }

    #[tokio::test]
    async fn missing_token_is_rejected() {
        let resp = app(state_with_token(Some("tok-1")))
            .oneshot(Request::get("/admin/config").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
