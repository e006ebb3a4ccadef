//! Shared proxy API key authentication middleware.
//!
//! When `proxy_key_env` is configured in `[gateway]`, every request to the
//! client port must present the key — either as `Authorization: Bearer <key>`
//! (OpenAI convention) or as `x-api-key: <key>` (Anthropic convention), so
//! both client dialects authenticate the way their SDKs expect.
//!
//! When `proxy_key_env` is absent the middleware is a no-op — no auth is
//! enforced. `/healthz` is always exempt so liveness probes never need
//! credentials.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use crate::{api::AppState, error::ProxyError};

/// Axum middleware: enforces the shared proxy key when one is configured.
pub async fn client_auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.proxy_key else {
        // Feature disabled — pass through.
        return next.run(req).await;
    };

    if req.uri().path() == "/healthz" {
        return next.run(req).await;
    }

    let bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let api_key = req.headers().get("x-api-key").and_then(|v| v.to_str().ok());

    let authorized = bearer.map(|k| k == expected).unwrap_or(false)
        || api_key.map(|k| k == expected).unwrap_or(false);

    if authorized {
        next.run(req).await
    } else {
        let err = ProxyError::new(
            crate::error::ErrorKind::Unauthorized,
            "valid proxy API key required",
        );
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer realm=\"llm-relay\"")],
            Json(err.envelope()),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, sync::Arc};

    use axum::{
        body::Body,
        http::{Request, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    use crate::{api::AppState, config::Config, traffic::TrafficLog};

    fn state_with_key(key: Option<&str>) -> Arc<AppState> {
        let mut state = AppState::new(
            Arc::new(Config::default()),
            PathBuf::default(),
            Arc::new(TrafficLog::new(10)),
        );
        state.proxy_key = key.map(String::from);
        Arc::new(state)
    }

    fn app(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .route("/healthz", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(
                state.clone(),
                super::client_auth_middleware,
            ))
            .with_state(state)
    }

    #[tokio::test]
    async fn no_key_configured_passes_through() {
        let resp = app(state_with_key(None))
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn bearer_key_is_accepted() {
        let resp = app(state_with_key(Some("sk-proxy-1")))
            .oneshot(
                Request::get("/")
                    .header("authorization", "Bearer sk-proxy-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn x_api_key_is_accepted() {
        let resp = app(state_with_key(Some("sk-proxy-1")))
            .oneshot(
                Request::get("/")
                    .header("x-api-key", "sk-proxy-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn wrong_key_returns_401_envelope() {
        let resp = app(state_with_key(Some("sk-proxy-1")))
            .oneshot(
                Request::get("/")
                    .header("authorization", "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_key_returns_401() {
        let resp = app(state_with_key(Some("sk-proxy-1")))
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn healthz_is_exempt() {
        let resp = app(state_with_key(Some("sk-proxy-1")))
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
