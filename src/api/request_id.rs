//! Request identity middleware.
//!
//! Every inbound request gets a request ID that follows it through the whole
//! pipeline: the `req_id` span field on dispatch logs, the `id` of traffic
//! log entries, the `req_id` of client error envelopes, and the
//! `X-Request-ID` response header.
//!
//! A caller-supplied `X-Request-ID` is honored only when it is well-formed —
//! at most [`MAX_ID_LEN`] characters drawn from `[A-Za-z0-9._-]`. Anything
//! else (control characters, injection attempts, over-long values) is
//! replaced with a fresh UUID rather than propagated into log lines and
//! error bodies verbatim. The echoed header always carries the ID the proxy
//! actually used, so callers notice the substitution.

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use tracing::Instrument as _;
use uuid::Uuid;

/// Longest caller-supplied ID the proxy will adopt.
const MAX_ID_LEN: usize = 64;

/// Newtype wrapper carrying the assigned request ID.
///
/// Exposed as an axum [`Extension`](axum::Extension) so any handler can read
/// it:
/// ```rust,ignore
/// async fn handler(Extension(req_id): Extension<RequestId>) { ... }
/// ```
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Accept a caller-supplied ID only when it is safe to embed in logs,
/// headers, and error envelopes.
fn sanitize(raw: &str) -> Option<&str> {
    let acceptable = !raw.is_empty()
        && raw.len() <= MAX_ID_LEN
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    acceptable.then_some(raw)
}

/// Axum middleware that assigns a [`RequestId`] to every request.
///
/// Layer order matters: apply this middleware **inside** the
/// `tower_http::TraceLayer` so it runs within the trace span. The span field
/// is named `req_id` to line up with the dispatch engine's instrument
/// fields, so one grep joins listener and engine logs.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .and_then(sanitize)
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(id.clone()));

    let span = tracing::debug_span!("request", req_id = %id);
    let mut response = next.run(req).instrument(span).await;

    // Echo the ID actually used — a sanitized-away value will differ from
    // what the caller sent.
    if let Ok(header_value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", header_value);
    }

    response
}
