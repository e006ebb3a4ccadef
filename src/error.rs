//! Error taxonomy for the dispatch engine.
//!
//! Every failure inside the proxy is a [`ProxyError`]: a tagged kind plus the
//! HTTP status to return, a normalized code token, a human message, the
//! provider it came from, and a `retryable` flag set by the error source.
//! The retry strategy consults the structured fields first and only falls
//! back to message substring matching for operator-configured pattern lists.
//! [`IntoResponse`] turns any of them into the standardized client envelope,
//! so handlers propagate with `?` and never hand-build error JSON.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

use crate::types::Protocol;

/// What went wrong, independent of provider or transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request carried no model alias at all.
    MissingModel,
    /// The request failed field validation.
    InvalidRequest,
    /// The alias is absent, disabled, or structurally empty.
    UnknownModel,
    /// No backend could be selected after filtering and fallback.
    NoBackend,
    /// An upstream call failed terminally.
    Backend,
    /// Request or response translation failed.
    Protocol,
    RateLimited,
    Unauthorized,
    Forbidden,
    NotFound,
    Timeout,
    /// The caller cancelled; propagated unwrapped.
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// HTTP status returned to the client for this kind.
    pub fn http_status(self) -> StatusCode {
        match self {
            Self::MissingModel | Self::InvalidRequest | Self::UnknownModel => StatusCode::BAD_REQUEST,
            Self::NoBackend | Self::Backend | Self::Protocol => StatusCode::BAD_GATEWAY,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            // nginx's "client closed request" — no standard constant exists.
            Self::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Normalized upper-snake code token for the client error envelope.
    pub fn code_token(self) -> &'static str {
        match self {
            Self::MissingModel | Self::InvalidRequest | Self::UnknownModel => "INVALID_REQUEST",
            Self::Unauthorized => "AUTHENTICATION_ERROR",
            Self::Forbidden => "PERMISSION_DENIED",
            Self::NotFound => "NOT_FOUND",
            Self::RateLimited => "RATE_LIMIT_ERROR",
            Self::NoBackend | Self::Backend | Self::Protocol | Self::Timeout => "SERVICE_UNAVAILABLE",
            Self::Internal => "INTERNAL_ERROR",
            Self::Cancelled => "UNKNOWN_ERROR",
        }
    }

    /// The `type` field in the error envelope, lower-snake like the OpenAI
    /// error body convention.
    pub fn type_token(self) -> &'static str {
        match self {
            Self::MissingModel | Self::InvalidRequest | Self::UnknownModel => "invalid_request_error",
            Self::Unauthorized => "authentication_error",
            Self::Forbidden => "permission_error",
            Self::NotFound => "not_found_error",
            Self::RateLimited => "rate_limit_error",
            Self::NoBackend | Self::Backend | Self::Protocol | Self::Timeout => "api_error",
            Self::Internal | Self::Cancelled => "internal_error",
        }
    }

    /// Whether errors of this kind are retryable absent more specific
    /// information from the error source.
    fn default_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::Timeout | Self::Backend | Self::Internal)
    }
}

/// A structured dispatch failure.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProxyError {
    pub kind: ErrorKind,
    /// HTTP status facing the client. Usually `kind.http_status()`, but an
    /// upstream-derived error keeps its own mapping.
    pub status: StatusCode,
    /// Normalized code token from the upper-snake set.
    pub code: &'static str,
    pub message: String,
    /// Which provider dialect produced this error, when upstream-derived.
    pub provider: Option<Protocol>,
    /// Set at construction by the error source; the retry strategy's policy
    /// may override it.
    pub retryable: bool,
    pub request_id: Option<String>,
    pub backend_id: Option<String>,
    /// Offending request field, when the provider reported one.
    pub param: Option<String>,
    /// Suggested client wait before retrying, when one is known.
    pub retry_after_secs: Option<u64>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ProxyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: kind.http_status(),
            code: kind.code_token(),
            message: message.into(),
            provider: None,
            retryable: kind.default_retryable(),
            request_id: None,
            backend_id: None,
            param: None,
            retry_after_secs: None,
            source: None,
        }
    }

    pub fn missing_model() -> Self {
        Self::new(ErrorKind::MissingModel, "request carries no model alias")
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn unknown_model(alias: &str) -> Self {
        Self::new(ErrorKind::UnknownModel, format!("unknown or disabled model alias `{alias}`"))
    }

    pub fn no_backend(alias: &str) -> Self {
        Self::new(
            ErrorKind::NoBackend,
            format!("no backend available for alias `{alias}` after filtering and fallback"),
        )
    }

    pub fn cancelled() -> Self {
        let mut err = Self::new(ErrorKind::Cancelled, "request cancelled by caller");
        err.retryable = false;
        err
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Wrap a translator failure.
    pub fn protocol(cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        let cause = cause.into();
        let mut err = Self::new(ErrorKind::Protocol, format!("protocol translation failed: {cause}"));
        err.retryable = false;
        err.source = Some(cause);
        err
    }

    /// Wrap the terminal upstream failure with the backend that produced it.
    pub fn backend_wrap(backend_id: &str, cause: ProxyError) -> Self {
        Self {
            kind: ErrorKind::Backend,
            status: cause.status,
            code: cause.code,
            message: format!("backend `{backend_id}`: {}", cause.message),
            provider: cause.provider,
            retryable: cause.retryable,
            request_id: cause.request_id.clone(),
            backend_id: Some(backend_id.to_string()),
            param: cause.param.clone(),
            retry_after_secs: cause.retry_after_secs,
            source: Some(Box::new(cause)),
        }
    }

    pub fn with_provider(mut self, provider: Protocol) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_backend(mut self, backend_id: impl Into<String>) -> Self {
        self.backend_id = Some(backend_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    /// Build a [`ProxyError`] from a non-2xx upstream response body.
    ///
    /// Recognizes the OpenAI error shape (`{"error":{"code","message","type",
    /// "param"}}`), the Anthropic shape (`{"error":{"type","message"}}`), and
    /// falls back to a status-derived kind with a default message. The
    /// resulting message embeds the status code and backend identifier, and
    /// `retryable` follows the provider's conversion rules (429/5xx/408
    /// retryable, other 4xx not).
    pub fn from_upstream(protocol: Protocol, status: StatusCode, body: &[u8], backend_id: &str) -> Self {
        let kind = kind_for_status(status);
        let parsed: Option<Value> = serde_json::from_slice(body).ok();
        let error_obj = parsed.as_ref().and_then(|v| v.get("error"));

        let provider_message = error_obj
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| default_message_for_status(status).to_string());

        // OpenAI carries both `code` and `type`; Anthropic only `type`.
        let provider_code = error_obj
            .and_then(|e| e.get("code"))
            .and_then(Value::as_str)
            .or_else(|| error_obj.and_then(|e| e.get("type")).and_then(Value::as_str))
            .unwrap_or("");
        let param = error_obj
            .and_then(|e| e.get("param"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let retryable = match protocol {
            // Cohere's compatibility endpoint: 429 and 5xx retryable, all
            // other 4xx terminal.
            Protocol::Cohere => status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS,
            _ => {
                status.is_server_error()
                    || status == StatusCode::TOO_MANY_REQUESTS
                    || status == StatusCode::REQUEST_TIMEOUT
            }
        };

        Self {
            kind,
            status: kind.http_status(),
            code: normalize_code(provider_code, kind),
            message: format!(
                "backend `{backend_id}` returned HTTP {} ({}): {provider_message}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("unknown status"),
            ),
            provider: Some(protocol),
            retryable,
            request_id: None,
            backend_id: Some(backend_id.to_string()),
            param,
            retry_after_secs: None,
            source: None,
        }
    }

    /// Convert a reqwest transport failure. Timeouts map to a retryable
    /// [`ErrorKind::Timeout`]; everything else is a retryable backend error
    /// (network failures are presumed transient).
    pub fn from_transport(err: reqwest::Error, backend_id: &str) -> Self {
        let kind = if err.is_timeout() { ErrorKind::Timeout } else { ErrorKind::Backend };
        let mut out = Self::new(kind, format!("backend `{backend_id}`: {err}"));
        out.backend_id = Some(backend_id.to_string());
        out.retryable = true;
        out.source = Some(Box::new(err));
        out
    }

    /// The standardized error envelope returned to clients:
    /// `{"error":{"code","message","type","param"?},"req_id"?,"backend"?}`.
    pub fn envelope(&self) -> Value {
        let mut error = json!({
            "code": self.code,
            "message": self.message,
            "type": self.kind.type_token(),
        });
        if let Some(param) = &self.param {
            error["param"] = json!(param);
        }
        let mut body = json!({ "error": error });
        if let Some(req_id) = &self.request_id {
            body["req_id"] = json!(req_id);
        }
        if let Some(backend) = &self.backend_id {
            body["backend"] = json!(backend);
        }
        body
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.envelope())).into_response();
        if self.retryable {
            if let Some(secs) = self.retry_after_secs {
                if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                    response.headers_mut().insert("retry-after", value);
                }
            }
        }
        response
    }
}

fn kind_for_status(status: StatusCode) -> ErrorKind {
    match status.as_u16() {
        401 => ErrorKind::Unauthorized,
        403 => ErrorKind::Forbidden,
        404 => ErrorKind::NotFound,
        408 => ErrorKind::Timeout,
        429 => ErrorKind::RateLimited,
        400..=499 => ErrorKind::InvalidRequest,
        _ => ErrorKind::Backend,
    }
}

fn default_message_for_status(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "the request was rejected by the upstream provider",
        401 => "the upstream provider rejected the configured API key",
        403 => "the upstream provider denied access to this resource",
        404 => "the requested upstream resource does not exist",
        408 => "the upstream provider timed out handling the request",
        429 => "the upstream provider is rate limiting requests",
        500..=599 => "the upstream provider failed internally",
        _ => "the upstream provider returned an unexpected status",
    }
}

/// Map a provider code/type string onto the normalized upper-snake token set.
///
/// Falls back to the kind-derived token when the provider string matches
/// nothing known.
pub fn normalize_code(provider_code: &str, kind: ErrorKind) -> &'static str {
    let lower = provider_code.to_ascii_lowercase();
    if lower.is_empty() {
        return kind.code_token();
    }
    if lower.contains("context_length") || lower.contains("context length") {
        "CONTEXT_LENGTH_EXCEEDED"
    } else if lower.contains("content_filter") || lower.contains("content_policy") {
        "CONTENT_FILTER_ERROR"
    } else if lower.contains("authentication") || lower.contains("api_key") || lower.contains("api key") {
        "AUTHENTICATION_ERROR"
    } else if lower.contains("permission") || lower.contains("forbidden") {
        "PERMISSION_DENIED"
    } else if lower.contains("not_found") || lower.contains("not found") {
        "NOT_FOUND"
    } else if lower.contains("rate_limit") || lower.contains("rate limit") || lower.contains("overloaded") {
        "RATE_LIMIT_ERROR"
    } else if lower.contains("invalid") {
        "INVALID_REQUEST"
    } else if lower.contains("server_error") || lower.contains("internal") {
        "INTERNAL_ERROR"
    } else {
        match kind {
            ErrorKind::Backend => "UNKNOWN_ERROR",
            other => other.code_token(),
        }
    }
}
