//! Upstream HTTP client: one unary call, one streaming call, or one
//! pass-through streaming call against a configured backend.
//!
//! Protocol differences are confined to three seams — the endpoint path, the
//! auth header scheme, and the request-body serializer — all selected by a
//! match on the wire [`Protocol`]. Everything else (cancellation, timeout
//! handling, SSE line framing, error-body conversion) is shared.
//!
//! Forwarding contract: hop-by-hop headers and client credentials are never
//! sent upstream; the backend's own API key is injected per its scheme, and a
//! configured locale maps to `Accept-Language`.

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt as _;
use reqwest::{header, Client, RequestBuilder, Response};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::ProxyError,
    protocol::{anthropic, openai},
    types::{Backend, ChatRequest, Protocol},
};

/// TCP connect timeout shared by both clients; the unary request deadline is
/// per-backend and applied per request.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Azure's chat-completions API version pinned by the proxy.
const AZURE_API_VERSION: &str = "2024-02-01";

/// Headers never forwarded upstream: the RFC 7230 hop-by-hop set plus
/// transport headers reqwest owns and client credentials the proxy replaces.
const UNFORWARDABLE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
    "content-type",
    "accept-encoding",
    "authorization",
    "x-api-key",
];

/// Upstream response headers worth surfacing to clients.
const SURFACED_HEADERS: &[&str] = &["retry-after", "x-request-id"];
const SURFACED_PREFIXES: &[&str] = &["x-ratelimit-"];

/// A successful unary upstream response: raw body plus surfaced headers.
/// Parsing into the wire-neutral shape is the translator's job.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub body: Bytes,
    pub headers: Vec<(String, String)>,
}

/// Shared HTTP client pair for all backends.
///
/// `Client` wraps an `Arc` internally, so one pair serves every request. The
/// streaming client has no overall deadline — the body arrives incrementally
/// for as long as the model generates.
pub struct UpstreamClient {
    client: Client,
    stream_client: Client,
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        let stream_client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("failed to build streaming reqwest client");
        Self { client, stream_client }
    }

    /// Perform one unary call. Returns the raw body on 2xx; a non-2xx status
    /// converts the provider error body into a [`ProxyError`] whose
    /// retryability follows the protocol's rules.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
        backend: &Backend,
        upstream_model: &str,
        protocol: Protocol,
    ) -> Result<UpstreamResponse, ProxyError> {
        let body = wire_body(request, upstream_model, protocol, false);
        let builder = self
            .apply_headers(self.client.post(endpoint_url(backend, upstream_model, protocol)), request, backend, protocol)
            .timeout(Duration::from_millis(backend.timeout_ms))
            .json(&body);

        let response = send_cancellable(cancel, builder, &backend.id).await?;
        let status = response.status();
        let headers = surfaced_headers(&response);

        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProxyError::cancelled()),
            bytes = response.bytes() => bytes.map_err(|e| ProxyError::from_transport(e, &backend.id))?,
        };

        if !status.is_success() {
            return Err(ProxyError::from_upstream(protocol, status, &bytes, &backend.id));
        }
        debug!(backend = %backend.id, status = status.as_u16(), bytes = bytes.len(), "unary upstream call succeeded");
        Ok(UpstreamResponse { body: bytes, headers })
    }

    /// Perform one streaming call, invoking `on_chunk` once per raw SSE line
    /// in arrival order. Returns on stream end, on a handler error
    /// (propagated as-is), or on cancellation.
    ///
    /// Errors raised before the first byte of body (connect, status check)
    /// come back exactly like unary errors, so the dispatcher can treat them
    /// as uncommitted and retry.
    pub async fn send_streaming(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
        backend: &Backend,
        upstream_model: &str,
        protocol: Protocol,
        on_chunk: &mut (dyn FnMut(&str) -> Result<(), ProxyError> + Send),
    ) -> Result<(), ProxyError> {
        let response = self.open_stream(cancel, request, backend, upstream_model, protocol).await?;
        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProxyError::cancelled()),
                item = stream.next() => item,
            };
            match item {
                Some(Ok(bytes)) => {
                    buffer.extend_from_slice(&bytes);
                    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&line);
                        let line = line.trim_end_matches(['\r', '\n']);
                        if !line.is_empty() {
                            on_chunk(line)?;
                        }
                    }
                }
                Some(Err(e)) => return Err(ProxyError::from_transport(e, &backend.id)),
                None => {
                    let rest = String::from_utf8_lossy(&buffer);
                    let rest = rest.trim();
                    if !rest.is_empty() {
                        on_chunk(rest)?;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Open a streaming call and hand back the raw HTTP response so the
    /// caller can copy bytes verbatim. The status has already been checked;
    /// a non-2xx response is converted before any byte reaches the caller.
    pub async fn send_streaming_passthrough(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
        backend: &Backend,
        upstream_model: &str,
        protocol: Protocol,
    ) -> Result<Response, ProxyError> {
        self.open_stream(cancel, request, backend, upstream_model, protocol).await
    }

    async fn open_stream(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
        backend: &Backend,
        upstream_model: &str,
        protocol: Protocol,
    ) -> Result<Response, ProxyError> {
        let body = wire_body(request, upstream_model, protocol, true);
        let builder = self
            .apply_headers(self.stream_client.post(endpoint_url(backend, upstream_model, protocol)), request, backend, protocol)
            .json(&body);

        let response = send_cancellable(cancel, builder, &backend.id).await?;
        let status = response.status();
        if !status.is_success() {
            let bytes = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProxyError::cancelled()),
                bytes = response.bytes() => bytes.unwrap_or_default(),
            };
            return Err(ProxyError::from_upstream(protocol, status, &bytes, &backend.id));
        }
        debug!(backend = %backend.id, "streaming upstream call opened");
        Ok(response)
    }

    /// Auth scheme, version headers, locale, and filtered client headers.
    fn apply_headers(
        &self,
        mut builder: RequestBuilder,
        request: &ChatRequest,
        backend: &Backend,
        protocol: Protocol,
    ) -> RequestBuilder {
        if let Some(key) = backend.api_key.as_deref() {
            builder = match protocol {
                Protocol::Anthropic => builder
                    .header("x-api-key", key)
                    .header("anthropic-version", anthropic::ANTHROPIC_VERSION),
                Protocol::Azure => builder.header("api-key", key),
                Protocol::Google => builder.header("x-goog-api-key", key),
                _ => builder.header(header::AUTHORIZATION, format!("Bearer {key}")),
            };
        } else if protocol == Protocol::Anthropic {
            builder = builder.header("anthropic-version", anthropic::ANTHROPIC_VERSION);
        }

        if let Some(locale) = backend.locale.as_deref() {
            builder = builder.header(header::ACCEPT_LANGUAGE, locale);
        }

        for (name, value) in &request.headers {
            if UNFORWARDABLE_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }
}

async fn send_cancellable(
    cancel: &CancellationToken,
    builder: RequestBuilder,
    backend_id: &str,
) -> Result<Response, ProxyError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProxyError::cancelled()),
        result = builder.send() => result.map_err(|e| ProxyError::from_transport(e, backend_id)),
    }
}

/// Endpoint path per wire dialect.
fn endpoint_url(backend: &Backend, upstream_model: &str, protocol: Protocol) -> String {
    match protocol {
        Protocol::Anthropic => format!("{}/v1/messages", backend.base_url),
        Protocol::Azure => format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            backend.base_url, upstream_model, AZURE_API_VERSION
        ),
        _ => format!("{}/v1/chat/completions", backend.base_url),
    }
}

/// Serialize the translated request for the wire, forcing the stream flag to
/// match the call shape.
fn wire_body(request: &ChatRequest, upstream_model: &str, protocol: Protocol, stream: bool) -> Value {
    let mut body = match protocol {
        Protocol::Anthropic => anthropic::request_body(request, upstream_model),
        _ => openai::request_body(request, upstream_model),
    };
    body["stream"] = Value::Bool(stream);
    body
}

fn surfaced_headers(response: &Response) -> Vec<(String, String)> {
    response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().to_ascii_lowercase();
            let keep = SURFACED_HEADERS.contains(&name.as_str())
                || SURFACED_PREFIXES.iter().any(|p| name.starts_with(p));
            if !keep {
                return None;
            }
            value.to_str().ok().map(|v| (name, v.to_string()))
        })
        .collect()
}
