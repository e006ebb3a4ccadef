//! Client-facing API (port 8080) — the endpoints LLM clients talk to.
//!
//! Two wire dialects are accepted: OpenAI chat-completions on
//! `POST /v1/chat/completions` and Anthropic messages on `POST /v1/messages`.
//! Both parse into the wire-neutral [`ChatRequest`], run through the dispatch
//! engine, and render back in the caller's dialect — including SSE framing
//! for streams (`data: …` frames with a `[DONE]` sentinel for OpenAI,
//! `event:`-tagged frames for Anthropic).
//!
//! Streaming responses are only committed once the upstream stream has
//! started: a failure before the first chunk surfaces as a plain HTTP error
//! with the right status, not a 200 that dies immediately.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use bytes::Bytes;
use futures_util::StreamExt as _;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::{
    api::{request_id::RequestId, AppState},
    error::ProxyError,
    protocol::anthropic,
    streaming::StreamEvent,
    traffic::TrafficEntry,
    types::{ChatRequest, ChatResponse, Protocol},
};

/// Build the client-facing axum router (port 8080).
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(crate::api::health::healthz))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(messages))
        .route("/v1/models", get(list_models))
        .with_state(state)
}

/// POST /v1/chat/completions — OpenAI dialect.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    request_id: Option<Extension<RequestId>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let req_id = resolve_request_id(request_id);

    let mut request: ChatRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            return ProxyError::invalid_request(format!("malformed request body: {e}"))
                .with_request_id(&req_id)
                .into_response()
        }
    };
    request.id = req_id.clone();
    request.client_protocol = Protocol::Openai;
    request.headers = forwardable_headers(&headers);

    if let Err(err) = request.validate() {
        return err.with_request_id(&req_id).into_response();
    }

    if request.stream {
        stream_response(state, request, Dialect::Openai).await
    } else {
        unary_response(state, request, Dialect::Openai).await
    }
}

/// POST /v1/messages — Anthropic dialect.
pub async fn messages(
    State(state): State<Arc<AppState>>,
    request_id: Option<Extension<RequestId>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let req_id = resolve_request_id(request_id);

    let mut request = match anthropic::from_client_request(&body) {
        Ok(request) => request,
        Err(err) => return err.with_request_id(&req_id).into_response(),
    };
    request.id = req_id.clone();
    request.headers = forwardable_headers(&headers);

    if let Err(err) = request.validate() {
        return err.with_request_id(&req_id).into_response();
    }

    if request.stream {
        stream_response(state, request, Dialect::Anthropic).await
    } else {
        unary_response(state, request, Dialect::Anthropic).await
    }
}

/// GET /v1/models — enabled aliases as OpenAI-style model objects.
pub async fn list_models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = state.config();
    let mut models: Vec<Value> = config
        .models
        .iter()
        .filter(|(_, m)| m.enabled)
        .map(|(alias, _)| {
            json!({
                "id": alias,
                "object": "model",
                "owned_by": "llm-relay",
            })
        })
        .collect();
    models.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
    Json(json!({ "object": "list", "data": models }))
}

/// Which dialect the response is rendered in.
#[derive(Clone, Copy, PartialEq)]
enum Dialect {
    Openai,
    Anthropic,
}

fn resolve_request_id(extension: Option<Extension<RequestId>>) -> String {
    extension
        .map(|Extension(RequestId(id))| id)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Client headers worth forwarding upstream: the `x-*` family minus the
/// proxy's own auth header. Hop-by-hop and transport headers are stripped
/// again at the upstream client, so this list errs permissive.
fn forwardable_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().to_ascii_lowercase();
            if !name.starts_with("x-") || name == "x-api-key" || name == "x-request-id" {
                return None;
            }
            value.to_str().ok().map(|v| (name, v.to_string()))
        })
        .collect()
}

async fn unary_response(state: Arc<AppState>, request: ChatRequest, dialect: Dialect) -> Response {
    let started = std::time::Instant::now();
    let cancel = CancellationToken::new();

    match state.engine.dispatch(&cancel, &request).await {
        Ok(response) => {
            let latency = started.elapsed().as_millis() as u64;
            let backend = response
                .headers
                .iter()
                .find(|(n, _)| n == "x-relay-backend")
                .map(|(_, v)| v.clone());
            let mut entry = TrafficEntry::new(request.model.clone(), latency, true).with_id(&request.id);
            if let Some(backend) = &backend {
                entry = entry.with_backend(backend);
            }
            state.traffic.push(entry);
            render_unary(&response, dialect)
        }
        Err(err) => {
            let latency = started.elapsed().as_millis() as u64;
            state.traffic.push(
                TrafficEntry::new(request.model.clone(), latency, false)
                    .with_id(&request.id)
                    .with_error(&err.message),
            );
            err.with_request_id(&request.id).into_response()
        }
    }
}

fn render_unary(response: &ChatResponse, dialect: Dialect) -> Response {
    let mut http_response = match dialect {
        Dialect::Openai => Json(response).into_response(),
        Dialect::Anthropic => Json(anthropic::client_response(response)).into_response(),
    };
    for (name, value) in &response.headers {
        if let (Ok(name), Ok(value)) = (
            header::HeaderName::try_from(name.as_str()),
            header::HeaderValue::from_str(value),
        ) {
            http_response.headers_mut().insert(name, value);
        }
    }
    http_response
}

/// Run a streaming dispatch, committing the SSE response only after the
/// upstream stream has started. Pre-commit failures return a plain HTTP
/// error; post-commit failures are delivered as a final SSE error frame.
///
/// OpenAI-dialect streams whose candidate routes are all OpenAI-compatible
/// take the pass-through path: upstream SSE bytes (including the `[DONE]`
/// sentinel) reach the client verbatim. Everything else runs in standard
/// mode with per-chunk re-framing.
async fn stream_response(state: Arc<AppState>, request: ChatRequest, dialect: Dialect) -> Response {
    if dialect == Dialect::Openai && state.engine.passthrough_eligible(&request.model) {
        return stream_passthrough_response(state, request).await;
    }
    let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Bytes>();
    let (start_tx, start_rx) = oneshot::channel::<Result<(), ProxyError>>();
    let cancel = CancellationToken::new();

    let engine = Arc::clone(&state.engine);
    let traffic = Arc::clone(&state.traffic);
    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        let started = std::time::Instant::now();
        let mut start_tx = Some(start_tx);
        let mut framer = Framer::new(dialect, &request);
        let alias = request.model.clone();
        let req_id = request.id.clone();

        let result = {
            let start_tx = &mut start_tx;
            let framer = &mut framer;
            let frame_tx = &frame_tx;
            let cancel_on_disconnect = &task_cancel;
            let mut sink = move |event: StreamEvent| -> Result<(), ProxyError> {
                if let Some(tx) = start_tx.take() {
                    let _ = tx.send(Ok(()));
                }
                for frame in framer.frames(&event) {
                    if frame_tx.send(frame).is_err() {
                        // Receiver dropped — the client went away.
                        cancel_on_disconnect.cancel();
                        return Err(ProxyError::cancelled());
                    }
                }
                Ok(())
            };
            engine.dispatch_stream(&task_cancel, &request, &mut sink).await
        };

        let latency = started.elapsed().as_millis() as u64;
        match result {
            Ok(()) => {
                if let Some(tx) = start_tx.take() {
                    let _ = tx.send(Ok(()));
                }
                for frame in framer.trailer() {
                    let _ = frame_tx.send(frame);
                }
                traffic.push(TrafficEntry::new(alias, latency, true).with_id(&req_id).mark_stream());
            }
            Err(err) => {
                traffic.push(
                    TrafficEntry::new(alias, latency, false)
                        .with_id(&req_id)
                        .with_error(&err.message)
                        .mark_stream(),
                );
                match start_tx.take() {
                    // Nothing sent yet — surface a real HTTP error.
                    Some(tx) => {
                        let _ = tx.send(Err(err));
                    }
                    // Mid-stream failure — best effort error frame, then EOF.
                    None => {
                        let frame = format!("data: {}\n\n", err.envelope());
                        let _ = frame_tx.send(Bytes::from(frame));
                    }
                }
            }
        }
    });

    match start_rx.await {
        Ok(Ok(())) => sse_ok_response(frame_rx),
        Ok(Err(err)) => err.into_response(),
        Err(_) => ProxyError::internal("stream task ended before starting").into_response(),
    }
}

/// Pass-through streaming: the upstream SSE body is relayed byte-for-byte,
/// with the same commit handshake as the standard path. A bounded capture of
/// the relayed bytes is kept by the engine for logging.
async fn stream_passthrough_response(state: Arc<AppState>, request: ChatRequest) -> Response {
    let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Bytes>();
    let (start_tx, start_rx) = oneshot::channel::<Result<(), ProxyError>>();
    let cancel = CancellationToken::new();

    let engine = Arc::clone(&state.engine);
    let traffic = Arc::clone(&state.traffic);
    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        let started = std::time::Instant::now();
        let mut start_tx = Some(start_tx);
        let alias = request.model.clone();
        let req_id = request.id.clone();

        let result = {
            let start_tx = &mut start_tx;
            let frame_tx = &frame_tx;
            let cancel_on_disconnect = &task_cancel;
            let mut sink = move |bytes: Bytes| -> Result<(), ProxyError> {
                if let Some(tx) = start_tx.take() {
                    let _ = tx.send(Ok(()));
                }
                if frame_tx.send(bytes).is_err() {
                    cancel_on_disconnect.cancel();
                    return Err(ProxyError::cancelled());
                }
                Ok(())
            };
            engine.dispatch_passthrough(&task_cancel, &request, &mut sink).await
        };

        let latency = started.elapsed().as_millis() as u64;
        match result {
            Ok(capture) => {
                if let Some(tx) = start_tx.take() {
                    let _ = tx.send(Ok(()));
                }
                debug!(
                    captured = capture.bytes.len(),
                    truncated = capture.truncated,
                    "pass-through stream relayed"
                );
                traffic.push(TrafficEntry::new(alias, latency, true).with_id(&req_id).mark_stream());
            }
            Err(err) => {
                traffic.push(
                    TrafficEntry::new(alias, latency, false)
                        .with_id(&req_id)
                        .with_error(&err.message)
                        .mark_stream(),
                );
                match start_tx.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(err));
                    }
                    None => {
                        let frame = format!("data: {}\n\n", err.envelope());
                        let _ = frame_tx.send(Bytes::from(frame));
                    }
                }
            }
        }
    });

    match start_rx.await {
        Ok(Ok(())) => sse_ok_response(frame_rx),
        Ok(Err(err)) => err.into_response(),
        Err(_) => ProxyError::internal("stream task ended before starting").into_response(),
    }
}

fn sse_ok_response(frame_rx: mpsc::UnboundedReceiver<Bytes>) -> Response {
    let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(frame_rx)
        .map(Ok::<Bytes, std::convert::Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Renders normalized stream events into dialect-specific SSE frames.
///
/// OpenAI framing is stateless: each chunk is one `data:` frame and the
/// terminal frame is `data: [DONE]`. Anthropic framing is stateful — the
/// first content chunk opens `message_start` / `content_block_start`, and the
/// trailer closes the block and message.
struct Framer {
    dialect: Dialect,
    request_id: String,
    alias: String,
    opened: bool,
    done_sent: bool,
    stop_reason: Option<String>,
}

impl Framer {
    fn new(dialect: Dialect, request: &ChatRequest) -> Self {
        Self {
            dialect,
            request_id: request.id.clone(),
            alias: request.model.clone(),
            opened: false,
            done_sent: false,
            stop_reason: None,
        }
    }

    fn frames(&mut self, event: &StreamEvent) -> Vec<Bytes> {
        if let Some(reason) = &event.stop_reason {
            self.stop_reason = Some(reason.clone());
        }
        match self.dialect {
            Dialect::Openai => self.openai_frames(event),
            Dialect::Anthropic => self.anthropic_frames(event),
        }
    }

    fn openai_frames(&mut self, event: &StreamEvent) -> Vec<Bytes> {
        if event.finished && event.response.choices.is_empty() {
            self.done_sent = true;
            return vec![Bytes::from_static(b"data: [DONE]\n\n")];
        }
        let json = serde_json::to_string(&event.response).unwrap_or_else(|_| "{}".to_string());
        vec![Bytes::from(format!("data: {json}\n\n"))]
    }

    fn anthropic_frames(&mut self, event: &StreamEvent) -> Vec<Bytes> {
        let mut frames = Vec::new();
        if !self.opened {
            self.opened = true;
            frames.push(Bytes::from(anthropic::sse_event(
                "message_start",
                &json!({
                    "type": "message_start",
                    "message": {
                        "id": format!("resp-{}", self.request_id),
                        "type": "message",
                        "role": "assistant",
                        "model": self.alias,
                        "content": [],
                        "usage": { "input_tokens": 0, "output_tokens": 0 },
                    },
                }),
            )));
            frames.push(Bytes::from(anthropic::sse_event(
                "content_block_start",
                &json!({
                    "type": "content_block_start",
                    "index": 0,
                    "content_block": { "type": "text", "text": "" },
                }),
            )));
        }
        let content = event
            .response
            .choices
            .first()
            .and_then(|c| c.delta.as_ref())
            .and_then(|d| d.content.as_deref())
            .unwrap_or("");
        if !content.is_empty() {
            frames.push(Bytes::from(anthropic::sse_event(
                "content_block_delta",
                &json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": { "type": "text_delta", "text": content },
                }),
            )));
        }
        frames
    }

    /// Frames emitted after the dispatch loop returns cleanly.
    fn trailer(&mut self) -> Vec<Bytes> {
        match self.dialect {
            Dialect::Openai => {
                if self.done_sent {
                    Vec::new()
                } else {
                    vec![Bytes::from_static(b"data: [DONE]\n\n")]
                }
            }
            Dialect::Anthropic => {
                let mut frames = Vec::new();
                if !self.opened {
                    // Stream with no content — still open the envelope so the
                    // client sees a well-formed message.
                    frames.extend(self.anthropic_frames(&StreamEvent {
                        response: ChatResponse::default(),
                        finished: false,
                        stop_reason: None,
                    }));
                }
                frames.push(Bytes::from(anthropic::sse_event(
                    "content_block_stop",
                    &json!({ "type": "content_block_stop", "index": 0 }),
                )));
                let stop_reason = self
                    .stop_reason
                    .as_deref()
                    .map(|r| match r {
                        "stop" => "end_turn",
                        "length" => "max_tokens",
                        "tool_calls" => "tool_use",
                        other => other,
                    })
                    .unwrap_or("end_turn");
                frames.push(Bytes::from(anthropic::sse_event(
                    "message_delta",
                    &json!({
                        "type": "message_delta",
                        "delta": { "stop_reason": stop_reason, "stop_sequence": null },
                        "usage": { "output_tokens": 0 },
                    }),
                )));
                frames.push(Bytes::from(anthropic::sse_event(
                    "message_stop",
                    &json!({ "type": "message_stop" }),
                )));
                frames
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use axum::body::to_bytes;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::{config::Config, traffic::TrafficLog};

    fn state_for(server_uri: &str) -> Arc<AppState> {
        let config: Config = toml::from_str(&format!(
            r#"
            [backends.b1]
            base_url = "{server_uri}"

            [models."m/a"]
            routes = [{{ backend = "b1", model = "gpt-4", priority = 1 }}]
            "#
        ))
        .unwrap();
        Arc::new(AppState::new(
            Arc::new(config),
            PathBuf::default(),
            Arc::new(TrafficLog::new(100)),
        ))
    }

    fn ok_completion() -> Value {
        json!({
            "id": "r1",
            "object": "chat.completion",
            "model": "gpt-4",
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": "ok" } }],
        })
    }

    async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value, HeaderMap) {
        let response = app
            .oneshot(
                HttpRequest::post(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value, headers)
    }

    async fn post_sse(app: Router, uri: &str, body: Value) -> (StatusCode, String) {
        let response = app
            .oneshot(
                HttpRequest::post(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    // -----------------------------------------------------------------------
    // OpenAI dialect — unary
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn openai_unary_roundtrip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_completion()))
            .mount(&server)
            .await;

        let state = state_for(&server.uri());
        let app = router(Arc::clone(&state));
        let (status, body, headers) = post_json(
            app,
            "/v1/chat/completions",
            json!({ "model": "m/a", "messages": [{ "role": "user", "content": "hi" }] }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["choices"][0]["message"]["content"], "ok");
        assert_eq!(headers.get("x-relay-backend").unwrap(), "b1");

        let entries = state.traffic.recent(10).await;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].success);
        assert_eq!(entries[0].backend.as_deref(), Some("b1"));
    }

    #[tokio::test]
    async fn openai_unary_unknown_model_is_400_envelope() {
        let server = MockServer::start().await;
        let app = router(state_for(&server.uri()));
        let (status, body, _) = post_json(
            app,
            "/v1/chat/completions",
            json!({ "model": "m/ghost", "messages": [{ "role": "user", "content": "hi" }] }),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_REQUEST");
        assert!(body["req_id"].is_string());
    }

    #[tokio::test]
    async fn openai_unary_missing_messages_is_invalid_request() {
        let server = MockServer::start().await;
        let app = router(state_for(&server.uri()));
        let (status, body, _) = post_json(
            app,
            "/v1/chat/completions",
            json!({ "model": "m/a", "messages": [] }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn openai_unary_upstream_401_maps_to_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": { "code": "invalid_api_key", "message": "bad key", "type": "authentication_error" },
            })))
            .mount(&server)
            .await;

        let app = router(state_for(&server.uri()));
        let (status, body, _) = post_json(
            app,
            "/v1/chat/completions",
            json!({ "model": "m/a", "messages": [{ "role": "user", "content": "hi" }] }),
        )
        .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "AUTHENTICATION_ERROR");
        assert_eq!(body["backend"], "b1");
    }

    // -----------------------------------------------------------------------
    // OpenAI dialect — streaming
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn openai_stream_to_openai_backend_relays_bytes_verbatim() {
        // All routes speak the OpenAI dialect, so the stream takes the
        // pass-through path — upstream SSE bytes arrive untouched.
        let server = MockServer::start().await;
        let sse = "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"he\"}}]}\n\n\
                   data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo\"},\"finish_reason\":\"stop\"}]}\n\n\
                   data: [DONE]\n\n";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let state = state_for(&server.uri());
        let app = router(Arc::clone(&state));
        let (status, body) = post_sse(
            app,
            "/v1/chat/completions",
            json!({ "model": "m/a", "stream": true, "messages": [{ "role": "user", "content": "hi" }] }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, sse, "pass-through must not alter a single byte");

        let entries = state.traffic.recent(10).await;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].stream);
        assert!(entries[0].success);
    }

    #[tokio::test]
    async fn openai_stream_to_anthropic_backend_reframes_chunks() {
        // An Anthropic route forces standard mode: upstream events are
        // re-framed as chat.completion.chunk frames with a [DONE] sentinel.
        let server = MockServer::start().await;
        let sse = concat!(
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hello\"}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let config: Config = toml::from_str(&format!(
            r#"
            [backends.claude]
            base_url = "{}"
            protocol = "anthropic"

            [models."m/a"]
            routes = [{{ backend = "claude", model = "claude-sonnet-4-5", priority = 1 }}]
            "#,
            server.uri()
        ))
        .unwrap();
        let state = Arc::new(AppState::new(
            Arc::new(config),
            PathBuf::default(),
            Arc::new(TrafficLog::new(100)),
        ));

        let (status, body) = post_sse(
            router(state),
            "/v1/chat/completions",
            json!({ "model": "m/a", "stream": true, "messages": [{ "role": "user", "content": "hi" }] }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(r#""object":"chat.completion.chunk""#));
        assert!(body.contains(r#""content":"hello""#));
        assert!(body.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn openai_stream_start_failure_returns_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": { "type": "authentication_error", "message": "bad key" },
            })))
            .mount(&server)
            .await;

        let app = router(state_for(&server.uri()));
        let (status, body) = post_sse(
            app,
            "/v1/chat/completions",
            json!({ "model": "m/a", "stream": true, "messages": [{ "role": "user", "content": "hi" }] }),
        )
        .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("AUTHENTICATION_ERROR"));
    }

    // -----------------------------------------------------------------------
    // Anthropic dialect
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn anthropic_unary_renders_message_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_completion()))
            .mount(&server)
            .await;

        let app = router(state_for(&server.uri()));
        let (status, body, _) = post_json(
            app,
            "/v1/messages",
            json!({
                "model": "m/a",
                "max_tokens": 100,
                "messages": [{ "role": "user", "content": "hi" }],
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], "message");
        assert_eq!(body["role"], "assistant");
        assert_eq!(body["content"][0]["text"], "ok");
    }

    #[tokio::test]
    async fn anthropic_stream_renders_event_framing() {
        let server = MockServer::start().await;
        let sse = "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hey\"}}]}\n\n\
                   data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n\
                   data: [DONE]\n\n";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let app = router(state_for(&server.uri()));
        let (status, body) = post_sse(
            app,
            "/v1/messages",
            json!({
                "model": "m/a",
                "max_tokens": 100,
                "stream": true,
                "messages": [{ "role": "user", "content": "hi" }],
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("event: message_start"));
        assert!(body.contains("event: content_block_start"));
        assert!(body.contains(r#""text":"hey""#));
        assert!(body.contains("event: message_delta"));
        assert!(body.contains(r#""stop_reason":"end_turn""#));
        assert!(body.trim_end().ends_with("data: {\"type\":\"message_stop\"}"));
    }

    // -----------------------------------------------------------------------
    // Models listing
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn list_models_returns_enabled_aliases() {
        let server = MockServer::start().await;
        let app = router(state_for(&server.uri()));
        let response = app
            .oneshot(HttpRequest::get("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["object"], "list");
        assert_eq!(body["data"][0]["id"], "m/a");
    }

    // -----------------------------------------------------------------------
    // Header forwarding filter
    // -----------------------------------------------------------------------

    #[test]
    fn forwardable_headers_keeps_x_family_only() {
        let mut headers = HeaderMap::new();
        headers.insert("x-trace-id", "t1".parse().unwrap());
        headers.insert("x-api-key", "secret".parse().unwrap());
        headers.insert("x-request-id", "r1".parse().unwrap());
        headers.insert("user-agent", "curl".parse().unwrap());

        let forwarded = forwardable_headers(&headers);
        assert_eq!(forwarded, vec![("x-trace-id".to_string(), "t1".to_string())]);
    }
}
