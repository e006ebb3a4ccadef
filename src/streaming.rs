//! Streaming dispatch: the SSE-shaped counterpart of the unary engine.
//!
//! Two modes share the unary loop's selection and retry skeleton:
//!
//! - **Standard**: every raw upstream chunk runs through the protocol chunk
//!   translator and is re-framed as a `chat.completion.chunk` response before
//!   reaching the caller's sink. A malformed chunk is logged and skipped —
//!   one bad frame must not tear down an otherwise healthy stream.
//! - **Pass-through**: upstream bytes are copied to the sink verbatim, with a
//!   bounded rolling copy captured for the traffic log.
//!
//! Retry covers stream-start failures only. The moment the first chunk has
//! been delivered to the sink the stream is committed: later failures
//! propagate to the client as-is, because re-running the request would emit
//! duplicate content into a half-written response.

use std::sync::atomic::Ordering;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    dispatch::DispatchEngine,
    error::ProxyError,
    protocol,
    types::{ChatRequest, ChatResponse, Choice, Delta, StreamChunk},
};

/// One translated chunk delivered to the standard-mode sink: the re-framed
/// response plus the terminal marker the wire shape cannot carry.
pub struct StreamEvent {
    pub response: ChatResponse,
    pub finished: bool,
    pub stop_reason: Option<String>,
}

/// What a pass-through run captured for logging: a prefix of the upstream
/// bytes, cut off at the configured bound.
#[derive(Debug, Default)]
pub struct StreamCapture {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

/// Build the per-chunk response for the standard streaming mode.
///
/// The ID defaults to `"resp-" + request id`, the model defaults to the
/// alias, and `choices` is always an array — empty for the bare terminal
/// frame, one delta choice otherwise.
pub fn chunk_response(request_id: &str, alias: &str, chunk: &StreamChunk) -> ChatResponse {
    let bare_terminal = chunk.finished && chunk.content.is_empty() && chunk.stop_reason.is_none();
    let choices = if bare_terminal {
        Vec::new()
    } else {
        vec![Choice {
            index: 0,
            message: None,
            delta: Some(Delta {
                role: None,
                content: (!chunk.content.is_empty()).then(|| chunk.content.clone()),
                tool_calls: None,
            }),
            finish_reason: chunk.stop_reason.clone(),
        }]
    };
    ChatResponse {
        id: format!("resp-{request_id}"),
        object: "chat.completion.chunk".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: alias.to_string(),
        choices,
        ..Default::default()
    }
}

impl DispatchEngine {
    /// Dispatch one streaming request in standard (re-framing) mode.
    ///
    /// The sink is called once per content-bearing or terminal chunk, in
    /// upstream arrival order. A sink error propagates immediately.
    #[tracing::instrument(skip_all, fields(alias = %request.model, req_id = %request.id))]
    pub async fn dispatch_stream(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
        sink: &mut (dyn FnMut(StreamEvent) -> Result<(), ProxyError> + Send),
    ) -> Result<(), ProxyError> {
        if request.model.is_empty() {
            return Err(ProxyError::missing_model().with_request_id(&request.id));
        }
        let cfg = self.config();
        let available = self.candidates(&cfg, &request.model)?;

        let mut attempt: u32 = 0;
        loop {
            let (backend, upstream_model, wire_protocol) =
                self.select_target(&available, &request.model)?;
            if attempt == 0 {
                debug!(backend = %backend.id, "initial backend selected");
            }
            let backend_req = protocol::to_backend(request, wire_protocol, &cfg.system_prompts)
                .map_err(ProxyError::protocol)?;

            let _inflight = self.balancer_track(&backend.id);
            let mut committed = false;
            let result = {
                let committed = &mut committed;
                let mut handler = |line: &str| -> Result<(), ProxyError> {
                    let chunk = match protocol::translate_chunk(line, wire_protocol) {
                        Ok(chunk) => chunk,
                        Err(err) => {
                            warn!(error = %err, "malformed stream chunk skipped");
                            return Ok(());
                        }
                    };
                    // Keep-alives, event framing, and role-only deltas carry
                    // nothing for the client.
                    if !chunk.finished && chunk.content.is_empty() && chunk.stop_reason.is_none() {
                        return Ok(());
                    }
                    let event = StreamEvent {
                        response: chunk_response(&request.id, &request.model, &chunk),
                        finished: chunk.finished,
                        stop_reason: chunk.stop_reason.clone(),
                    };
                    *committed = true;
                    sink(event)
                };
                self.upstream
                    .send_streaming(cancel, &backend_req, &backend, &upstream_model, wire_protocol, &mut handler)
                    .await
            };

            match result {
                Ok(()) => {
                    info!(backend = %backend.id, attempt, "stream completed");
                    return Ok(());
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) if committed => {
                    // The client already received bytes — the stream is
                    // committed and the retry loop must not restart it.
                    warn!(backend = %backend.id, error = %err, "stream failed after first chunk");
                    return Err(err);
                }
                Err(err) => {
                    self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(backend = %backend.id, attempt, error = %err, "stream start failed");
                    if !self.retry_strategy().should_retry(attempt, Some(&err)) {
                        return Err(self.terminal_failure(&backend.id, &upstream_model, &request.id, err));
                    }
                    attempt += 1;
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    self.backoff_or_cancel(cancel, attempt).await?;
                }
            }
        }
    }

    /// Dispatch one streaming request in pass-through mode: upstream bytes
    /// reach the sink verbatim, and a bounded prefix is captured for the
    /// traffic log. Returns the capture on clean EOF.
    #[tracing::instrument(skip_all, fields(alias = %request.model, req_id = %request.id))]
    pub async fn dispatch_passthrough(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
        sink: &mut (dyn FnMut(Bytes) -> Result<(), ProxyError> + Send),
    ) -> Result<StreamCapture, ProxyError> {
        if request.model.is_empty() {
            return Err(ProxyError::missing_model().with_request_id(&request.id));
        }
        let cfg = self.config();
        let available = self.candidates(&cfg, &request.model)?;
        let max_capture = cfg.gateway.max_capture_bytes;

        let mut attempt: u32 = 0;
        loop {
            let (backend, upstream_model, wire_protocol) =
                self.select_target(&available, &request.model)?;
            let backend_req = protocol::to_backend(request, wire_protocol, &cfg.system_prompts)
                .map_err(ProxyError::protocol)?;

            let _inflight = self.balancer_track(&backend.id);
            let opened = self
                .upstream
                .send_streaming_passthrough(cancel, &backend_req, &backend, &upstream_model, wire_protocol)
                .await;

            let response = match opened {
                Ok(response) => response,
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(backend = %backend.id, attempt, error = %err, "pass-through stream start failed");
                    if !self.retry_strategy().should_retry(attempt, Some(&err)) {
                        return Err(self.terminal_failure(&backend.id, &upstream_model, &request.id, err));
                    }
                    attempt += 1;
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    self.backoff_or_cancel(cancel, attempt).await?;
                    continue;
                }
            };

            // The response is open — from here the stream is committed.
            return relay_verbatim(cancel, response, sink, max_capture, &backend.id).await;
        }
    }
}

/// Copy upstream bytes to the sink as they arrive, capturing up to
/// `max_capture` bytes. EOF ends the stream cleanly; cancellation and
/// transport errors propagate (the upstream connection is dropped with the
/// response).
async fn relay_verbatim(
    cancel: &CancellationToken,
    response: reqwest::Response,
    sink: &mut (dyn FnMut(Bytes) -> Result<(), ProxyError> + Send),
    max_capture: usize,
    backend_id: &str,
) -> Result<StreamCapture, ProxyError> {
    use futures_util::StreamExt as _;

    let mut capture = StreamCapture::default();
    let mut stream = response.bytes_stream();
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProxyError::cancelled()),
            item = stream.next() => item,
        };
        match item {
            Some(Ok(bytes)) => {
                let room = max_capture.saturating_sub(capture.bytes.len());
                if bytes.len() <= room {
                    capture.bytes.extend_from_slice(&bytes);
                } else {
                    capture.bytes.extend_from_slice(&bytes[..room]);
                    capture.truncated = true;
                }
                sink(bytes)?;
            }
            Some(Err(err)) => return Err(ProxyError::from_transport(err, backend_id)),
            None => return Ok(capture),
        }
    }
}
