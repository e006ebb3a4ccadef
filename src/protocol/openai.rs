//! OpenAI-family translation.
//!
//! The OpenAI chat-completions schema is the proxy's internal shape, so the
//! unary mapping is nearly pass-through: requests only gain a system message
//! when one is configured for the alias, and responses parse field-for-field.
//! The interesting part is the streaming chunk translator, which unwraps SSE
//! `data:` framing, recognizes the `[DONE]` sentinel, and aggregates
//! `delta.content` across choices in index order.

use std::collections::HashMap;

use crate::{
    error::ProxyError,
    types::{ChatMessage, ChatRequest, ChatResponse, Protocol, StreamChunk},
};

/// Rewrite a request for an OpenAI-compatible backend.
///
/// When the system-prompt map carries a non-empty entry for the request's
/// alias and the request has no `system` message of its own, a new system
/// message is prepended. Every other field is preserved exactly. The produced
/// request always carries `client_protocol = openai`.
pub fn to_backend(
    request: &ChatRequest,
    system_prompts: &HashMap<String, String>,
) -> Result<ChatRequest, ProxyError> {
    let configured = system_prompts
        .get(&request.model)
        .map(String::as_str)
        .filter(|p| !p.is_empty());

    let mut out = request.clone();
    out.client_protocol = Protocol::Openai;

    if let Some(prompt) = configured {
        if !request.has_system_message() {
            let mut messages = Vec::with_capacity(request.messages.len() + 1);
            messages.push(ChatMessage::text("system", prompt));
            messages.extend(request.messages.iter().cloned());
            out.messages = messages;
        }
    }
    Ok(out)
}

/// Parse an OpenAI-family response body. Field-for-field mapping; empty role
/// fields are omitted on re-serialization so nulls never leak to clients.
pub fn from_backend(raw: &[u8]) -> Result<ChatResponse, ProxyError> {
    serde_json::from_slice(raw).map_err(ProxyError::protocol)
}

/// Serialize a translated request into the wire body for an OpenAI-family
/// backend, substituting the route's upstream model name.
pub fn request_body(request: &ChatRequest, upstream_model: &str) -> serde_json::Value {
    let mut body = serde_json::to_value(request).unwrap_or_default();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".to_string(), serde_json::Value::String(upstream_model.to_string()));
        // The dedicated system field is an Anthropic concept; OpenAI backends
        // receive system content as a leading message instead.
        obj.remove("system");
    }
    body
}

/// Translate one raw SSE chunk from an OpenAI-family stream.
///
/// Accepts the chunk with or without its `data: ` framing. `[DONE]` becomes a
/// terminal [`StreamChunk`]; JSON chunks aggregate `delta.content` across
/// choices in ascending index order and surface the first non-empty
/// `finish_reason`. Role-only chunks produce empty content. A parse failure
/// is an error return — the standard streaming pipeline logs and skips it
/// rather than tearing the stream down.
pub fn translate_chunk(raw: &str) -> Result<StreamChunk, ProxyError> {
    let payload = unframe(raw);
    if payload.is_empty() {
        return Ok(StreamChunk::default());
    }
    if payload == "[DONE]" {
        return Ok(StreamChunk::terminal());
    }

    let parsed: ChatResponse = serde_json::from_str(payload).map_err(ProxyError::protocol)?;

    let mut choices: Vec<_> = parsed.choices.iter().collect();
    choices.sort_by_key(|c| c.index);

    let mut content = String::new();
    let mut stop_reason = None;
    for choice in choices {
        if let Some(delta) = &choice.delta {
            if let Some(text) = &delta.content {
                content.push_str(text);
            }
        }
        if stop_reason.is_none() {
            stop_reason = choice.finish_reason.clone().filter(|r| !r.is_empty());
        }
    }

    Ok(StreamChunk {
        finished: stop_reason.is_some(),
        content,
        stop_reason,
    })
}

/// Strip SSE `data:` framing and surrounding whitespace from a raw chunk.
fn unframe(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix("data:")
        .map(str::trim_start)
        .unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageContent;
    use serde_json::json;

    fn request() -> ChatRequest {
        ChatRequest {
            id: "req-1".into(),
            model: "m/a".into(),
            messages: vec![ChatMessage::text("user", "hello")],
            max_tokens: Some(128),
            temperature: Some(0.7),
            ..Default::default()
        }
    }

    // -----------------------------------------------------------------------
    // to_backend — system prompt injection
    // -----------------------------------------------------------------------

    #[test]
    fn injects_configured_system_prompt() {
        let prompts = HashMap::from([("m/a".to_string(), "You are terse.".to_string())]);
        let out = to_backend(&request(), &prompts).unwrap();

        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.messages[0].role, "system");
        assert_eq!(out.messages[0].content.as_ref().unwrap().as_text(), Some("You are terse."));
        assert_eq!(out.messages[1].role, "user");
        assert_eq!(out.client_protocol, Protocol::Openai);
    }

    #[test]
    fn does_not_inject_when_request_has_system_message() {
        let mut req = request();
        req.messages.insert(0, ChatMessage::text("system", "client prompt wins"));
        let prompts = HashMap::from([("m/a".to_string(), "configured".to_string())]);

        let out = to_backend(&req, &prompts).unwrap();
        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.messages[0].content.as_ref().unwrap().as_text(), Some("client prompt wins"));
    }

    #[test]
    fn does_not_inject_empty_or_missing_prompt() {
        let out = to_backend(&request(), &HashMap::new()).unwrap();
        assert_eq!(out.messages.len(), 1);

        let prompts = HashMap::from([("m/a".to_string(), String::new())]);
        let out = to_backend(&request(), &prompts).unwrap();
        assert_eq!(out.messages.len(), 1);
    }

    #[test]
    fn to_backend_preserves_all_other_fields_and_input() {
        let req = request();
        let prompts = HashMap::from([("m/a".to_string(), "P".to_string())]);
        let out = to_backend(&req, &prompts).unwrap();

        assert_eq!(out.max_tokens, Some(128));
        assert_eq!(out.temperature, Some(0.7));
        assert_eq!(out.model, "m/a");
        // The input is untouched — a new value was produced.
        assert_eq!(req.messages.len(), 1);
    }

    // -----------------------------------------------------------------------
    // from_backend
    // -----------------------------------------------------------------------

    #[test]
    fn from_backend_parses_standard_response() {
        let raw = br#"{
            "id": "r1",
            "object": "chat.completion",
            "created": 1700000000,
            "model": "gpt-4",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": "ok" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 5, "completion_tokens": 1, "total_tokens": 6 }
        }"#;
        let resp = from_backend(raw).unwrap();
        assert_eq!(resp.id, "r1");
        assert_eq!(resp.first_content(), Some("ok"));
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(resp.usage.unwrap().total_tokens, 6);
    }

    #[test]
    fn from_backend_rejects_malformed_json() {
        assert!(from_backend(b"{not json").is_err());
    }

    // -----------------------------------------------------------------------
    // request_body
    // -----------------------------------------------------------------------

    #[test]
    fn request_body_substitutes_upstream_model() {
        let body = request_body(&request(), "gpt-4-turbo");
        assert_eq!(body["model"], "gpt-4-turbo");
        assert_eq!(body["messages"][0]["content"], "hello");
        assert_eq!(body["max_tokens"], 128);
        assert!(body.get("system").is_none());
    }

    #[test]
    fn round_trip_preserves_request_fields_without_system_prompt() {
        // toBackend with no configured prompt, serialized and re-parsed,
        // keeps id-relevant fields intact.
        let req = request();
        let translated = to_backend(&req, &HashMap::new()).unwrap();
        let body = request_body(&translated, "gpt-4");
        let reparsed: ChatRequest = serde_json::from_value(body).unwrap();
        assert_eq!(reparsed.messages, req.messages);
        assert_eq!(reparsed.max_tokens, req.max_tokens);
        assert_eq!(reparsed.temperature, req.temperature);
    }

    // -----------------------------------------------------------------------
    // translate_chunk
    // -----------------------------------------------------------------------

    #[test]
    fn chunk_done_sentinel_is_terminal() {
        let chunk = translate_chunk("data: [DONE]").unwrap();
        assert!(chunk.finished);
        assert_eq!(chunk.content, "");
    }

    #[test]
    fn chunk_strips_data_framing() {
        let chunk = translate_chunk(
            r#"data: {"choices":[{"index":0,"delta":{"content":"he"}}]}"#,
        )
        .unwrap();
        assert_eq!(chunk.content, "he");
        assert!(!chunk.finished);
    }

    #[test]
    fn chunk_without_framing_also_parses() {
        let chunk = translate_chunk(r#"{"choices":[{"index":0,"delta":{"content":"x"}}]}"#).unwrap();
        assert_eq!(chunk.content, "x");
    }

    #[test]
    fn chunk_aggregates_choices_in_index_order() {
        let chunk = translate_chunk(
            r#"{"choices":[
                {"index":1,"delta":{"content":"world"}},
                {"index":0,"delta":{"content":"hello "}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(chunk.content, "hello world");
    }

    #[test]
    fn chunk_finish_reason_is_terminal() {
        let chunk = translate_chunk(
            r#"{"choices":[{"index":0,"delta":{"content":"llo"},"finish_reason":"stop"}]}"#,
        )
        .unwrap();
        assert!(chunk.finished);
        assert_eq!(chunk.stop_reason.as_deref(), Some("stop"));
        assert_eq!(chunk.content, "llo");
    }

    #[test]
    fn role_only_chunk_produces_empty_content() {
        let chunk = translate_chunk(
            r#"{"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#,
        )
        .unwrap();
        assert_eq!(chunk.content, "");
        assert!(!chunk.finished);
    }

    #[test]
    fn malformed_chunk_is_an_error() {
        assert!(translate_chunk("data: {bad}").is_err());
    }

    #[test]
    fn empty_finish_reason_is_not_terminal() {
        let chunk = translate_chunk(
            r#"{"choices":[{"index":0,"delta":{"content":"a"},"finish_reason":""}]}"#,
        )
        .unwrap();
        assert!(!chunk.finished);
        assert!(chunk.stop_reason.is_none());
    }

    #[test]
    fn multimodal_request_content_survives_request_body() {
        let mut req = request();
        req.messages = vec![ChatMessage {
            role: "user".into(),
            content: Some(MessageContent::Parts(vec![
                json!({ "type": "text", "text": "what is this" }),
                json!({ "type": "image_url", "image_url": { "url": "https://x/img.png" } }),
            ])),
            ..Default::default()
        }];
        let body = request_body(&req, "gpt-4o");
        assert!(body["messages"][0]["content"].is_array());
    }
}
