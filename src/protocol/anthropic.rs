//! Anthropic Messages API translation.
//!
//! Handles both directions of the bracket: requests headed *to* an Anthropic
//! backend (system messages folded into the dedicated `system` field, tool
//! calls re-shaped into content blocks) and responses coming *from* one
//! (content blocks mapped onto a single choice, `stop_reason` /
//! `stop_sequences` carried through). The same module hosts the client-side
//! dialect helpers used by the `/v1/messages` listener, so the block-mapping
//! tables live in one place.
//!
//! # Protocol differences handled here
//!
//! | Concern | OpenAI | Anthropic |
//! |---|---|---|
//! | System prompt | First message with `role: "system"` | Top-level `system` field |
//! | Max tokens | Optional (`max_tokens`) | **Required** (`max_tokens`) |
//! | Finish reasons | `"stop"`, `"length"`, `"tool_calls"` | `"end_turn"`, `"max_tokens"`, `"tool_use"` |
//! | Response shape | `choices[].message.content` | `content[].text` |
//! | Tool calls | `message.tool_calls[]` | `content[]` blocks of type `tool_use` |
//! | Tool results | `role: "tool"` messages | `user` message with `tool_result` block |

use serde_json::{json, Map, Value};

use crate::{
    error::ProxyError,
    protocol::merge_system_prompts,
    types::{
        ChatMessage, ChatRequest, ChatResponse, Choice, FunctionCall, MessageContent, StreamChunk,
        ToolCall, Usage,
    },
};

/// Default max_tokens when the caller omits it. Required by Anthropic;
/// sensible ceiling for most conversational use-cases.
const DEFAULT_MAX_TOKENS: u32 = 8_192;

/// Anthropic API version header value.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

// ──────────────────────────────────────────────────────────────────────────────
// Backend direction: proxy → Anthropic upstream
// ──────────────────────────────────────────────────────────────────────────────

/// Rewrite a request for an Anthropic backend: leading system messages are
/// extracted into the dedicated `system` field (merged after any system
/// prompt the request already carries), and the remaining messages become the
/// content. String and structured multimodal content both pass through.
pub fn to_backend(request: &ChatRequest) -> Result<ChatRequest, ProxyError> {
    let mut system_parts: Vec<&str> = Vec::new();
    if let Some(existing) = request.system.as_deref() {
        if !existing.is_empty() {
            system_parts.push(existing);
        }
    }

    let mut remaining = Vec::with_capacity(request.messages.len());
    let mut in_prefix = true;
    for msg in &request.messages {
        if in_prefix && msg.role == "system" {
            if let Some(text) = msg.content.as_ref().and_then(MessageContent::as_text) {
                system_parts.push(text);
            }
            continue;
        }
        in_prefix = false;
        remaining.push(msg.clone());
    }

    let merged = merge_system_prompts(&system_parts);
    let mut out = request.clone();
    out.system = if merged.is_empty() { None } else { Some(merged) };
    out.messages = remaining;
    Ok(out)
}

/// Serialize a translated request into the Anthropic Messages wire body.
pub fn request_body(request: &ChatRequest, upstream_model: &str) -> Value {
    let mut messages: Vec<Value> = Vec::with_capacity(request.messages.len());
    for msg in &request.messages {
        messages.push(message_to_wire(msg));
    }

    let mut body = json!({
        "model": upstream_model,
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
        "stream": request.stream,
    });
    if let Some(system) = &request.system {
        body["system"] = json!(system);
    }
    if let Some(t) = request.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = request.top_p {
        body["top_p"] = json!(p);
    }
    if let Some(stop) = &request.stop {
        body["stop_sequences"] = json!(stop);
    }
    if let Some(tools) = &request.tools {
        let mapped: Vec<Value> = tools.iter().map(tool_to_wire).collect();
        if !mapped.is_empty() {
            body["tools"] = json!(mapped);
        }
    }
    body
}

/// One internal message → Anthropic wire message.
fn message_to_wire(msg: &ChatMessage) -> Value {
    // Tool results travel as user messages carrying a tool_result block.
    if msg.role == "tool" {
        let text = msg.content.as_ref().and_then(MessageContent::as_text).unwrap_or("");
        return json!({
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                "content": text,
            }],
        });
    }

    // Assistant tool calls become tool_use blocks alongside any text.
    if let Some(calls) = msg.tool_calls.as_ref().filter(|c| !c.is_empty()) {
        let mut blocks: Vec<Value> = Vec::new();
        if let Some(text) = msg.content.as_ref().and_then(MessageContent::as_text) {
            if !text.is_empty() {
                blocks.push(json!({ "type": "text", "text": text }));
            }
        }
        for call in calls {
            let input: Value =
                serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
            blocks.push(json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.function.name,
                "input": input,
            }));
        }
        return json!({ "role": msg.role, "content": blocks });
    }

    match &msg.content {
        Some(MessageContent::Text(text)) => json!({ "role": msg.role, "content": text }),
        Some(MessageContent::Parts(parts)) => json!({ "role": msg.role, "content": parts }),
        None => json!({ "role": msg.role, "content": "" }),
    }
}

/// OpenAI function-tool definition → Anthropic tool definition.
fn tool_to_wire(tool: &Value) -> Value {
    let function = tool.get("function").unwrap_or(tool);
    json!({
        "name": function.get("name").cloned().unwrap_or_default(),
        "description": function.get("description").cloned().unwrap_or_default(),
        "input_schema": function
            .get("parameters")
            .or_else(|| function.get("input_schema"))
            .cloned()
            .unwrap_or_else(|| json!({ "type": "object" })),
    })
}

/// Parse an Anthropic Messages response into the wire-neutral shape: content
/// blocks collapse into a single choice, `stop_reason` and `stop_sequence`
/// are carried through alongside the mapped `finish_reason`.
pub fn from_backend(raw: &[u8]) -> Result<ChatResponse, ProxyError> {
    let body: Value = serde_json::from_slice(raw).map_err(ProxyError::protocol)?;

    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    if let Some(blocks) = body["content"].as_array() {
        for block in blocks {
            match block["type"].as_str() {
                Some("text") => text.push_str(block["text"].as_str().unwrap_or("")),
                Some("tool_use") => tool_calls.push(ToolCall {
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: block["name"].as_str().unwrap_or("").to_string(),
                        arguments: block["input"].to_string(),
                    },
                }),
                _ => {}
            }
        }
    }

    let stop_reason = body["stop_reason"].as_str().map(str::to_string);
    let finish_reason = stop_reason.as_deref().map(map_stop_reason).map(str::to_string);

    let message = ChatMessage {
        role: "assistant".to_string(),
        content: Some(MessageContent::Text(text)),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        ..Default::default()
    };

    let usage = body.get("usage").map(|u| {
        let prompt = u["input_tokens"].as_u64().unwrap_or(0) as u32;
        let completion = u["output_tokens"].as_u64().unwrap_or(0) as u32;
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    });

    Ok(ChatResponse {
        id: body["id"].as_str().unwrap_or("").to_string(),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: body["model"].as_str().unwrap_or("").to_string(),
        choices: vec![Choice {
            index: 0,
            message: Some(message),
            delta: None,
            finish_reason,
        }],
        usage,
        stop_reason,
        stop_sequences: body["stop_sequence"].as_str().map(|s| vec![s.to_string()]),
        headers: Vec::new(),
    })
}

/// `stop_reason` → OpenAI `finish_reason`.
fn map_stop_reason(reason: &str) -> &str {
    match reason {
        "end_turn" | "stop_sequence" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        other => other,
    }
}

/// OpenAI `finish_reason` → Anthropic `stop_reason`, for client responses.
fn unmap_finish_reason(reason: &str) -> &str {
    match reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        other => other,
    }
}

/// Translate one raw SSE line from an Anthropic upstream stream.
///
/// `event:` lines and pings carry no payload and yield an empty chunk;
/// `content_block_delta` contributes text, `message_delta` records the stop
/// reason, and `message_stop` terminates the stream.
pub fn translate_chunk(raw: &str) -> Result<StreamChunk, ProxyError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with("event:") {
        return Ok(StreamChunk::default());
    }
    let payload = trimmed.strip_prefix("data:").map(str::trim_start).unwrap_or(trimmed);
    if payload.is_empty() {
        return Ok(StreamChunk::default());
    }

    let body: Value = serde_json::from_str(payload).map_err(ProxyError::protocol)?;
    match body["type"].as_str() {
        Some("content_block_delta") => Ok(StreamChunk {
            finished: false,
            content: body["delta"]["text"].as_str().unwrap_or("").to_string(),
            stop_reason: None,
        }),
        Some("message_delta") => Ok(StreamChunk {
            finished: false,
            content: String::new(),
            stop_reason: body["delta"]["stop_reason"]
                .as_str()
                .map(map_stop_reason)
                .map(str::to_string),
        }),
        Some("message_stop") => Ok(StreamChunk::terminal()),
        // message_start, content_block_start/stop, ping
        _ => Ok(StreamChunk::default()),
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Client direction: Anthropic-dialect listener
// ──────────────────────────────────────────────────────────────────────────────

/// Parse an Anthropic-dialect client body (`POST /v1/messages`) into the
/// wire-neutral request.
pub fn from_client_request(body: &Value) -> Result<ChatRequest, ProxyError> {
    let model = body["model"].as_str().unwrap_or("").to_string();

    let system = match &body["system"] {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter_map(|b| b["text"].as_str())
                .collect();
            (!parts.is_empty()).then(|| merge_system_prompts(&parts))
        }
        _ => None,
    };

    let mut messages: Vec<ChatMessage> = Vec::new();
    for raw_msg in body["messages"].as_array().into_iter().flatten() {
        let role = raw_msg["role"].as_str().unwrap_or("").to_string();
        match &raw_msg["content"] {
            Value::String(text) => {
                messages.push(ChatMessage::text(role, text.clone()));
            }
            Value::Array(blocks) => {
                append_block_messages(&mut messages, role, blocks);
            }
            _ => {
                return Err(ProxyError::invalid_request(
                    "message content must be a string or a block array",
                ))
            }
        }
    }

    let tools = body["tools"].as_array().map(|tools| {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t["name"],
                        "description": t["description"],
                        "parameters": t.get("input_schema").cloned().unwrap_or_else(|| json!({})),
                    },
                })
            })
            .collect::<Vec<Value>>()
    });

    Ok(ChatRequest {
        model,
        system,
        messages,
        max_tokens: body["max_tokens"].as_u64().map(|v| v as u32),
        temperature: body["temperature"].as_f64().map(|v| v as f32),
        top_p: body["top_p"].as_f64().map(|v| v as f32),
        stream: body["stream"].as_bool().unwrap_or(false),
        stop: body["stop_sequences"].as_array().map(|seq| {
            seq.iter().filter_map(Value::as_str).map(str::to_string).collect()
        }),
        user: body["metadata"]["user_id"].as_str().map(str::to_string),
        tools,
        client_protocol: crate::types::Protocol::Anthropic,
        ..Default::default()
    })
}

/// Expand one Anthropic block-array message into internal messages. Tool-use
/// blocks attach to an assistant message as tool calls; tool-result blocks
/// become `role: "tool"` messages; everything else stays a block array.
fn append_block_messages(messages: &mut Vec<ChatMessage>, role: String, blocks: &[Value]) {
    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut passthrough: Vec<Value> = Vec::new();

    for block in blocks {
        match block["type"].as_str() {
            Some("text") => text.push_str(block["text"].as_str().unwrap_or("")),
            Some("tool_use") => tool_calls.push(ToolCall {
                id: block["id"].as_str().unwrap_or("").to_string(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: block["name"].as_str().unwrap_or("").to_string(),
                    arguments: block["input"].to_string(),
                },
            }),
            Some("tool_result") => {
                let content = match &block["content"] {
                    Value::String(s) => s.clone(),
                    Value::Array(parts) => parts
                        .iter()
                        .filter_map(|p| p["text"].as_str())
                        .collect::<Vec<_>>()
                        .join(""),
                    _ => String::new(),
                };
                messages.push(ChatMessage {
                    role: "tool".to_string(),
                    content: Some(MessageContent::Text(content)),
                    tool_call_id: block["tool_use_id"].as_str().map(str::to_string),
                    ..Default::default()
                });
            }
            _ => passthrough.push(block.clone()),
        }
    }

    if !passthrough.is_empty() {
        // Multimodal content — keep the original block array intact.
        messages.push(ChatMessage {
            role,
            content: Some(MessageContent::Parts(blocks.to_vec())),
            ..Default::default()
        });
        return;
    }

    if !text.is_empty() || !tool_calls.is_empty() {
        messages.push(ChatMessage {
            role,
            content: (!text.is_empty()).then_some(MessageContent::Text(text)),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            ..Default::default()
        });
    }
}

/// Render a unary response in the Anthropic client dialect.
pub fn client_response(response: &ChatResponse) -> Value {
    let mut content: Vec<Value> = Vec::new();
    let choice = response.choices.first();
    if let Some(message) = choice.and_then(|c| c.message.as_ref()) {
        match &message.content {
            Some(MessageContent::Text(text)) if !text.is_empty() => {
                content.push(json!({ "type": "text", "text": text }));
            }
            Some(MessageContent::Parts(parts)) => content.extend(parts.iter().cloned()),
            _ => {}
        }
        for call in message.tool_calls.iter().flatten() {
            let input: Value =
                serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
            content.push(json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.function.name,
                "input": input,
            }));
        }
    }

    // Prefer the provider-native stop reason carried through verbatim; map
    // back from the finish reason otherwise.
    let stop_reason = response
        .stop_reason
        .clone()
        .or_else(|| {
            choice
                .and_then(|c| c.finish_reason.as_deref())
                .map(unmap_finish_reason)
                .map(str::to_string)
        });

    let mut body = Map::new();
    body.insert("id".into(), json!(response.id));
    body.insert("type".into(), json!("message"));
    body.insert("role".into(), json!("assistant"));
    body.insert("model".into(), json!(response.model));
    body.insert("content".into(), json!(content));
    body.insert("stop_reason".into(), json!(stop_reason));
    body.insert(
        "stop_sequence".into(),
        json!(response.stop_sequences.as_ref().and_then(|s| s.first())),
    );
    if let Some(usage) = &response.usage {
        body.insert(
            "usage".into(),
            json!({
                "input_tokens": usage.prompt_tokens,
                "output_tokens": usage.completion_tokens,
            }),
        );
    }
    Value::Object(body)
}

/// Frame one Anthropic client SSE event: `event: <name>\ndata: <json>\n\n`.
pub fn sse_event(name: &str, data: &Value) -> String {
    format!("event: {name}\ndata: {data}\n\n")
}
