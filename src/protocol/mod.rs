//! Protocol translation bracket: request-in / response-out conversion keyed
//! by backend protocol.
//!
//! Translation never mutates the incoming request — every rewrite clones into
//! a new [`ChatRequest`] so a request can be re-translated per retry attempt
//! against whichever backend the balancer picks. The per-protocol mapping
//! lives in [`openai`] and [`anthropic`]; dialects not listed pass through
//! untouched (Google and unknown customs are forwarded as received).

pub mod anthropic;
pub mod openai;

use std::collections::HashMap;

use crate::{
    error::ProxyError,
    types::{ChatRequest, ChatResponse, Protocol, StreamChunk},
};

/// Rewrite a client request for the given backend dialect.
///
/// - OpenAI-family: injects the configured system prompt for the alias when
///   the request has no system message of its own.
/// - Anthropic: folds leading system messages into the dedicated `system`
///   field.
/// - Anything else: pass-through clone.
pub fn to_backend(
    request: &ChatRequest,
    protocol: Protocol,
    system_prompts: &HashMap<String, String>,
) -> Result<ChatRequest, ProxyError> {
    match protocol {
        Protocol::Anthropic => anthropic::to_backend(request),
        p if p.is_openai_compatible() => openai::to_backend(request, system_prompts),
        _ => Ok(request.clone()),
    }
}

/// Parse a raw upstream response body into the wire-neutral shape.
pub fn from_backend(raw: &[u8], alias: &str, protocol: Protocol) -> Result<ChatResponse, ProxyError> {
    if raw.is_empty() {
        return Err(ProxyError::invalid_request("response is empty"));
    }
    let mut response = match protocol {
        Protocol::Anthropic => anthropic::from_backend(raw)?,
        p if p.is_openai_compatible() => openai::from_backend(raw)?,
        // No strategy for this dialect — attempt a direct parse into the
        // standard schema.
        _ => openai::from_backend(raw)?,
    };
    if response.model.is_empty() {
        response.model = alias.to_string();
    }
    Ok(response)
}

/// Translate one raw upstream streaming chunk into the normalized
/// [`StreamChunk`] shape, dispatching on the backend dialect.
pub fn translate_chunk(raw: &str, protocol: Protocol) -> Result<StreamChunk, ProxyError> {
    match protocol {
        Protocol::Anthropic => anthropic::translate_chunk(raw),
        _ => openai::translate_chunk(raw),
    }
}

/// Concatenate system prompt fragments with a blank line between entries,
/// preserving order. An empty input produces the empty string.
pub fn merge_system_prompts(parts: &[&str]) -> String {
    parts.join("\n\n")
}
