//! Core value types shared across the routing engine.
//!
//! Everything here is a plain data value: [`Backend`] and [`Route`] are
//! read-only snapshots derived from configuration on each resolve call,
//! [`ChatRequest`] and [`ChatResponse`] are the internal wire-neutral request
//! and response shapes, and [`StreamChunk`] is the normalized per-chunk view
//! produced by the streaming translators.
//!
//! None of these types are mutated once built. The protocol translators
//! produce *new* [`ChatRequest`] values rather than editing the input in
//! place, so a request can be re-translated per retry attempt without
//! aliasing surprises.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProxyError;

/// Which API dialect a backend (or client) speaks.
///
/// The Azure / DeepSeek / Groq / Mistral / Cohere dialects are
/// OpenAI-compatible on the wire; they are kept as distinct variants because
/// auth header schemes and error-body conventions differ per provider.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Standard OpenAI `/v1/chat/completions` protocol.
    #[default]
    Openai,
    /// Anthropic Messages API (`/v1/messages`).
    Anthropic,
    /// Google Gemini-style endpoint. Requests pass through untranslated.
    Google,
    /// Azure OpenAI — OpenAI wire format, `api-key` header auth.
    Azure,
    /// DeepSeek — OpenAI-compatible.
    Deepseek,
    /// Groq — OpenAI-compatible.
    Groq,
    /// Mistral — OpenAI-compatible.
    Mistral,
    /// Cohere compatibility endpoint — OpenAI-compatible wire format.
    Cohere,
    /// Custom OpenAI-compatible endpoint (LM Studio, vLLM, Ollama, …).
    Custom,
}

impl Protocol {
    /// True for every dialect that uses the OpenAI chat-completions wire
    /// format, auth scheme differences aside.
    pub fn is_openai_compatible(self) -> bool {
        matches!(
            self,
            Self::Openai | Self::Azure | Self::Deepseek | Self::Groq | Self::Mistral | Self::Cohere | Self::Custom
        )
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Openai => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::Azure => "azure",
            Self::Deepseek => "deepseek",
            Self::Groq => "groq",
            Self::Mistral => "mistral",
            Self::Cohere => "cohere",
            Self::Custom => "custom",
        })
    }
}

/// A configured upstream endpoint, snapshotted from config at resolve time.
///
/// Invariant: a disabled backend never reaches the routing table — the
/// resolver drops routes whose backend is disabled before they are returned.
#[derive(Debug, Clone)]
pub struct Backend {
    /// Unique identifier from the config key.
    pub id: String,
    /// Base URL, scheme-validated at construction (http/https only).
    pub base_url: String,
    /// Resolved API key. Never logged directly — use [`Backend::masked_key`].
    pub api_key: Option<String>,
    pub enabled: bool,
    pub protocol: Protocol,
    /// Optional locale forwarded upstream as `Accept-Language`.
    pub locale: Option<String>,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Backend {
    /// Build a backend, validating the base URL scheme.
    pub fn new(id: impl Into<String>, base_url: impl Into<String>, protocol: Protocol) -> Result<Self, ProxyError> {
        let id = id.into();
        let base_url = base_url.into();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ProxyError::invalid_request(format!(
                "backend `{id}` base_url must start with http:// or https://, got `{base_url}`"
            )));
        }
        Ok(Self {
            id,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
            enabled: true,
            protocol,
            locale: None,
            timeout_ms: 30_000,
        })
    }

    /// API key with all but the last four characters replaced, for logs and
    /// the admin config view. Short keys are fully masked.
    pub fn masked_key(&self) -> Option<String> {
        self.api_key.as_deref().map(|key| {
            if key.len() <= 8 {
                "****".to_string()
            } else {
                format!("****{}", &key[key.len() - 4..])
            }
        })
    }
}

/// One alias-to-backend mapping with priority and upstream model name.
///
/// Smaller priority wins. A route is effectively enabled only when both its
/// own flag and the backend's flag are set; the resolver never returns a
/// route that fails that test.
#[derive(Debug, Clone)]
pub struct Route {
    pub backend: Arc<Backend>,
    /// Model name to send upstream (may differ from the client alias).
    pub upstream_model: String,
    pub priority: u32,
    pub enabled: bool,
    /// Overrides the backend's protocol for this route only.
    pub protocol_override: Option<Protocol>,
}

impl Route {
    /// The wire dialect used when dispatching over this route.
    pub fn protocol(&self) -> Protocol {
        self.protocol_override.unwrap_or(self.backend.protocol)
    }

    pub fn is_effective(&self) -> bool {
        self.enabled && self.backend.enabled
    }
}

/// Message content: either plain text or a structured multimodal block array.
///
/// Block arrays are passed through untouched — the proxy never inspects
/// image or document parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<Value>),
}

impl MessageContent {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.is_empty(),
            Self::Parts(p) => p.is_empty(),
        }
    }

    /// The text form, when the content is a plain string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Parts(_) => None,
        }
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// A function invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_tool_type")]
    pub kind: String,
    pub function: FunctionCall,
}

fn default_tool_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object, kept as the raw string the wire uses.
    #[serde(default)]
    pub arguments: String,
}

/// One conversation turn.
///
/// An empty role is omitted from serialization entirely so clients never see
/// `"role": null` or `"role": ""` leaking out of a partial delta.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(MessageContent::Text(content.into())),
            ..Default::default()
        }
    }

    /// A message is empty when it carries neither content nor tool calls.
    pub fn is_empty(&self) -> bool {
        let no_content = self.content.as_ref().map(|c| c.is_empty()).unwrap_or(true);
        let no_tools = self.tool_calls.as_ref().map(|t| t.is_empty()).unwrap_or(true);
        no_content && no_tools
    }
}

const VALID_ROLES: &[&str] = &["system", "user", "assistant", "tool"];

/// The wire-neutral chat request flowing through the dispatch pipeline.
///
/// Deserializes directly from the OpenAI chat-completions body. Treated as
/// immutable once validated: the translators clone into a new value instead
/// of editing fields.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatRequest {
    /// Proxy-assigned request ID — internal only, never serialized upstream.
    #[serde(skip)]
    pub id: String,
    /// Client-declared model alias.
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Dedicated system prompt (Anthropic dialect); merged from leading
    /// system messages by the Anthropic translator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Forwarded client headers, hop-by-hop headers already stripped.
    #[serde(skip)]
    pub headers: Vec<(String, String)>,
    /// Which dialect the client spoke.
    #[serde(skip)]
    pub client_protocol: Protocol,
}

impl ChatRequest {
    /// Validate the §request invariants.
    ///
    /// A valid request has a non-empty model alias, at least one non-empty
    /// message, roles from the known set, sampling params in range, and tool
    /// calls that carry both an ID and a function name.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.model.is_empty() {
            return Err(ProxyError::missing_model());
        }
        if self.messages.is_empty() {
            return Err(ProxyError::invalid_request("messages must not be empty"));
        }
        for (i, msg) in self.messages.iter().enumerate() {
            if !VALID_ROLES.contains(&msg.role.as_str()) {
                return Err(ProxyError::invalid_request(format!(
                    "messages[{i}] has invalid role `{}`",
                    msg.role
                )));
            }
            if msg.is_empty() {
                return Err(ProxyError::invalid_request(format!("messages[{i}] is empty")));
            }
            if let Some(calls) = &msg.tool_calls {
                for call in calls {
                    if call.id.is_empty() || call.function.name.is_empty() {
                        return Err(ProxyError::invalid_request(format!(
                            "messages[{i}] tool call must carry an id and a function name"
                        )));
                    }
                }
            }
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ProxyError::invalid_request(format!(
                    "temperature must be within [0, 2], got {t}"
                )));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(ProxyError::invalid_request(format!(
                    "top_p must be within [0, 1], got {p}"
                )));
            }
        }
        Ok(())
    }

    /// True when any message has the `system` role.
    pub fn has_system_message(&self) -> bool {
        self.messages.iter().any(|m| m.role == "system")
    }
}

/// Token accounting reported by the upstream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Partial message inside a streaming chunk's choice.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
}

/// One completion alternative. Unary responses carry `message`; streaming
/// chunks carry `delta`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<Delta>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// The wire-neutral response.
///
/// `choices` is a plain `Vec` and therefore always serializes as an array —
/// clients never receive `"choices": null`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    /// `"chat.completion"` or `"chat.completion.chunk"`.
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Provider-native stop reason carried through from Anthropic responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    /// Selected upstream response headers, surfaced to the HTTP layer only.
    #[serde(skip)]
    pub headers: Vec<(String, String)>,
}

impl ChatResponse {
    /// Content of the first choice, when it is plain text.
    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.as_ref())
            .and_then(|m| m.content.as_ref())
            .and_then(|c| c.as_text())
    }
}

/// Producer-side normalized view of one upstream streaming chunk, used by
/// the standard streaming adapter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamChunk {
    /// Terminal marker — set on `[DONE]` and on Anthropic `message_stop`.
    pub finished: bool,
    /// Delta content aggregated over the chunk's choices in index order.
    pub content: String,
    pub stop_reason: Option<String>,
}

impl StreamChunk {
    /// The terminal marker chunk.
    pub fn terminal() -> Self {
        Self { finished: true, ..Default::default() }
    }
}
