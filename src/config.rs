//! Configuration types for llm-relay.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults. A background watcher
//! re-loads the file on mtime change and publishes a fresh snapshot; a single
//! dispatch call always sees one consistent snapshot.
//!
//! # Example
//! ```toml
//! [gateway]
//! client_port = 8080
//!
//! [backends.openai-main]
//! base_url = "https://api.openai.com"
//! api_key_env = "OPENAI_API_KEY"
//! protocol = "openai"
//!
//! [models."m/chat"]
//! routes = [
//!   { backend = "openai-main", model = "gpt-4o", priority = 1 },
//! ]
//!
//! [fallback]
//! "m/chat" = ["m/chat-mini"]
//!
//! [load_balancer]
//! strategy = "round_robin"
//!
//! [retry]
//! max_retries = 2
//! ```

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::types::Protocol;

/// Top-level proxy configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Named upstream backends (OpenAI, Anthropic, Azure, local vLLM, …).
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,

    /// Client alias → routing table.
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,

    /// Alias → ordered list of alternate aliases tried when every route of
    /// the primary alias is cooling down.
    #[serde(default)]
    pub fallback: HashMap<String, Vec<String>>,

    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Alias → system prompt injected for OpenAI-family backends when the
    /// request has no system message of its own.
    #[serde(default)]
    pub system_prompts: HashMap<String, String>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        // Every backend URL must carry an http(s) scheme.
        for (id, backend) in &self.backends {
            anyhow::ensure!(
                backend.base_url.starts_with("http://") || backend.base_url.starts_with("https://"),
                "backend `{}` base_url must start with http:// or https://",
                id
            );
        }

        // Every route must reference a known backend.
        for (alias, model) in &self.models {
            for route in &model.routes {
                anyhow::ensure!(
                    self.backends.contains_key(&route.backend),
                    "model `{}` route references unknown backend `{}`",
                    alias,
                    route.backend
                );
            }
        }

        // Every fallback alias must itself be a configured model.
        for (alias, alternates) in &self.fallback {
            anyhow::ensure!(
                self.models.contains_key(alias),
                "fallback entry `{}` is not a configured model alias",
                alias
            );
            for alternate in alternates {
                anyhow::ensure!(
                    self.models.contains_key(alternate),
                    "fallback for `{}` references unknown alias `{}`",
                    alias,
                    alternate
                );
            }
        }

        // Retry parameter ranges.
        anyhow::ensure!(
            self.retry.multiplier >= 1.0,
            "retry.multiplier must be >= 1, got {}",
            self.retry.multiplier
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.retry.jitter),
            "retry.jitter must be within [0, 1], got {}",
            self.retry.jitter
        );
        anyhow::ensure!(
            self.retry.initial_delay_ms <= self.retry.max_delay_ms,
            "retry.initial_delay_ms ({}) must not exceed retry.max_delay_ms ({})",
            self.retry.initial_delay_ms,
            self.retry.max_delay_ms
        );

        Ok(())
    }
}

/// Core listener settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Port for the client API (default: 8080).
    #[serde(default = "defaults::client_port")]
    pub client_port: u16,

    /// Port for the admin API (default: 8081).
    #[serde(default = "defaults::admin_port")]
    pub admin_port: u16,

    /// Number of recent requests to keep in the in-memory traffic log (default: 500).
    #[serde(default = "defaults::traffic_log_capacity")]
    pub traffic_log_capacity: usize,

    /// Log level override (also controlled by `RUST_LOG` env var).
    #[serde(default)]
    pub log_level: Option<String>,

    /// Completions per minute allowed per caller on the client port.
    ///
    /// A caller is the presented API credential, or the peer IP when no
    /// credential is sent. Only the completion endpoints are metered; the
    /// burst allowance is ten seconds of budget (`rpm / 6`, minimum one
    /// call). Leave unset (or set to 0) to disable rate limiting.
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,

    /// Environment variable whose value is the shared proxy API key clients
    /// must present (`Authorization: Bearer` or `x-api-key`). Leave unset to
    /// disable client authentication.
    #[serde(default)]
    pub proxy_key_env: Option<String>,

    /// Environment variable whose value is the Bearer token required for all
    /// admin API requests. Leave unset to disable admin authentication (only
    /// recommended when the admin port is strictly firewalled).
    #[serde(default)]
    pub admin_token_env: Option<String>,

    /// Upper bound on bytes captured from a pass-through stream for the
    /// traffic log (default: 64 KiB). Capture past this point is dropped and
    /// the record is marked truncated.
    #[serde(default = "defaults::max_capture_bytes")]
    pub max_capture_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            client_port: defaults::client_port(),
            admin_port: defaults::admin_port(),
            traffic_log_capacity: defaults::traffic_log_capacity(),
            log_level: None,
            rate_limit_rpm: None,
            proxy_key_env: None,
            admin_token_env: None,
            max_capture_bytes: defaults::max_capture_bytes(),
        }
    }
}

/// A named upstream backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Base URL without the API path suffix (added per protocol).
    pub base_url: String,

    /// Environment variable name whose value is the API key.
    ///
    /// Leave unset for keyless local backends (e.g., Ollama with no auth).
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Wire dialect this backend speaks. Defaults to OpenAI.
    #[serde(default)]
    pub protocol: Protocol,

    /// A disabled backend never participates in routing.
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Request timeout in milliseconds (default: 30 000). Applies to unary
    /// calls; streaming calls have no overall deadline.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Optional locale forwarded upstream as `Accept-Language`.
    #[serde(default)]
    pub locale: Option<String>,
}

impl BackendConfig {
    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty())
    }
}

/// Routing table for one client-facing model alias.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    /// A disabled alias resolves to nothing, as if absent.
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Candidate routes, ordered by ascending priority at resolve time.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// One alias-to-backend route.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Which backend to use (must exist in `[backends]`).
    pub backend: String,

    /// Model name to send to the backend.
    pub model: String,

    /// Smaller priority is preferred. Equal priorities keep source order.
    #[serde(default = "defaults::priority")]
    pub priority: u32,

    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Overrides the backend's protocol for this route only.
    #[serde(default)]
    pub protocol: Option<Protocol>,

    /// Marks the upstream model as a reasoning model. Informational — shown
    /// in the admin config view.
    #[serde(default)]
    pub reasoning: Option<bool>,
}

/// Which balancing strategy selects among a filtered candidate set.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BalancerStrategy {
    Random,
    #[default]
    RoundRobin,
    Priority,
    LeastConn,
    Weighted,
}

impl std::fmt::Display for BalancerStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Random => "random",
            Self::RoundRobin => "round_robin",
            Self::Priority => "priority",
            Self::LeastConn => "least_conn",
            Self::Weighted => "weighted",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct LoadBalancerConfig {
    #[serde(default)]
    pub strategy: BalancerStrategy,
}

/// Retry and backoff policy for upstream failures.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Additional attempts after the first failure. 0 means the first attempt
    /// only — there is no hidden default; operators opt in explicitly.
    #[serde(default)]
    pub max_retries: u32,

    #[serde(default = "defaults::enabled")]
    pub enable_backoff: bool,

    #[serde(default = "defaults::initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,

    /// Exponential growth factor per attempt. Must be >= 1.
    #[serde(default = "defaults::multiplier")]
    pub multiplier: f64,

    /// Jitter fraction in [0, 1]: each delay is scaled by a factor drawn
    /// uniformly from `[1 - jitter, 1 + jitter]`.
    #[serde(default)]
    pub jitter: f64,

    /// When present, replaces the default retryability policy entirely.
    #[serde(default)]
    pub error_fallback: Option<ErrorFallbackConfig>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            enable_backoff: true,
            initial_delay_ms: defaults::initial_delay_ms(),
            max_delay_ms: defaults::max_delay_ms(),
            multiplier: defaults::multiplier(),
            jitter: 0.0,
            error_fallback: None,
        }
    }
}

/// Operator-configured retryability matching, split into a server-error group
/// and a client-error group.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ErrorFallbackConfig {
    #[serde(default)]
    pub server_error: ServerErrorGroup,
    #[serde(default)]
    pub client_error: ClientErrorGroup,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerErrorGroup {
    /// Retry on HTTP 5xx and the canonical server-error phrases.
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClientErrorGroup {
    #[serde(default)]
    pub enabled: bool,
    /// Status codes matched as substrings of the error message.
    #[serde(default)]
    pub status_codes: Vec<u16>,
    /// Case-insensitive substrings matched against the error message.
    #[serde(default)]
    pub patterns: Vec<String>,
}

mod defaults {
    pub fn client_port() -> u16 { 8080 }
    pub fn admin_port() -> u16 { 8081 }
    pub fn traffic_log_capacity() -> usize { 500 }
    pub fn timeout_ms() -> u64 { 30_000 }
    pub fn enabled() -> bool { true }
    pub fn priority() -> u32 { 100 }
    pub fn initial_delay_ms() -> u64 { 200 }
    pub fn max_delay_ms() -> u64 { 2_000 }
    pub fn multiplier() -> f64 { 2.0 }
    pub fn max_capture_bytes() -> usize { 64 * 1024 }
}
