//! HTTP surface: client listeners, admin listeners, and their middleware.
//!
//! Handlers are a thin shell — request parsing, dialect rendering, and
//! traffic recording. All routing decisions live in [`crate::dispatch`].

pub mod admin;
pub mod admin_auth;
pub mod client;
pub mod client_auth;
pub mod health;
pub mod metrics;
pub mod rate_limit;
pub mod request_id;

use std::{path::PathBuf, sync::Arc};

use crate::{config::Config, dispatch::DispatchEngine, traffic::TrafficLog};

/// Shared application state injected into every request handler via
/// [`axum::extract::State`].
pub struct AppState {
    /// The dispatch engine; owns the live config snapshot.
    pub engine: Arc<DispatchEngine>,
    /// In-memory ring-buffer of recent requests, exposed through the admin API.
    pub traffic: Arc<TrafficLog>,
    /// Path to the config file on disk — used by the hot-reload background task.
    pub config_path: PathBuf,
    /// Proxy start time — used to compute uptime for the admin health endpoint.
    pub started_at: std::time::Instant,
    /// Optional per-caller completion-budget limiter. `None` means rate
    /// limiting is disabled.
    ///
    /// Built once at startup from `config.gateway.rate_limit_rpm`; a config
    /// hot-reload does NOT rebuild it. Restart to change the limit.
    pub rate_limiter: Option<Arc<rate_limit::RateLimiter>>,
    /// Bearer token required for admin API access.
    ///
    /// `None` means admin auth is disabled (port should then be firewalled).
    /// Resolved at startup from `config.gateway.admin_token_env`.
    pub admin_token: Option<String>,
    /// Shared proxy API key required from clients. `None` disables client
    /// auth. Resolved at startup from `config.gateway.proxy_key_env`.
    pub proxy_key: Option<String>,
}

impl AppState {
    pub fn new(config: Arc<Config>, config_path: PathBuf, traffic: Arc<TrafficLog>) -> Self {
        let rate_limiter = config
            .gateway
            .rate_limit_rpm
            .filter(|&rpm| rpm > 0)
            .map(|rpm| Arc::new(rate_limit::RateLimiter::new(rpm)));
        let admin_token = config
            .gateway
            .admin_token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|t| !t.is_empty());
        let proxy_key = config
            .gateway
            .proxy_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty());
        Self {
            engine: Arc::new(DispatchEngine::new(config)),
            traffic,
            config_path,
            started_at: std::time::Instant::now(),
            rate_limiter,
            admin_token,
            proxy_key,
        }
    }

    /// Returns a snapshot of the current live config.
    pub fn config(&self) -> Arc<Config> {
        self.engine.config()
    }
}
