//! The request-dispatch engine: resolve → filter → fallback → select →
//! translate → send → retry → translate back.
//!
//! One [`DispatchEngine`] is shared across all in-flight requests. Each
//! dispatch call takes a fresh config snapshot, so a hot-reload never tears a
//! request between two configurations. The balancer and retry strategy are
//! built once at startup from the initial config; a reload updates routes,
//! backends, and prompts, but changing the balancer strategy or retry policy
//! requires a restart (same restriction the rate limiter has).
//!
//! The retry loop re-selects a backend on every attempt — including the
//! first — so a failing backend naturally rotates out under round-robin and
//! random strategies. There is no separate pre-loop selection: the first
//! attempt's pick is the initial backend, and it is logged as such, which
//! keeps stateful strategies from being advanced by a selection that never
//! performs I/O.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::ProxyError,
    protocol,
    routing::{
        balancer::LoadBalancer, cooldown::CooldownRegistry, cooldown::CLIENT_ERROR_COOLDOWN,
        fallback::FallbackStrategy, resolver::RouteResolver, retry::RetryStrategy,
    },
    types::{Backend, ChatRequest, ChatResponse, Protocol, Route},
    upstream::UpstreamClient,
};

/// Substrings of an error message that mark a client-class terminal failure
/// and trigger a cooldown. The structured HTTP status is checked first;
/// these cover errors that only carry the status in their text.
const COOLDOWN_TRIGGER_PATTERNS: &[&str] = &[
    "400",
    "401",
    "403",
    "404",
    "422",
    "bad request",
    "unauthorized",
    "forbidden",
    "not found",
    "unprocessable entity",
];

/// Monotonic counters exposed through the admin metrics endpoint.
#[derive(Default)]
pub struct EngineCounters {
    pub backend_errors: AtomicU64,
    pub retries: AtomicU64,
    pub cooldowns_set: AtomicU64,
}

/// Orchestrates one request through routing, translation, and retries.
pub struct DispatchEngine {
    config: RwLock<Arc<Config>>,
    pub cooldowns: CooldownRegistry,
    balancer: LoadBalancer,
    retry: RetryStrategy,
    pub(crate) upstream: UpstreamClient,
    pub counters: EngineCounters,
}

impl DispatchEngine {
    pub fn new(config: Arc<Config>) -> Self {
        let balancer = LoadBalancer::from_strategy(config.load_balancer.strategy);
        let retry = RetryStrategy::new(config.retry.clone());
        Self::with_components(config, balancer, retry)
    }

    /// Injectable construction for tests: seeded balancer, pinned jitter.
    pub fn with_components(config: Arc<Config>, balancer: LoadBalancer, retry: RetryStrategy) -> Self {
        Self {
            config: RwLock::new(config),
            cooldowns: CooldownRegistry::new(),
            balancer,
            retry,
            upstream: UpstreamClient::new(),
            counters: EngineCounters::default(),
        }
    }

    /// Current config snapshot. The lock is held only for the `Arc` clone.
    pub fn config(&self) -> Arc<Config> {
        self.config.read().expect("config lock poisoned").clone()
    }

    /// Atomically replace the live config. Called from the hot-reload task.
    pub fn replace_config(&self, new: Arc<Config>) {
        *self.config.write().expect("config lock poisoned") = new;
    }

    pub fn retry_strategy(&self) -> &RetryStrategy {
        &self.retry
    }

    /// Register an in-flight request with the balancer (least-connections
    /// accounting); a no-op guard for other strategies.
    pub(crate) fn balancer_track(&self, backend_id: &str) -> Option<crate::routing::balancer::ConnectionGuard> {
        self.balancer.track(backend_id)
    }

    /// True when every route of the alias — and of its fallback aliases —
    /// speaks an OpenAI-compatible dialect, so an OpenAI-dialect client
    /// stream can be relayed byte-for-byte without re-framing. Aliases that
    /// fail to resolve are vacuously eligible; dispatch will surface the real
    /// error either way.
    pub fn passthrough_eligible(&self, alias: &str) -> bool {
        let cfg = self.config();
        let resolver = RouteResolver::new(&cfg);
        let mut aliases: Vec<&str> = vec![alias];
        aliases.extend(resolver.fallback_aliases_for(alias).iter().map(String::as_str));
        aliases.iter().all(|a| {
            resolver
                .resolve(a)
                .map(|routes| routes.iter().all(|r| r.protocol().is_openai_compatible()))
                .unwrap_or(true)
        })
    }

    /// Dispatch one unary request.
    #[tracing::instrument(skip_all, fields(alias = %request.model, req_id = %request.id))]
    pub async fn dispatch(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<ChatResponse, ProxyError> {
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
                debug!(backend = %backend.id, strategy = self.balancer.strategy_name(), "initial backend selected");
            }

            let backend_req = protocol::to_backend(request, wire_protocol, &cfg.system_prompts)
                .map_err(ProxyError::protocol)?;

            let _inflight = self.balancer.track(&backend.id);
            let result = self
                .upstream
                .send(cancel, &backend_req, &backend, &upstream_model, wire_protocol)
                .await;

            match result {
                Ok(upstream_resp) => {
                    let mut response =
                        protocol::from_backend(&upstream_resp.body, &request.model, wire_protocol)
                            .map_err(|e| match e.kind {
                                crate::error::ErrorKind::Protocol => e,
                                _ => ProxyError::protocol(e),
                            })?;
                    response.headers = upstream_resp.headers;
                    response.headers.push(("x-relay-backend".to_string(), backend.id.clone()));
                    if response.object.is_empty() {
                        response.object = "chat.completion".to_string();
                    }
                    info!(backend = %backend.id, attempt, "dispatch succeeded");
                    return Ok(response);
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(backend = %backend.id, attempt, error = %err, "upstream attempt failed");

                    if !self.retry.should_retry(attempt, Some(&err)) {
                        return Err(self.terminal_failure(&backend.id, &upstream_model, &request.id, err));
                    }
                    attempt += 1;
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    self.backoff_or_cancel(cancel, attempt).await?;
                }
            }
        }
    }

    /// Resolve the alias, drop cooling routes, and escalate to fallback
    /// aliases when nothing survives. `UnknownModel` propagates unchanged.
    pub(crate) fn candidates(&self, cfg: &Config, alias: &str) -> Result<Vec<Route>, ProxyError> {
        let resolver = RouteResolver::new(cfg);
        let routes = resolver.resolve(alias)?;
        let fallback = FallbackStrategy::new(&self.cooldowns);

        let available = fallback.filter_available(routes);
        if !available.is_empty() {
            return Ok(available);
        }

        let alternates = fallback.fallback_routes(alias, &resolver);
        if alternates.is_empty() {
            return Err(ProxyError::no_backend(alias));
        }
        Ok(alternates)
    }

    /// Pick a backend for this attempt and resolve its upstream model name
    /// (defaults to the alias when the route is not found) and wire protocol.
    pub(crate) fn select_target(
        &self,
        available: &[Route],
        alias: &str,
    ) -> Result<(Arc<Backend>, String, Protocol), ProxyError> {
        let backend = self
            .balancer
            .select(available)
            .ok_or_else(|| ProxyError::no_backend(alias))?;
        let route = available.iter().find(|r| r.backend.id == backend.id);
        let upstream_model = route
            .map(|r| r.upstream_model.clone())
            .unwrap_or_else(|| alias.to_string());
        let wire_protocol = route.map(|r| r.protocol()).unwrap_or(backend.protocol);
        Ok((backend, upstream_model, wire_protocol))
    }

    /// Sleep the backoff for the upcoming `attempt`, or return the
    /// cancellation error as soon as the caller gives up.
    pub(crate) async fn backoff_or_cancel(
        &self,
        cancel: &CancellationToken,
        attempt: u32,
    ) -> Result<(), ProxyError> {
        let delay = self.retry.delay(attempt);
        if delay.is_zero() {
            if cancel.is_cancelled() {
                return Err(ProxyError::cancelled());
            }
            return Ok(());
        }
        debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProxyError::cancelled()),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Terminal-failure path: cool the backend down for client-class errors,
    /// wrap the cause, and attach a retry hint for the client when the error
    /// class is transient.
    pub(crate) fn terminal_failure(
        &self,
        backend_id: &str,
        upstream_model: &str,
        request_id: &str,
        err: ProxyError,
    ) -> ProxyError {
        self.maybe_cooldown(&err, backend_id, upstream_model);
        let mut wrapped = ProxyError::backend_wrap(backend_id, err);
        if wrapped.request_id.is_none() {
            wrapped.request_id = Some(request_id.to_string());
        }
        if wrapped.retryable && wrapped.retry_after_secs.is_none() {
            wrapped.retry_after_secs = Some(self.retry.delay(1).as_secs().max(1));
        }
        wrapped
    }

    /// Cooldown trigger: client-class terminal failures (400/401/403/404/422
    /// by status, or their textual names in the message) suppress the
    /// (backend, model) pair for 30 s. Server errors never trigger a
    /// cooldown — they are presumed transient and the balancer is trusted to
    /// route around them.
    fn maybe_cooldown(&self, err: &ProxyError, backend_id: &str, upstream_model: &str) {
        if err.is_cancelled() {
            return;
        }
        let structural = matches!(err.status.as_u16(), 400 | 401 | 403 | 404 | 422);
        let textual = {
            let message = err.message.to_lowercase();
            COOLDOWN_TRIGGER_PATTERNS.iter().any(|p| message.contains(p))
        };
        if structural || textual {
            self.cooldowns
                .set_cooldown(backend_id, upstream_model, CLIENT_ERROR_COOLDOWN);
            self.counters.cooldowns_set.fetch_add(1, Ordering::Relaxed);
            info!(backend = backend_id, model = upstream_model, "backend cooled down after client-class failure");
        }
    }
}
