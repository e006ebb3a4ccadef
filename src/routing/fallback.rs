//! Cooldown-aware route filtering and fallback aliasing.
//!
//! Two escalation layers run before the proxy gives up on a request: first
//! the primary alias's routes are filtered against the cooldown registry;
//! when nothing survives, the alias's configured fallback aliases are tried
//! in declared order, each filtered the same way. Only when every layer comes
//! up empty does the dispatcher surface `NoBackend`.

use tracing::debug;

use crate::{
    routing::{cooldown::CooldownRegistry, resolver::RouteResolver},
    types::Route,
};

/// Filters candidates against the cooldown registry and escalates to
/// fallback aliases.
pub struct FallbackStrategy<'a> {
    cooldowns: &'a CooldownRegistry,
}

impl<'a> FallbackStrategy<'a> {
    pub fn new(cooldowns: &'a CooldownRegistry) -> Self {
        Self { cooldowns }
    }

    /// Drop every route whose `(backend, model)` pair is cooling down.
    /// Order is preserved — the result is a subsequence of the input.
    pub fn filter_available(&self, routes: Vec<Route>) -> Vec<Route> {
        routes
            .into_iter()
            .filter(|route| {
                let cooling = self
                    .cooldowns
                    .is_cooling_down(&route.backend.id, &route.upstream_model);
                if cooling {
                    debug!(
                        backend = %route.backend.id,
                        model = %route.upstream_model,
                        "route suppressed by cooldown"
                    );
                }
                !cooling
            })
            .collect()
    }

    /// Walk the fallback aliases configured for `alias` and return the first
    /// non-empty filtered route list. An alternate alias that fails to
    /// resolve is treated as empty and skipped. Returns an empty vec when no
    /// alternate produces candidates; the caller surfaces `NoBackend`.
    pub fn fallback_routes(&self, alias: &str, resolver: &RouteResolver<'_>) -> Vec<Route> {
        for alternate in resolver.fallback_aliases_for(alias) {
            let Ok(routes) = resolver.resolve(alternate) else {
                debug!(alias, alternate = %alternate, "fallback alias did not resolve — skipping");
                continue;
            };
            let available = self.filter_available(routes);
            if !available.is_empty() {
                debug!(alias, alternate = %alternate, candidates = available.len(), "fallback alias selected");
                return available;
            }
        }
        Vec::new()
    }
}
