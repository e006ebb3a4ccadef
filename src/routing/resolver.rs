//! Model alias resolution.
//!
//! The resolver is a thin view over one config snapshot: it re-derives
//! [`Route`] values on every call so hot-reloaded config is picked up without
//! any cache invalidation. Lookup follows the alias's configured route list,
//! drops anything not effectively enabled, and sorts the survivors by
//! ascending priority (stable for ties, preserving source order).

use std::sync::Arc;

use tracing::warn;

use crate::{
    config::Config,
    error::ProxyError,
    types::{Backend, Route},
};

/// Resolves client model aliases against one configuration snapshot.
pub struct RouteResolver<'a> {
    config: &'a Config,
}

impl<'a> RouteResolver<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Resolve an alias to its ordered, effectively-enabled routes.
    ///
    /// Returns [`ErrorKind::UnknownModel`](crate::error::ErrorKind) when the
    /// alias is absent, disabled, or has no surviving route — a structurally
    /// empty alias is indistinguishable from an unknown one to the caller.
    pub fn resolve(&self, alias: &str) -> Result<Vec<Route>, ProxyError> {
        let model = self
            .config
            .models
            .get(alias)
            .filter(|m| m.enabled)
            .ok_or_else(|| ProxyError::unknown_model(alias))?;

        let mut routes: Vec<Route> = Vec::with_capacity(model.routes.len());
        for route_cfg in &model.routes {
            if !route_cfg.enabled {
                continue;
            }
            let Some(backend_cfg) = self.config.backends.get(&route_cfg.backend) else {
                warn!(alias, backend = %route_cfg.backend, "route references missing backend — skipping");
                continue;
            };
            if !backend_cfg.enabled {
                continue;
            }
            let backend = match Backend::new(&route_cfg.backend, &backend_cfg.base_url, backend_cfg.protocol) {
                Ok(mut b) => {
                    b.api_key = backend_cfg.api_key();
                    b.locale = backend_cfg.locale.clone();
                    b.timeout_ms = backend_cfg.timeout_ms;
                    b
                }
                Err(e) => {
                    // Config validation rejects bad URLs at load time; a bad
                    // snapshot entry is skipped rather than failing the alias.
                    warn!(alias, backend = %route_cfg.backend, error = %e, "invalid backend in snapshot — skipping");
                    continue;
                }
            };
            routes.push(Route {
                backend: Arc::new(backend),
                upstream_model: route_cfg.model.clone(),
                priority: route_cfg.priority,
                enabled: true,
                protocol_override: route_cfg.protocol,
            });
        }

        // Stable sort: equal priorities keep their config order.
        routes.sort_by_key(|r| r.priority);

        if routes.is_empty() {
            return Err(ProxyError::unknown_model(alias));
        }
        Ok(routes)
    }

    /// Configured fallback aliases for `alias`, in declared order.
    pub fn fallback_aliases_for(&self, alias: &str) -> &[String] {
        self.config
            .fallback
            .get(alias)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn has_fallback(&self, alias: &str) -> bool {
        !self.fallback_aliases_for(alias).is_empty()
    }
}
