//! Load-balancer strategies — enum dispatch over a closed set.
//!
//! One [`LoadBalancer`] is built at startup from
//! [`BalancerStrategy`](crate::config::BalancerStrategy) and shared across
//! requests. Mutable strategy state (the round-robin cursor, RNG, in-flight
//! counters) lives inside the variant behind an atomic or mutex, so `select`
//! takes `&self` and never touches the input slice.
//!
//! Contract: `select` returns `None` for an empty input and otherwise always
//! returns a backend drawn from the input. Randomized strategies draw from an
//! injectable RNG ([`LoadBalancer::seeded`]) so tests are deterministic.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    config::BalancerStrategy,
    types::{Backend, Route},
};

/// In-flight request counts per backend, used by the least-connections
/// strategy. Counts are maintained by RAII guards so a failed upstream call
/// can never leak a count.
#[derive(Default)]
pub struct ConnectionTracker {
    counts: Mutex<HashMap<String, usize>>,
}

impl ConnectionTracker {
    pub fn active(&self, backend_id: &str) -> usize {
        self.counts
            .lock()
            .expect("connection tracker lock poisoned")
            .get(backend_id)
            .copied()
            .unwrap_or(0)
    }

    fn acquire(self: &Arc<Self>, backend_id: &str) -> ConnectionGuard {
        let mut counts = self.counts.lock().expect("connection tracker lock poisoned");
        *counts.entry(backend_id.to_string()).or_insert(0) += 1;
        ConnectionGuard {
            tracker: Arc::clone(self),
            backend_id: backend_id.to_string(),
        }
    }
}

/// Decrements the owning tracker's count for its backend on drop.
pub struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
    backend_id: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let mut counts = self
            .tracker
            .counts
            .lock()
            .expect("connection tracker lock poisoned");
        if let Some(count) = counts.get_mut(&self.backend_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&self.backend_id);
            }
        }
    }
}

/// One balancing strategy with its internal state.
pub enum LoadBalancer {
    /// Uniform random pick.
    Random(Mutex<StdRng>),
    /// Rotating cursor over the candidate list.
    RoundRobin(AtomicUsize),
    /// Always the smallest priority; first wins on ties.
    Priority,
    /// Fewest in-flight requests; first wins on ties.
    LeastConnections(Arc<ConnectionTracker>),
    /// Random pick weighted by inverse priority.
    Weighted(Mutex<StdRng>),
}

impl LoadBalancer {
    pub fn from_strategy(strategy: BalancerStrategy) -> Self {
        Self::build(strategy, StdRng::from_entropy())
    }

    /// Deterministic construction for tests: randomized strategies draw from
    /// a seeded RNG.
    pub fn seeded(strategy: BalancerStrategy, seed: u64) -> Self {
        Self::build(strategy, StdRng::seed_from_u64(seed))
    }

    fn build(strategy: BalancerStrategy, rng: StdRng) -> Self {
        match strategy {
            BalancerStrategy::Random => Self::Random(Mutex::new(rng)),
            BalancerStrategy::RoundRobin => Self::RoundRobin(AtomicUsize::new(0)),
            BalancerStrategy::Priority => Self::Priority,
            BalancerStrategy::LeastConn => Self::LeastConnections(Arc::new(ConnectionTracker::default())),
            BalancerStrategy::Weighted => Self::Weighted(Mutex::new(rng)),
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        match self {
            Self::Random(_) => "random",
            Self::RoundRobin(_) => "round_robin",
            Self::Priority => "priority",
            Self::LeastConnections(_) => "least_conn",
            Self::Weighted(_) => "weighted",
        }
    }

    /// Select one backend from the candidate set. `None` iff the set is empty.
    pub fn select(&self, routes: &[Route]) -> Option<Arc<Backend>> {
        if routes.is_empty() {
            return None;
        }
        let chosen = match self {
            Self::Random(rng) => {
                let idx = rng.lock().expect("rng lock poisoned").gen_range(0..routes.len());
                &routes[idx]
            }
            Self::RoundRobin(cursor) => {
                let idx = cursor.fetch_add(1, Ordering::Relaxed) % routes.len();
                &routes[idx]
            }
            Self::Priority => routes
                .iter()
                .min_by_key(|r| r.priority)
                .expect("non-empty candidate set"),
            Self::LeastConnections(tracker) => routes
                .iter()
                .min_by_key(|r| tracker.active(&r.backend.id))
                .expect("non-empty candidate set"),
            Self::Weighted(rng) => {
                let weights: Vec<f64> = routes.iter().map(|r| 1.0 / (r.priority as f64 + 1.0)).collect();
                let total: f64 = weights.iter().sum();
                let mut draw = rng.lock().expect("rng lock poisoned").gen::<f64>() * total;
                let mut chosen = routes.len() - 1;
                for (i, weight) in weights.iter().enumerate() {
                    if draw < *weight {
                        chosen = i;
                        break;
                    }
                    draw -= weight;
                }
                &routes[chosen]
            }
        };
        Some(Arc::clone(&chosen.backend))
    }

    /// Register an in-flight request against `backend_id`. Returns a guard
    /// for the least-connections strategy; other strategies track nothing.
    pub fn track(&self, backend_id: &str) -> Option<ConnectionGuard> {
        match self {
            Self::LeastConnections(tracker) => Some(tracker.acquire(backend_id)),
            _ => None,
        }
    }
}
