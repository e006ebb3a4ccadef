//! Cooldown registry: temporary suppression of misbehaving (backend, model)
//! pairs.
//!
//! Entries are created by the dispatch engine on terminal client-class
//! failures and consulted by the fallback strategy when filtering candidate
//! routes. Expiry uses the monotonic clock (`tokio::time::Instant`), so
//! wall-clock adjustments can never revive or extend a cooldown. Expired
//! entries are removed opportunistically on read; a periodic
//! [`clear_expired`](CooldownRegistry::clear_expired) sweep bounds memory
//! under churn.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

use serde::Serialize;
use tokio::time::Instant;

/// Default suppression window for client-error-triggered cooldowns.
pub const CLIENT_ERROR_COOLDOWN: Duration = Duration::from_secs(30);

/// Mutex-guarded map of `(backend id, model name) → expiry`.
///
/// Contention is low: the write path only runs on failure, and reads hold the
/// lock for a single hash lookup.
#[derive(Default)]
pub struct CooldownRegistry {
    entries: Mutex<HashMap<(String, String), Instant>>,
}

/// Read-only view of one active cooldown, for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct CooldownView {
    pub backend: String,
    pub model: String,
    pub remaining_secs: u64,
}

impl CooldownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or extend) a cooldown. Overwrites any existing entry for the
    /// pair — a fresh trigger always restarts the window.
    pub fn set_cooldown(&self, backend: &str, model: &str, duration: Duration) {
        let expiry = Instant::now() + duration;
        let mut entries = self.entries.lock().expect("cooldown lock poisoned");
        entries.insert((backend.to_string(), model.to_string()), expiry);
    }

    /// True while an unexpired entry exists for the pair. An entry found
    /// expired is removed during the check.
    pub fn is_cooling_down(&self, backend: &str, model: &str) -> bool {
        let key = (backend.to_string(), model.to_string());
        let mut entries = self.entries.lock().expect("cooldown lock poisoned");
        match entries.get(&key) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                entries.remove(&key);
                false
            }
            None => false,
        }
    }

    /// Full sweep removing every expired entry. Called periodically by the
    /// owner; the opportunistic removal in [`is_cooling_down`] handles pairs
    /// that are actually consulted.
    pub fn clear_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("cooldown lock poisoned");
        entries.retain(|_, expiry| *expiry > now);
    }

    /// Number of entries currently stored, expired or not.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cooldown lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of active cooldowns for the admin view, longest remaining
    /// first.
    pub fn snapshot(&self) -> Vec<CooldownView> {
        let now = Instant::now();
        let entries = self.entries.lock().expect("cooldown lock poisoned");
        let mut views: Vec<CooldownView> = entries
            .iter()
            .filter(|(_, expiry)| **expiry > now)
            .map(|((backend, model), expiry)| CooldownView {
                backend: backend.clone(),
                model: model.clone(),
                remaining_secs: expiry.duration_since(now).as_secs(),
            })
            .collect();
        views.sort_by(|a, b| b.remaining_secs.cmp(&a.remaining_secs));
        views
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn cooldown_active_until_expiry() {
        let registry = CooldownRegistry::new();
        registry.set_cooldown("b1", "gpt-4", Duration::from_secs(30));
        assert!(registry.is_cooling_down("b1", "gpt-4"));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(registry.is_cooling_down("b1", "gpt-4"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!registry.is_cooling_down("b1", "gpt-4"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_removed_on_read() {
        let registry = CooldownRegistry::new();
        registry.set_cooldown("b1", "gpt-4", Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(registry.len(), 1, "entry persists until observed");
        assert!(!registry.is_cooling_down("b1", "gpt-4"));
        assert_eq!(registry.len(), 0, "observation removes the expired entry");
    }

    #[tokio::test(start_paused = true)]
    async fn set_cooldown_overwrites_existing_entry() {
        let registry = CooldownRegistry::new();
        registry.set_cooldown("b1", "gpt-4", Duration::from_secs(5));
        // Re-trigger with a longer window before the first expires.
        registry.set_cooldown("b1", "gpt-4", Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(registry.is_cooling_down("b1", "gpt-4"));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_expired_sweeps_only_expired() {
        let registry = CooldownRegistry::new();
        registry.set_cooldown("b1", "m1", Duration::from_secs(5));
        registry.set_cooldown("b2", "m2", Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(10)).await;
        registry.clear_expired();

        assert_eq!(registry.len(), 1);
        assert!(registry.is_cooling_down("b2", "m2"));
    }

    #[test]
    fn pairs_are_independent() {
        let registry = CooldownRegistry::new();
        registry.set_cooldown("b1", "gpt-4", Duration::from_secs(30));
        assert!(!registry.is_cooling_down("b1", "gpt-4o"));
        assert!(!registry.is_cooling_down("b2", "gpt-4"));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_lists_active_entries_with_remaining_time() {
        let registry = CooldownRegistry::new();
        registry.set_cooldown("b1", "m1", Duration::from_secs(10));
        registry.set_cooldown("b2", "m2", Duration::from_secs(60));

        let views = registry.snapshot();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].backend, "b2");
        assert!(views[0].remaining_secs >= 59);
        assert_eq!(views[1].backend, "b1");
    }
}
