//! Retry policy: which upstream failures are worth another attempt, and how
//! long to wait between attempts.
//!
//! Retryability is decided from the structured error first (kind and HTTP
//! status); message substring matching only runs for operator-configured
//! `error_fallback` pattern lists, kept as a compatibility path. Backoff is
//! exponential with an optional jitter factor drawn from an injectable
//! sampler so tests can pin the schedule exactly.

use std::{sync::Arc, time::Duration};

use rand::Rng;

use crate::{
    config::RetryConfig,
    error::{ErrorKind, ProxyError},
};

/// Uniform `[0, 1)` sample source for the jitter factor.
pub type JitterSampler = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Canonical server-error phrases matched by the `server_error` fallback
/// group, alongside raw 5xx status digits.
const SERVER_ERROR_PATTERNS: &[&str] = &[
    "500",
    "502",
    "503",
    "504",
    "internal server error",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
];

pub struct RetryStrategy {
    config: RetryConfig,
    sampler: JitterSampler,
}

impl RetryStrategy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            sampler: Arc::new(|| rand::thread_rng().gen::<f64>()),
        }
    }

    /// Deterministic construction for tests: the jitter factor is derived
    /// from `sampler` instead of a thread-local RNG.
    pub fn with_sampler(config: RetryConfig, sampler: JitterSampler) -> Self {
        Self { config, sampler }
    }

    /// The configured value, literally. 0 means the dispatch loop makes the
    /// first attempt and never retries.
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Decide whether `attempt` (0-based) should be followed by another.
    pub fn should_retry(&self, attempt: u32, err: Option<&ProxyError>) -> bool {
        if attempt >= self.config.max_retries {
            return false;
        }
        let Some(err) = err else {
            return false;
        };
        if err.is_cancelled() {
            return false;
        }

        if let Some(fallback) = &self.config.error_fallback {
            let server_hit = fallback.server_error.enabled && is_server_error(err);
            let client_hit = fallback.client_error.enabled && {
                let message = err.message.to_lowercase();
                let status_hit = fallback
                    .client_error
                    .status_codes
                    .iter()
                    .any(|code| message.contains(&code.to_string()));
                let pattern_hit = fallback
                    .client_error
                    .patterns
                    .iter()
                    .any(|pattern| message.contains(&pattern.to_lowercase()));
                status_hit || pattern_hit
            };
            return server_hit || client_hit;
        }

        // Default policy: server-class failures and rate limits retry,
        // everything else in the client class is terminal.
        if is_rate_limited(err) {
            return true;
        }
        if err.status.is_server_error() || matches!(err.kind, ErrorKind::Timeout | ErrorKind::Internal) {
            return true;
        }
        false
    }

    /// Backoff before `attempt` (0-based): zero for the first attempt or when
    /// backoff is disabled, otherwise `initial * multiplier^(attempt-1)`
    /// clamped to `max_delay` and scaled by a jitter factor drawn uniformly
    /// from `[1 - jitter, 1 + jitter]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 || !self.config.enable_backoff {
            return Duration::ZERO;
        }
        let initial = self.config.initial_delay_ms as f64;
        let max = self.config.max_delay_ms as f64;
        let base = (initial * self.config.multiplier.powi(attempt as i32 - 1)).min(max);

        let jitter = self.config.jitter;
        let factor = if jitter > 0.0 {
            1.0 - jitter + 2.0 * jitter * (self.sampler)()
        } else {
            1.0
        };
        Duration::from_secs_f64((base * factor).max(0.0) / 1000.0)
    }
}

fn is_rate_limited(err: &ProxyError) -> bool {
    err.kind == ErrorKind::RateLimited
        || err.status.as_u16() == 429
        || err.message.to_lowercase().contains("rate limit")
}

fn is_server_error(err: &ProxyError) -> bool {
    if err.status.is_server_error() {
        return true;
    }
    let message = err.message.to_lowercase();
    SERVER_ERROR_PATTERNS.iter().any(|p| message.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    use crate::{
        config::{ClientErrorGroup, ErrorFallbackConfig, ServerErrorGroup},
        types::Protocol,
    };

    fn strategy(max_retries: u32) -> RetryStrategy {
        RetryStrategy::new(RetryConfig { max_retries, ..Default::default() })
    }

    fn upstream_err(status: u16) -> ProxyError {
        ProxyError::from_upstream(
            Protocol::Openai,
            StatusCode::from_u16(status).unwrap(),
            b"{}",
            "b1",
        )
    }

    // -----------------------------------------------------------------------
    // should_retry — default policy
    // -----------------------------------------------------------------------

    #[test]
    fn never_retries_at_or_past_max() {
        let s = strategy(2);
        let err = upstream_err(503);
        assert!(s.should_retry(0, Some(&err)));
        assert!(s.should_retry(1, Some(&err)));
        assert!(!s.should_retry(2, Some(&err)));
        assert!(!s.should_retry(3, Some(&err)));
    }

    #[test]
    fn zero_max_retries_never_retries() {
        let s = strategy(0);
        assert!(!s.should_retry(0, Some(&upstream_err(503))));
    }

    #[test]
    fn nil_error_never_retries() {
        let s = strategy(3);
        assert!(!s.should_retry(0, None));
    }

    #[test]
    fn server_errors_retry_by_default() {
        let s = strategy(3);
        for status in [500, 502, 503, 504] {
            assert!(s.should_retry(0, Some(&upstream_err(status))), "HTTP {status} must retry");
        }
    }

    #[test]
    fn rate_limit_retries_by_default() {
        let s = strategy(3);
        assert!(s.should_retry(0, Some(&upstream_err(429))));

        let msg_only = ProxyError::new(ErrorKind::Backend, "upstream said: Rate Limit reached");
        assert!(s.should_retry(0, Some(&msg_only)));
    }

    #[test]
    fn client_errors_do_not_retry_by_default() {
        let s = strategy(3);
        for status in [400, 401, 403, 404, 422] {
            assert!(!s.should_retry(0, Some(&upstream_err(status))), "HTTP {status} must not retry");
        }
    }

    #[test]
    fn timeout_retries_by_default() {
        let s = strategy(3);
        let err = ProxyError::new(ErrorKind::Timeout, "deadline exceeded");
        assert!(s.should_retry(0, Some(&err)));
    }

    #[test]
    fn cancellation_never_retries() {
        let s = strategy(3);
        assert!(!s.should_retry(0, Some(&ProxyError::cancelled())));
    }

    // -----------------------------------------------------------------------
    // should_retry — configured error fallback
    // -----------------------------------------------------------------------

    fn with_fallback(server: bool, client: bool, codes: Vec<u16>, patterns: Vec<&str>) -> RetryStrategy {
        RetryStrategy::new(RetryConfig {
            max_retries: 5,
            error_fallback: Some(ErrorFallbackConfig {
                server_error: ServerErrorGroup { enabled: server },
                client_error: ClientErrorGroup {
                    enabled: client,
                    status_codes: codes,
                    patterns: patterns.into_iter().map(String::from).collect(),
                },
            }),
            ..Default::default()
        })
    }

    #[test]
    fn fallback_server_group_matches_5xx_and_phrases() {
        let s = with_fallback(true, false, vec![], vec![]);
        assert!(s.should_retry(0, Some(&upstream_err(503))));

        let phrase = ProxyError::new(ErrorKind::Backend, "upstream replied Bad Gateway");
        assert!(s.should_retry(0, Some(&phrase)));

        // Client error is out of scope when only the server group is enabled.
        assert!(!s.should_retry(0, Some(&upstream_err(429))));
    }

    #[test]
    fn fallback_client_group_matches_status_code_substring() {
        let s = with_fallback(false, true, vec![429], vec![]);
        // from_upstream embeds the status into the message.
        assert!(s.should_retry(0, Some(&upstream_err(429))));
        assert!(!s.should_retry(0, Some(&upstream_err(400))));
    }

    #[test]
    fn fallback_client_group_matches_patterns_case_insensitively() {
        let s = with_fallback(false, true, vec![], vec!["quota exceeded"]);
        let err = ProxyError::new(ErrorKind::Backend, "Provider said: QUOTA EXCEEDED for key");
        assert!(s.should_retry(0, Some(&err)));
    }

    #[test]
    fn fallback_disabled_groups_match_nothing() {
        let s = with_fallback(false, false, vec![429], vec!["anything"]);
        assert!(!s.should_retry(0, Some(&upstream_err(503))));
        assert!(!s.should_retry(0, Some(&upstream_err(429))));
    }

    // -----------------------------------------------------------------------
    // delay
    // -----------------------------------------------------------------------

    fn delay_config(initial: u64, max: u64, multiplier: f64, jitter: f64) -> RetryConfig {
        RetryConfig {
            max_retries: 5,
            enable_backoff: true,
            initial_delay_ms: initial,
            max_delay_ms: max,
            multiplier,
            jitter,
            error_fallback: None,
        }
    }

    #[test]
    fn delay_is_zero_for_first_attempt() {
        let s = RetryStrategy::new(delay_config(100, 1000, 2.0, 0.0));
        assert_eq!(s.delay(0), Duration::ZERO);
    }

    #[test]
    fn delay_is_zero_when_backoff_disabled() {
        let mut config = delay_config(100, 1000, 2.0, 0.0);
        config.enable_backoff = false;
        let s = RetryStrategy::new(config);
        assert_eq!(s.delay(3), Duration::ZERO);
    }

    #[test]
    fn delay_grows_exponentially_without_jitter() {
        let s = RetryStrategy::new(delay_config(100, 10_000, 2.0, 0.0));
        assert_eq!(s.delay(1), Duration::from_millis(100));
        assert_eq!(s.delay(2), Duration::from_millis(200));
        assert_eq!(s.delay(3), Duration::from_millis(400));
        assert_eq!(s.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn delay_clamps_at_max() {
        let s = RetryStrategy::new(delay_config(100, 250, 2.0, 0.0));
        assert_eq!(s.delay(1), Duration::from_millis(100));
        assert_eq!(s.delay(2), Duration::from_millis(200));
        assert_eq!(s.delay(3), Duration::from_millis(250));
        assert_eq!(s.delay(10), Duration::from_millis(250));
    }

    #[test]
    fn jitter_scales_within_expected_band() {
        // sampler pinned to 0.0 → factor = 1 - jitter
        let low = RetryStrategy::with_sampler(delay_config(1000, 10_000, 2.0, 0.5), Arc::new(|| 0.0));
        assert_eq!(low.delay(1), Duration::from_millis(500));

        // sampler pinned to 1.0 → factor = 1 + jitter
        let high = RetryStrategy::with_sampler(delay_config(1000, 10_000, 2.0, 0.5), Arc::new(|| 1.0));
        assert_eq!(high.delay(1), Duration::from_millis(1500));

        // sampler pinned to 0.5 → factor = 1.0 exactly
        let mid = RetryStrategy::with_sampler(delay_config(1000, 10_000, 2.0, 0.5), Arc::new(|| 0.5));
        assert_eq!(mid.delay(1), Duration::from_millis(1000));
    }

    #[test]
    fn max_retries_returns_configured_value_literally() {
        assert_eq!(strategy(0).max_retries(), 0);
        assert_eq!(strategy(7).max_retries(), 7);
    }
}
