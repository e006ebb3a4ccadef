//! In-memory traffic log exposed through the admin API.
//!
//! [`TrafficLog`] is a fixed-capacity ring-buffer: once full, the oldest entry
//! is evicted to make room for the newest. This gives a bounded, O(1) memory
//! footprint regardless of request volume.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Fixed-capacity ring-buffer of recent [`TrafficEntry`] records.
///
/// Safe to share across threads via `Arc<TrafficLog>`. [`push`][Self::push] uses
/// a non-blocking `try_lock` so it never delays request handling; in the
/// unlikely event of lock contention the entry is silently dropped.
pub struct TrafficLog {
    capacity: usize,
    entries: Mutex<VecDeque<TrafficEntry>>,
}

impl TrafficLog {
    /// Create a new log with the given capacity.
    ///
    /// `capacity` is the maximum number of entries retained. Older entries are
    /// silently dropped once the buffer is full.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record a completed request.
    ///
    /// This is a best-effort, non-blocking operation: if the mutex is contended
    /// the entry is dropped rather than blocking the request path.
    pub fn push(&self, entry: TrafficEntry) {
        // Best-effort non-blocking push — drop if lock contention
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// Return up to `limit` recent entries, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<TrafficEntry> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Compute aggregate statistics over all buffered entries.
    pub async fn stats(&self) -> TrafficStats {
        let entries = self.entries.lock().await;
        let total = entries.len();
        let avg_latency_ms = if total == 0 {
            0.0
        } else {
            entries.iter().map(|e| e.latency_ms as f64).sum::<f64>() / total as f64
        };

        let error_count = entries.iter().filter(|e| !e.success).count();
        let stream_count = entries.iter().filter(|e| e.stream).count();
        let retried_count = entries.iter().filter(|e| e.attempts > 1).count();

        let mut alias_counts: std::collections::HashMap<String, usize> =
            std::collections::HashMap::new();
        for entry in entries.iter() {
            *alias_counts.entry(entry.alias.clone()).or_default() += 1;
        }

        TrafficStats {
            total_requests: total,
            error_count,
            stream_count,
            retried_count,
            avg_latency_ms,
            alias_counts,
        }
    }
}

/// A single request record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficEntry {
    /// Request ID (from `X-Request-ID` or generated).
    pub id: String,
    /// Timestamp of the request.
    pub timestamp: DateTime<Utc>,
    /// Client-declared model alias.
    pub alias: String,
    /// Backend that ultimately handled this request, when known.
    pub backend: Option<String>,
    /// Number of upstream attempts made (1 = no retry).
    pub attempts: u32,
    /// End-to-end latency in milliseconds. For streams this is time to the
    /// terminal frame.
    pub latency_ms: u64,
    /// Whether the request was streamed.
    pub stream: bool,
    /// Whether the dispatch returned a success response.
    pub success: bool,
    /// Error description when `success` is `false`.
    pub error: Option<String>,
}

impl TrafficEntry {
    pub fn new(alias: String, latency_ms: u64, success: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            alias,
            backend: None,
            attempts: 1,
            latency_ms,
            stream: false,
            success,
            error: None,
        }
    }

    /// Use the proxy-assigned request ID instead of a fresh UUID.
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    /// Attach the backend that served the request.
    pub fn with_backend(mut self, backend: &str) -> Self {
        self.backend = Some(backend.to_string());
        self
    }

    /// Record how many upstream attempts were made.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Mark this entry as a streaming request.
    pub fn mark_stream(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Attach an error description for failed requests.
    pub fn with_error(mut self, err: &str) -> Self {
        self.error = Some(err.to_string());
        self
    }
}

/// Aggregate statistics derived from all buffered [`TrafficEntry`] records.
#[derive(Debug, Serialize)]
pub struct TrafficStats {
    pub total_requests: usize,
    /// Number of requests that returned an error.
    pub error_count: usize,
    /// Number of streaming requests.
    pub stream_count: usize,
    /// Number of requests that needed more than one upstream attempt.
    pub retried_count: usize,
    pub avg_latency_ms: f64,
    pub alias_counts: std::collections::HashMap<String, usize>,
}
