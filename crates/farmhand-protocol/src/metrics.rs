//! Coordinator request metrics.
//!
//! - Request counters by operation and outcome
//! - Latency histograms
//! - Retry counters

use metrics::{counter, histogram};

/// Metric name constants for consistency.
pub mod names {
    /// Total coordinator requests by operation and outcome.
    pub const REQUESTS_TOTAL: &str = "farmhand_coordinator_requests_total";

    /// Total retry attempts by operation.
    pub const RETRIES_TOTAL: &str = "farmhand_coordinator_retries_total";

    /// Request latency in seconds by operation.
    pub const LATENCY_SECONDS: &str = "farmhand_coordinator_latency_seconds";

    /// Bytes downloaded from the coordinator.
    pub const DOWNLOAD_BYTES: &str = "farmhand_download_bytes_total";
}

/// Record a completed request. `outcome` is the HTTP status or `"transport"`.
pub fn record_request(operation: &str, outcome: &str, latency_ms: f64) {
    counter!(
        names::REQUESTS_TOTAL,
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        names::LATENCY_SECONDS,
        "operation" => operation.to_string()
    )
    .record(latency_ms / 1000.0);
}

/// Record a retry attempt.
pub fn record_retry(operation: &str) {
    counter!(
        names::RETRIES_TOTAL,
        "operation" => operation.to_string()
    )
    .increment(1);
}

pub fn record_download_bytes(bytes: u64) {
    counter!(names::DOWNLOAD_BYTES).increment(bytes);
}
