//! Worker metrics.
//!
//! - Render outcomes and durations
//! - Upload queue depth and validation outcomes
//! - Diagnostic bundles sent

use metrics::{counter, gauge, histogram};

use farmhand_models::ErrorKind;

/// Metric name constants for consistency.
pub mod names {
    /// Renders by outcome.
    pub const RENDERS_TOTAL: &str = "farmhand_renders_total";

    /// Render wall time in seconds.
    pub const RENDER_SECONDS: &str = "farmhand_render_seconds";

    /// Validations by outcome.
    pub const UPLOADS_TOTAL: &str = "farmhand_uploads_total";

    /// Jobs waiting for or undergoing validation.
    pub const UPLOAD_QUEUE_DEPTH: &str = "farmhand_upload_queue_depth";

    /// Diagnostic bundles sent, by error kind.
    pub const ERROR_REPORTS_TOTAL: &str = "farmhand_error_reports_total";
}

fn outcome_label(kind: ErrorKind) -> String {
    format!("{:?}", kind).to_lowercase()
}

pub fn record_render(outcome: ErrorKind, seconds: f64) {
    counter!(names::RENDERS_TOTAL, "outcome" => outcome_label(outcome)).increment(1);
    if outcome.is_ok() {
        histogram!(names::RENDER_SECONDS).record(seconds);
    }
}

pub fn record_upload(outcome: ErrorKind) {
    counter!(names::UPLOADS_TOTAL, "outcome" => outcome_label(outcome)).increment(1);
}

pub fn set_upload_queue_depth(depth: usize) {
    gauge!(names::UPLOAD_QUEUE_DEPTH).set(depth as f64);
}

pub fn record_error_report(kind: ErrorKind) {
    counter!(names::ERROR_REPORTS_TOTAL, "kind" => outcome_label(kind)).increment(1);
}
