//! Logging setup and structured job logging.

use std::sync::Arc;

use farmhand_models::Job;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn, Span};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::checkpoint::{CheckpointLayer, CheckpointLog};

/// Targets whose DEBUG output feeds diagnostic bundles.
const CHECKPOINT_TARGETS: [&str; 3] = ["farmhand_worker", "farmhand_protocol", "renderer"];

/// Install the global subscriber: console output filtered by `RUST_LOG`
/// (JSON when `LOG_FORMAT=json`), plus checkpoint capture at DEBUG.
pub fn init_tracing(checkpoints: Arc<CheckpointLog>) {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy()
        .add_directive("farmhand=info".parse().unwrap_or_else(|_| LevelFilter::INFO.into()))
        .add_directive("renderer=info".parse().unwrap_or_else(|_| LevelFilter::INFO.into()));

    let checkpoint_filter = CHECKPOINT_TARGETS
        .iter()
        .fold(Targets::new(), |targets, target| targets.with_target(*target, LevelFilter::DEBUG))
        .with_default(LevelFilter::INFO);
    let checkpoint_layer = CheckpointLayer::new(checkpoints).with_filter(checkpoint_filter);

    if use_json {
        tracing_subscriber::registry()
            .with(checkpoint_layer)
            .with(fmt::layer().json().with_filter(env_filter))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(checkpoint_layer)
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_filter(env_filter),
            )
            .init();
    }
}

/// Job logger for structured logging with consistent formatting.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    frame: u64,
    operation: String,
}

impl JobLogger {
    pub fn new(job: &Job, operation: &str) -> Self {
        Self {
            job_id: job.id.to_string(),
            frame: job.frame_number,
            operation: operation.to_string(),
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            frame = self.frame,
            operation = %self.operation,
            "Job started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            frame = self.frame,
            operation = %self.operation,
            "Job progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            frame = self.frame,
            operation = %self.operation,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            frame = self.frame,
            operation = %self.operation,
            "Job error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            frame = self.frame,
            operation = %self.operation,
            "Job completed: {}", message
        );
    }

    /// Span carrying the job context.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            frame = self.frame,
            operation = %self.operation
        )
    }
}
