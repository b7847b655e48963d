//! Diagnostic bundles and the post-failure cooldown.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use farmhand_models::{ErrorKind, Job};
use farmhand_protocol::{Coordinator, ErrorReport};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointLog;
use crate::control::sleep_unless_stopped;
use crate::metrics;

/// Sends the log lines of a failed checkpoint to the coordinator.
pub struct ErrorReporter {
    coordinator: Arc<dyn Coordinator>,
    checkpoints: Arc<CheckpointLog>,
    enabled: AtomicBool,
    cooldown: Duration,
    running: watch::Receiver<bool>,
}

impl ErrorReporter {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        checkpoints: Arc<CheckpointLog>,
        cooldown: Duration,
        running: watch::Receiver<bool>,
    ) -> Self {
        Self {
            coordinator,
            checkpoints,
            enabled: AtomicBool::new(true),
            cooldown,
            running,
        }
    }

    /// Stop sending bundles. Set once shutdown begins.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Upload the bundle for `checkpoint` and remove it. Returns whether it was sent.
    pub async fn report(&self, checkpoint: u64, job: Option<&Job>, kind: ErrorKind) -> bool {
        if !self.is_enabled() {
            debug!(?kind, "Error reporting disabled, bundle dropped");
            return false;
        }

        let lines = self.checkpoints.lines(checkpoint);
        let bundle = match write_bundle(&lines, job, kind) {
            Ok(file) => file,
            Err(e) => {
                warn!("Failed to write error bundle: {}", e);
                return false;
            }
        };

        let report = ErrorReport {
            kind,
            log_file: bundle.path(),
            job,
        };
        let sent = match self.coordinator.send_error_report(report).await {
            Ok(()) => {
                info!(kind = ?kind, job_id = ?job.map(|j| j.id.as_str()), lines = lines.len(), "Error report sent");
                metrics::record_error_report(kind);
                true
            }
            Err(e) => {
                warn!(kind = ?kind, "Failed to send error report: {}", e);
                false
            }
        };
        self.checkpoints.remove(checkpoint);
        sent
    }

    /// Report, then hold off new work unless `kind` is a kill or a crash.
    pub async fn send_error(&self, checkpoint: u64, job: Option<&Job>, kind: ErrorKind) {
        if !self.is_enabled() {
            return;
        }
        self.report(checkpoint, job, kind).await;
        if !kind.skips_cooldown() {
            debug!(cooldown_secs = self.cooldown.as_secs(), "Cooling down after error");
            sleep_unless_stopped(&self.running, self.cooldown).await;
        }
    }
}

fn write_bundle(lines: &[String], job: Option<&Job>, kind: ErrorKind) -> std::io::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("farmhand-error-")
        .suffix(".log")
        .tempfile()?;
    writeln!(file, "error: {} ({})", kind, kind.code())?;
    if let Some(job) = job {
        writeln!(file, "job: {} frame {}", job.id, job.frame_number)?;
    }
    for line in lines {
        writeln!(file, "{}", line)?;
    }
    file.flush()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{job, FakeCoordinator};
    use tracing::Level;

    fn reporter(server: &Arc<FakeCoordinator>, log: &Arc<CheckpointLog>) -> (ErrorReporter, watch::Sender<bool>) {
        let (running_tx, running_rx) = watch::channel(true);
        let reporter = ErrorReporter::new(server.clone(), log.clone(), Duration::from_secs(300), running_rx);
        (reporter, running_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_bundle_contains_checkpoint_lines_only() {
        let server = Arc::new(FakeCoordinator::default());
        let log = Arc::new(CheckpointLog::new());
        let (reporter, _running) = reporter(&server, &log);

        let first = log.new_checkpoint();
        log.append(Level::INFO, "first job line");
        let second = log.new_checkpoint();
        log.append(Level::ERROR, "renderer exited with 139");

        let job = job("42", 3);
        assert!(reporter.report(second, Some(&job), ErrorKind::RendererCrashed).await);

        let reports = server.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, ErrorKind::RendererCrashed);
        assert_eq!(reports[0].job_id.as_deref(), Some("42"));
        assert!(reports[0].log.contains("renderer exited with 139"));
        assert!(!reports[0].log.contains("first job line"));

        assert!(log.lines(second).is_empty());
        assert_eq!(log.lines(first).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_depends_on_kind() {
        let server = Arc::new(FakeCoordinator::default());
        let log = Arc::new(CheckpointLog::new());
        let (reporter, _running) = reporter(&server, &log);

        let start = tokio::time::Instant::now();
        reporter.send_error(log.new_checkpoint(), None, ErrorKind::RendererCrashed).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        reporter.send_error(log.new_checkpoint(), None, ErrorKind::DownloadFile).await;
        assert_eq!(start.elapsed(), Duration::from_secs(300));
        assert_eq!(server.reports().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_reporter_is_silent() {
        let server = Arc::new(FakeCoordinator::default());
        let log = Arc::new(CheckpointLog::new());
        let (reporter, _running) = reporter(&server, &log);

        reporter.disable();
        let start = tokio::time::Instant::now();
        reporter.send_error(log.new_checkpoint(), None, ErrorKind::Unknown).await;

        assert!(server.reports().is_empty());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cuts_cooldown_short() {
        let server = Arc::new(FakeCoordinator::default());
        let log = Arc::new(CheckpointLog::new());
        let (reporter, running) = reporter(&server, &log);
        let checkpoint = log.new_checkpoint();

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            running.send_replace(false);
            running
        });

        let start = tokio::time::Instant::now();
        reporter.send_error(checkpoint, None, ErrorKind::Unknown).await;
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        drop(stopper.await.unwrap());
    }
}
