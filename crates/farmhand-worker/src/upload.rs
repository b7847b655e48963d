//! Background validation of rendered frames.
//!
//! Rendered jobs are queued in completion order and validated one at a time
//! by a single consumer task. The engine asks [`UploadPipeline::should_throttle`]
//! before requesting more work, so the queue stays short and `enqueue` never
//! waits on a full channel.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use farmhand_models::{ErrorKind, Job};
use farmhand_protocol::Coordinator;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointLog;
use crate::error::{WorkerError, WorkerResult};
use crate::gui::Gui;
use crate::logging::JobLogger;
use crate::metrics;
use crate::reporter::ErrorReporter;

/// Channel capacity.
pub const QUEUE_CAPACITY: usize = 1024;

/// A rendered job waiting for validation, with the checkpoint holding its logs.
#[derive(Debug)]
pub struct QueuedUpload {
    pub job: Job,
    pub checkpoint: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    queued: AtomicUsize,
    in_flight: AtomicBool,
}

impl QueueState {
    fn pending(&self) -> usize {
        self.queued.load(Ordering::SeqCst) + usize::from(self.in_flight.load(Ordering::SeqCst))
    }
}

/// Everything the consumer needs to validate and report.
pub struct UploadContext {
    pub coordinator: Arc<dyn Coordinator>,
    pub reporter: Arc<ErrorReporter>,
    pub checkpoints: Arc<CheckpointLog>,
    pub gui: Arc<dyn Gui>,
}

pub struct UploadPipeline {
    tx: mpsc::Sender<QueuedUpload>,
    state: Arc<QueueState>,
    max_concurrent: usize,
    consumer: JoinHandle<()>,
}

impl UploadPipeline {
    /// Spawn the consumer task.
    pub fn start(ctx: UploadContext, max_concurrent: usize) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let state = Arc::new(QueueState::default());
        let consumer = tokio::spawn(consume(rx, Arc::clone(&state), ctx));

        Self {
            tx,
            state,
            max_concurrent: max_concurrent.max(1),
            consumer,
        }
    }

    /// Hand a rendered job over for validation.
    pub async fn enqueue(&self, job: Job, checkpoint: u64) -> WorkerResult<()> {
        debug!(job_id = %job.id, frame = job.frame_number, "Queueing frame for validation");
        self.state.queued.fetch_add(1, Ordering::SeqCst);
        metrics::set_upload_queue_depth(self.state.pending());

        if let Err(mpsc::error::SendError(upload)) = self.tx.send(QueuedUpload { job, checkpoint }).await {
            self.state.queued.fetch_sub(1, Ordering::SeqCst);
            warn!(job_id = %upload.job.id, "Upload queue closed, frame dropped");
            return Err(WorkerError::Classified(ErrorKind::Unknown));
        }
        Ok(())
    }

    /// True while the number of queued and in-flight jobs has reached the limit.
    pub fn should_throttle(&self) -> bool {
        self.pending() >= self.max_concurrent
    }

    pub fn pending(&self) -> usize {
        self.state.pending()
    }

    /// Stop accepting jobs and wait for the queue to drain.
    pub async fn close(self) -> WorkerResult<()> {
        let remaining = self.pending();
        if remaining > 0 {
            info!(remaining, "Waiting for pending uploads");
        }
        drop(self.tx);
        self.consumer.await?;
        Ok(())
    }
}

async fn consume(mut rx: mpsc::Receiver<QueuedUpload>, state: Arc<QueueState>, ctx: UploadContext) {
    while let Some(upload) = rx.recv().await {
        // Flag first so the pending count never dips while a job changes hands.
        state.in_flight.store(true, Ordering::SeqCst);
        state.queued.fetch_sub(1, Ordering::SeqCst);

        validate(upload, &ctx).await;

        state.in_flight.store(false, Ordering::SeqCst);
        metrics::set_upload_queue_depth(state.pending());
    }
    debug!("Upload queue drained");
}

async fn validate(upload: QueuedUpload, ctx: &UploadContext) {
    let QueuedUpload { job, checkpoint } = upload;
    let logger = JobLogger::new(&job, "upload");
    ctx.gui.status(&format!("Uploading frame {}", job.frame_number));

    match ctx.coordinator.validate_job(&job).await {
        Ok(()) => {
            logger.log_completion("frame validated");
            metrics::record_upload(ErrorKind::Ok);
            remove_output(&job).await;
            ctx.checkpoints.remove(checkpoint);
            ctx.gui.frame_completed();
        }
        Err(kind) => {
            logger.log_error(&format!("validation failed: {}", kind));
            metrics::record_upload(kind);
            remove_output(&job).await;
            ctx.reporter.send_error(checkpoint, Some(&job), kind).await;
            ctx.checkpoints.remove(checkpoint);
        }
    }
}

/// Delete the rendered image if the coordinator client left it behind.
pub(crate) async fn remove_output(job: &Job) {
    let Some(path) = &job.output_image_path else {
        return;
    };
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), "Failed to remove output: {}", e);
        }
    }
}
