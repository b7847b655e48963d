//! The worker engine: request, render, validate, repeat.
//!
//! One iteration parks while suspended, honours the schedule windows and
//! upload backpressure, asks the coordinator for a job and acts on the
//! classified outcome. Rendered frames of ordinary jobs go through the
//! [`UploadPipeline`]; the two privileged bootstrap jobs are validated inline
//! because the coordinator gates further work on them.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveTime;
use farmhand_models::{ActiveJob, ErrorKind, ExitStatus, Job};
use farmhand_protocol::{Coordinator, JobOffer, JobRequestOutcome, ServerTrouble};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::checkpoint::CheckpointLog;
use crate::config::WorkerConfig;
use crate::control::{self, ControlSignals, Controller, EngineHandle};
use crate::error::WorkerResult;
use crate::gui::Gui;
use crate::keepalive::KeepAliveLoop;
use crate::logging::JobLogger;
use crate::metrics;
use crate::reporter::ErrorReporter;
use crate::schedule::next_request_delay;
use crate::upload::{remove_output, UploadContext, UploadPipeline};
use crate::watcher::{ProcessLister, ProcessWatcher, SysinfoProcessLister};
use crate::work::{JobWork, RenderContext};

/// Time of day used for the schedule windows.
pub type Clock = Arc<dyn Fn() -> NaiveTime + Send + Sync>;

/// What the main loop does after handling an outcome.
enum Flow {
    Continue,
    Exit(ExitStatus),
}

pub struct WorkerEngine {
    config: WorkerConfig,
    coordinator: Arc<dyn Coordinator>,
    work: Arc<dyn JobWork>,
    gui: Arc<dyn Gui>,
    checkpoints: Arc<CheckpointLog>,
    reporter: Arc<ErrorReporter>,
    lister: Arc<dyn ProcessLister>,
    clock: Clock,
    handle: EngineHandle,
    controller: Controller,
    signals: ControlSignals,
    active: watch::Sender<Option<ActiveJob>>,
}

/// Background tasks living as long as the engine loop.
struct Background {
    control: JoinHandle<()>,
    keepalive: JoinHandle<()>,
    watcher: Option<JoinHandle<()>>,
}

impl WorkerEngine {
    pub fn new(
        config: WorkerConfig,
        coordinator: Arc<dyn Coordinator>,
        work: Arc<dyn JobWork>,
        gui: Arc<dyn Gui>,
        checkpoints: Arc<CheckpointLog>,
    ) -> (Self, EngineHandle) {
        let (handle, controller, signals) = control::channel();
        let reporter = Arc::new(ErrorReporter::new(
            Arc::clone(&coordinator),
            Arc::clone(&checkpoints),
            config.timings.error_cooldown,
            signals.running.clone(),
        ));
        let (active, _) = watch::channel(None);

        let engine = Self {
            config,
            coordinator,
            work,
            gui,
            checkpoints,
            reporter,
            lister: Arc::new(SysinfoProcessLister),
            clock: Arc::new(|| chrono::Local::now().time()),
            handle: handle.clone(),
            controller,
            signals,
            active,
        };
        (engine, handle)
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_process_lister(mut self, lister: Arc<dyn ProcessLister>) -> Self {
        self.lister = lister;
        self
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Run until shutdown or a terminal condition.
    pub async fn run(self) -> WorkerResult<ExitStatus> {
        let Self {
            config,
            coordinator,
            work,
            gui,
            checkpoints,
            reporter,
            lister,
            clock,
            handle,
            controller,
            signals,
            active,
        } = self;
        let control_task = controller.spawn();

        info!(server = %config.server, login = %config.login, "Starting worker");
        gui.status("Connecting to coordinator");
        let checkpoint = checkpoints.new_checkpoint();
        if let Err(kind) = coordinator.configure().await {
            error!("Configuration handshake failed: {}", kind);
            gui.error(&format!("Could not connect to the coordinator: {}", kind));
            handle.shutdown();
            control_task.await?;
            return Ok(ExitStatus::Configuration);
        }
        checkpoints.remove(checkpoint);

        match work.prepare().await {
            Ok(removed) if removed > 0 => info!(removed, "Removed corrupted cache entries"),
            Ok(_) => {}
            Err(kind) => {
                error!("Cannot prepare the work directory: {}", kind);
                gui.error(&format!("Cannot prepare the work directory: {}", kind));
                handle.shutdown();
                control_task.await?;
                let _ = coordinator.logout().await;
                return Ok(match kind {
                    ErrorKind::NoSpaceLeftOnDevice => ExitStatus::NoSpaceLeftOnDevice,
                    _ => ExitStatus::Configuration,
                });
            }
        }

        let uploads = UploadPipeline::start(
            UploadContext {
                coordinator: Arc::clone(&coordinator),
                reporter: Arc::clone(&reporter),
                checkpoints: Arc::clone(&checkpoints),
                gui: Arc::clone(&gui),
            },
            config.max_uploads,
        );
        let keepalive = KeepAliveLoop::new(
            Arc::clone(&coordinator),
            active.subscribe(),
            signals.clone(),
            handle.clone(),
            config.timings.keepalive_poll,
        )
        .spawn();
        let watcher = config.incompatible_process.clone().map(|name| {
            ProcessWatcher::new(
                name,
                Arc::clone(&lister),
                signals.clone(),
                handle.clone(),
                Arc::clone(&gui),
                config.timings.watcher_interval,
            )
            .spawn()
        });
        let background = Background {
            control: control_task,
            keepalive,
            watcher,
        };

        let mut worker = Loop {
            config: &config,
            coordinator: coordinator.as_ref(),
            work: work.as_ref(),
            gui: gui.as_ref(),
            checkpoints: &checkpoints,
            reporter: &reporter,
            clock: &clock,
            signals,
            active: &active,
            uploads: &uploads,
        };
        let status = worker.run().await;

        info!(?status, "Stopping worker");
        reporter.disable();
        handle.shutdown();
        if let Err(kind) = coordinator.logout().await {
            debug!("Logout failed: {}", kind);
        }
        background.keepalive.await?;
        if let Some(watcher) = background.watcher {
            watcher.await?;
        }
        uploads.close().await?;
        background.control.await?;
        info!("Worker stopped");

        Ok(status)
    }
}

/// Borrowed state of the main loop.
struct Loop<'a> {
    config: &'a WorkerConfig,
    coordinator: &'a dyn Coordinator,
    work: &'a dyn JobWork,
    gui: &'a dyn Gui,
    checkpoints: &'a CheckpointLog,
    reporter: &'a ErrorReporter,
    clock: &'a Clock,
    signals: ControlSignals,
    active: &'a watch::Sender<Option<ActiveJob>>,
    uploads: &'a UploadPipeline,
}

impl Loop<'_> {
    async fn run(&mut self) -> ExitStatus {
        loop {
            if !self.signals.is_running() {
                return ExitStatus::Normal;
            }

            if self.signals.is_suspended() {
                info!("Worker paused");
                self.gui.status(&paused_status(None));
                if !self.signals.wait_while_suspended().await {
                    return ExitStatus::Normal;
                }
                info!("Worker resumed");
                continue;
            }

            if let Some(delay) = next_request_delay(&self.config.schedule, (self.clock)()) {
                info!(wait_secs = delay.as_secs(), "Outside of the rendering schedule");
                self.gui
                    .status(&format!("Outside of schedule, next window in {}", format_wait(delay)));
                if !self.signals.sleep(delay).await {
                    return ExitStatus::Normal;
                }
                continue;
            }

            if self.uploads.should_throttle() {
                self.gui.status("Waiting for uploads to finish");
                while self.uploads.should_throttle() {
                    if !self.signals.sleep(self.config.timings.backpressure_poll).await {
                        return ExitStatus::Normal;
                    }
                }
                continue;
            }

            let checkpoint = self.checkpoints.new_checkpoint();
            let outcome = self.request().await;
            if !self.signals.is_running() {
                self.checkpoints.remove(checkpoint);
                return ExitStatus::Normal;
            }

            if let Flow::Exit(status) = self.handle_outcome(outcome, checkpoint).await {
                return status;
            }
        }
    }

    /// Ask for a job, re-establishing a dead session once.
    async fn request(&self) -> JobRequestOutcome {
        self.gui.status("Requesting job");
        let cached = self.work.cached_archives().await;
        let outcome = self.coordinator.request_job(&cached).await;
        if !matches!(outcome, JobRequestOutcome::SessionDead) {
            return outcome;
        }

        warn!("Session expired, reconnecting");
        if let Err(kind) = self.coordinator.configure().await {
            warn!("Reconnection failed: {}", kind);
            return outcome;
        }
        self.coordinator.request_job(&cached).await
    }

    async fn handle_outcome(&mut self, outcome: JobRequestOutcome, checkpoint: u64) -> Flow {
        match outcome {
            JobRequestOutcome::Job(offer) => self.handle_job(*offer, checkpoint).await,
            JobRequestOutcome::NoJob { frames_remaining, evict } => {
                self.apply_bookkeeping(frames_remaining, &evict).await;
                self.checkpoints.remove(checkpoint);
                self.idle().await
            }
            JobRequestOutcome::SessionDead => {
                self.checkpoints.remove(checkpoint);
                self.idle().await
            }
            JobRequestOutcome::NoRenderRight => {
                error!("This account is not allowed to render");
                self.gui.error("This account is not allowed to render");
                self.checkpoints.remove(checkpoint);
                Flow::Exit(ExitStatus::NoRenderRight)
            }
            JobRequestOutcome::SessionDisabled => {
                self.checkpoints.remove(checkpoint);
                self.block(ErrorKind::SessionDisabled).await
            }
            JobRequestOutcome::RendererUnavailable => {
                self.checkpoints.remove(checkpoint);
                self.block(ErrorKind::RendererNotAvailable).await
            }
            JobRequestOutcome::ServerTrouble(trouble) => {
                let cooldown = self.config.timings.server_trouble_cooldown;
                let reason = match trouble {
                    ServerTrouble::Down => "unreachable",
                    ServerTrouble::Overloaded => "overloaded",
                    ServerTrouble::Maintenance => "in maintenance",
                    ServerTrouble::BadResponse => "sending bad responses",
                };
                warn!(?trouble, "Coordinator {}", reason);
                self.gui.status(&format!(
                    "Coordinator is {}, retrying in {}",
                    reason,
                    format_wait(cooldown)
                ));
                self.checkpoints.remove(checkpoint);
                self.sleep_or_stop(cooldown).await
            }
            JobRequestOutcome::ProtocolError(kind) => {
                error!("Job request failed: {}", kind);
                self.reporter.send_error(checkpoint, None, kind).await;
                Flow::Continue
            }
        }
    }

    async fn apply_bookkeeping(&self, frames_remaining: Option<u64>, evict: &[String]) {
        if let Some(remaining) = frames_remaining {
            self.gui.frames_remaining(remaining);
        }
        for md5 in evict {
            self.work.evict(md5).await;
        }
    }

    /// No work: wait in short steps, reporting the remaining time.
    async fn idle(&self) -> Flow {
        let timings = &self.config.timings;
        let mut remaining = timings.no_job_wait;
        info!(wait_secs = remaining.as_secs(), "No job available");

        while !remaining.is_zero() {
            self.gui.status(&paused_status(Some(remaining)));
            let step = remaining.min(timings.no_job_poll);
            if !self.signals.sleep(step).await {
                return Flow::Exit(ExitStatus::Normal);
            }
            remaining = remaining.saturating_sub(step);
        }
        Flow::Continue
    }

    /// Nothing can be done until the operator intervenes.
    async fn block(&self, kind: ErrorKind) -> Flow {
        error!("{}, waiting for shutdown", kind);
        self.gui.error(&kind.to_string());
        let mut running = self.signals.running.clone();
        let _ = running.wait_for(|r| !*r).await;
        Flow::Exit(ExitStatus::Normal)
    }

    async fn sleep_or_stop(&self, duration: Duration) -> Flow {
        if self.signals.sleep(duration).await {
            Flow::Continue
        } else {
            Flow::Exit(ExitStatus::Normal)
        }
    }

    async fn handle_job(&mut self, offer: JobOffer, checkpoint: u64) -> Flow {
        let JobOffer {
            mut job,
            frames_remaining,
            evict,
        } = offer;
        self.apply_bookkeeping(frames_remaining, &evict).await;

        let logger = JobLogger::new(&job, "job");
        let span = logger.create_span();
        let result = self.render(&mut job).instrument(span.clone()).await;

        async {
            match result {
                Ok(()) if job.is_privileged() => {
                    self.validate_inline(job, checkpoint).await;
                    Flow::Continue
                }
                Ok(()) => {
                    if let Err(e) = self.uploads.enqueue(job, checkpoint).await {
                        warn!("Frame dropped: {}", e);
                    }
                    Flow::Continue
                }
                Err(kind) if kind.is_killed() => {
                    logger.log_warning(&format!("{}, asking for new work", kind));
                    self.checkpoints.remove(checkpoint);
                    Flow::Continue
                }
                Err(ErrorKind::NoSpaceLeftOnDevice) => {
                    logger.log_error("disk full");
                    self.gui.error("No space left on device");
                    self.reporter
                        .report(checkpoint, Some(&job), ErrorKind::NoSpaceLeftOnDevice)
                        .await;
                    Flow::Exit(ExitStatus::NoSpaceLeftOnDevice)
                }
                Err(kind) => {
                    logger.log_error(&kind.to_string());
                    self.gui.error(&format!("Frame {} failed: {}", job.frame_number, kind));
                    self.reporter.send_error(checkpoint, Some(&job), kind).await;
                    Flow::Continue
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn render(&mut self, job: &mut Job) -> Result<(), ErrorKind> {
        // Only kills issued from here on concern this job.
        self.signals.kill.borrow_and_update();
        self.active.send_replace(Some(job.active()));

        let ctx = RenderContext {
            gui: self.gui,
            kill: &self.signals.kill,
        };
        let result = self.work.run(job, &ctx).await;

        self.active.send_replace(None);
        let outcome = match &result {
            Ok(()) => ErrorKind::Ok,
            Err(kind) => *kind,
        };
        metrics::record_render(outcome, job.process.duration().as_secs_f64());
        result
    }

    async fn validate_inline(&self, job: Job, checkpoint: u64) {
        self.gui.status("Validating frame");
        match self.coordinator.validate_job(&job).await {
            Ok(()) => {
                info!(job_id = %job.id, "Privileged job validated");
                metrics::record_upload(ErrorKind::Ok);
                remove_output(&job).await;
                self.checkpoints.remove(checkpoint);
                self.gui.frame_completed();
            }
            Err(kind) => {
                warn!(job_id = %job.id, "Privileged job validation failed: {}", kind);
                metrics::record_upload(kind);
                remove_output(&job).await;
                self.reporter.send_error(checkpoint, Some(&job), kind).await;
            }
        }
    }
}

/// Status shown while the worker is not rendering, whether suspended or idle.
fn paused_status(resume_in: Option<Duration>) -> String {
    match resume_in {
        Some(wait) => format!("Paused, resuming in {}", format_wait(wait)),
        None => "Paused".to_string(),
    }
}

/// `14m 05s`, or `42s` under a minute.
fn format_wait(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs / 60) % 60, secs % 60);
    match (hours, minutes) {
        (0, 0) => format!("{}s", seconds),
        (0, _) => format!("{}m {:02}s", minutes, seconds),
        _ => format!("{}h {:02}m", hours, minutes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_wait() {
        assert_eq!(format_wait(Duration::from_secs(42)), "42s");
        assert_eq!(format_wait(Duration::from_secs(14 * 60 + 5)), "14m 05s");
        assert_eq!(format_wait(Duration::from_secs(3 * 3600 + 60 * 20 + 9)), "3h 20m");
    }

    #[test]
    fn test_idle_and_suspend_share_status() {
        assert_eq!(paused_status(None), "Paused");
        assert_eq!(paused_status(Some(Duration::from_secs(900))), "Paused, resuming in 15m 00s");
    }
}
