//! Session keepalive loop.

use std::sync::Arc;
use std::time::Duration;

use farmhand_models::ActiveJob;
use farmhand_protocol::{Coordinator, FailureTracker, KeepAliveOutcome};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::control::{ControlSignals, EngineHandle, KillReason};

/// Pings the coordinator whenever the session has been quiet for longer than
/// the advised keepalive interval.
pub struct KeepAliveLoop {
    coordinator: Arc<dyn Coordinator>,
    active: watch::Receiver<Option<ActiveJob>>,
    signals: ControlSignals,
    handle: EngineHandle,
    poll: Duration,
}

impl KeepAliveLoop {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        active: watch::Receiver<Option<ActiveJob>>,
        signals: ControlSignals,
        handle: EngineHandle,
        poll: Duration,
    ) -> Self {
        Self {
            coordinator,
            active,
            signals,
            handle,
            poll,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut failures = FailureTracker::new(3);

        while self.signals.sleep(self.poll).await {
            if !self.coordinator.keepalive_due() {
                continue;
            }

            let active = self.active.borrow().clone();
            let paused = self.signals.is_suspended();
            debug!(job_id = ?active.as_ref().map(|a| a.id.as_str()), paused, "Sending keepalive");

            match self.coordinator.keep_alive(active.as_ref(), paused).await {
                Ok(KeepAliveOutcome::Continue) => failures.record_success(),
                Ok(KeepAliveOutcome::StopRendering) => {
                    failures.record_success();
                    if let Some(active) = active {
                        info!(job_id = %active.id, frame = active.frame_number, "Coordinator asked to stop rendering");
                        self.handle.kill_render(KillReason::Server);
                    }
                }
                Err(kind) => {
                    if failures.record_failure() {
                        warn!("Keepalive failed: {}", kind);
                    }
                }
            }
        }
        debug!("Keepalive loop stopped");
    }
}
