//! Incompatible-process watcher.
//!
//! Rendering pauses while a configured process (a game, another renderer)
//! is running on the machine and picks up again once it is gone.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::{ProcessRefreshKind, RefreshKind, System};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::control::{ControlSignals, EngineHandle, KillReason, SuspendReason};
use crate::gui::Gui;

/// Source of running process names.
#[async_trait]
pub trait ProcessLister: Send + Sync {
    async fn process_names(&self) -> Vec<String>;
}

/// Process list from `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoProcessLister;

#[async_trait]
impl ProcessLister for SysinfoProcessLister {
    async fn process_names(&self) -> Vec<String> {
        let scan = tokio::task::spawn_blocking(|| {
            let sys = System::new_with_specifics(RefreshKind::nothing().with_processes(ProcessRefreshKind::nothing()));
            sys.processes()
                .values()
                .map(|process| process.name().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
        })
        .await;

        scan.unwrap_or_else(|e| {
            warn!("Process scan failed: {}", e);
            Vec::new()
        })
    }
}

/// Case-insensitive comparison, ignoring a trailing `.exe`.
fn same_process(name: &str, wanted: &str) -> bool {
    fn normalize(s: &str) -> String {
        let lower = s.trim().to_lowercase();
        lower.strip_suffix(".exe").map(str::to_string).unwrap_or(lower)
    }
    normalize(name) == normalize(wanted)
}

pub struct ProcessWatcher {
    process_name: String,
    lister: Arc<dyn ProcessLister>,
    signals: ControlSignals,
    handle: EngineHandle,
    gui: Arc<dyn Gui>,
    interval: Duration,
}

impl ProcessWatcher {
    pub fn new(
        process_name: impl Into<String>,
        lister: Arc<dyn ProcessLister>,
        signals: ControlSignals,
        handle: EngineHandle,
        gui: Arc<dyn Gui>,
        interval: Duration,
    ) -> Self {
        Self {
            process_name: process_name.into(),
            lister,
            signals,
            handle,
            gui,
            interval,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        info!(process = %self.process_name, "Watching for incompatible process");
        let mut blocking = false;

        loop {
            let names = self.lister.process_names().await;
            let found = names.iter().any(|name| same_process(name, &self.process_name));

            if found && !blocking {
                info!(process = %self.process_name, "Incompatible process running, pausing");
                self.handle.kill_render(KillReason::IncompatibleProcess);
                self.handle.suspend_for(SuspendReason::IncompatibleProcess);
                self.gui
                    .status(&format!("Paused while {} is running", self.process_name));
                blocking = true;
            } else if !found && blocking {
                info!(process = %self.process_name, "Incompatible process gone, resuming");
                self.handle.resume_for(SuspendReason::IncompatibleProcess);
                blocking = false;
            }

            if !self.signals.sleep(self.interval).await {
                break;
            }
        }
        debug!("Process watcher stopped");
    }
}
