//! Engine control: suspend reasons, render kills and shutdown.
//!
//! A single control task owns the state and applies [`EngineCommand`]s sent
//! through an [`EngineHandle`]. Everything else observes the state through
//! `watch` receivers bundled in [`ControlSignals`].

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use farmhand_models::ErrorKind;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Why the engine is parked. The engine runs only while no reason is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SuspendReason {
    Operator,
    IncompatibleProcess,
}

pub type SuspendSet = BTreeSet<SuspendReason>;

/// Why a render was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KillReason {
    User,
    Server,
    IncompatibleProcess,
    Timeout,
}

impl KillReason {
    /// Classification of a render stopped for this reason.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            KillReason::User => ErrorKind::RendererKilledByUser,
            KillReason::Server => ErrorKind::RendererKilledByServer,
            KillReason::IncompatibleProcess | KillReason::Timeout => ErrorKind::RendererKilled,
        }
    }
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KillReason::User => "user",
            KillReason::Server => "coordinator",
            KillReason::IncompatibleProcess => "incompatible process",
            KillReason::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    Suspend(SuspendReason),
    Resume(SuspendReason),
    KillRender(KillReason),
    Shutdown,
}

/// Cloneable remote control for a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    fn send(&self, command: EngineCommand) {
        if self.tx.send(command).is_err() {
            debug!(?command, "Engine already stopped, command dropped");
        }
    }

    /// Operator pause. Idempotent.
    pub fn suspend(&self) {
        self.suspend_for(SuspendReason::Operator);
    }

    /// Operator resume. Leaves other suspend reasons in place.
    pub fn resume(&self) {
        self.resume_for(SuspendReason::Operator);
    }

    pub fn suspend_for(&self, reason: SuspendReason) {
        self.send(EngineCommand::Suspend(reason));
    }

    pub fn resume_for(&self, reason: SuspendReason) {
        self.send(EngineCommand::Resume(reason));
    }

    /// Stop the active render, if any.
    pub fn kill_render(&self, reason: KillReason) {
        self.send(EngineCommand::KillRender(reason));
    }

    pub fn shutdown(&self) {
        self.send(EngineCommand::Shutdown);
    }
}

/// Read side of the control state.
#[derive(Debug, Clone)]
pub struct ControlSignals {
    pub suspended: watch::Receiver<SuspendSet>,
    pub kill: watch::Receiver<Option<KillReason>>,
    pub running: watch::Receiver<bool>,
}

impl ControlSignals {
    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    pub fn is_suspended(&self) -> bool {
        !self.suspended.borrow().is_empty()
    }

    /// Park until no suspend reason remains. Returns `false` on shutdown.
    pub async fn wait_while_suspended(&mut self) -> bool {
        if !self.is_running() {
            return false;
        }
        let mut running = self.running.clone();
        let suspended = &mut self.suspended;
        let resumed = tokio::select! {
            resumed = suspended.wait_for(|reasons| reasons.is_empty()) => resumed.is_ok(),
            _ = running.wait_for(|r| !*r) => false,
        };
        resumed && self.is_running()
    }

    /// Sleep unless shutdown comes first. Returns `false` on shutdown.
    pub async fn sleep(&self, duration: Duration) -> bool {
        sleep_unless_stopped(&self.running, duration).await
    }
}

/// Sleep for `duration`, waking early when `running` turns false.
///
/// Returns whether the worker is still running.
pub async fn sleep_unless_stopped(running: &watch::Receiver<bool>, duration: Duration) -> bool {
    let mut running = running.clone();
    if !*running.borrow_and_update() {
        return false;
    }
    let slept = tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = async {
            let _ = running.wait_for(|r| !*r).await;
        } => false,
    };
    slept && *running.borrow()
}

/// Write side of the control state, owned by the control task.
pub(crate) struct Controller {
    rx: mpsc::UnboundedReceiver<EngineCommand>,
    suspended: watch::Sender<SuspendSet>,
    kill: watch::Sender<Option<KillReason>>,
    running: watch::Sender<bool>,
}

/// Create the command channel and the state it drives.
pub(crate) fn channel() -> (EngineHandle, Controller, ControlSignals) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (suspended_tx, suspended_rx) = watch::channel(SuspendSet::new());
    let (kill_tx, kill_rx) = watch::channel(None);
    let (running_tx, running_rx) = watch::channel(true);

    let controller = Controller {
        rx,
        suspended: suspended_tx,
        kill: kill_tx,
        running: running_tx,
    };
    let signals = ControlSignals {
        suspended: suspended_rx,
        kill: kill_rx,
        running: running_rx,
    };
    (EngineHandle { tx }, controller, signals)
}

impl Controller {
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            debug!(?command, "Engine command");
            match command {
                EngineCommand::Suspend(reason) => {
                    self.suspended.send_if_modified(|reasons| reasons.insert(reason));
                }
                EngineCommand::Resume(reason) => {
                    self.suspended.send_if_modified(|reasons| reasons.remove(&reason));
                }
                EngineCommand::KillRender(reason) => {
                    self.kill.send_replace(Some(reason));
                }
                EngineCommand::Shutdown => {
                    info!("Shutdown requested");
                    self.running.send_replace(false);
                    self.kill.send_replace(Some(KillReason::User));
                    break;
                }
            }
        }
    }
}
