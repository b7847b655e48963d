//! Callbacks toward whatever front-end displays the worker.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, error, info};

/// Display sink. Implementations must be cheap: the engine calls them inline.
pub trait Gui: Send + Sync {
    fn status(&self, text: &str);

    fn error(&self, text: &str);

    /// A frame was validated by the coordinator.
    fn frame_completed(&self);

    /// Frames left in the coordinator's queue.
    fn frames_remaining(&self, remaining: u64);

    /// Transfer progress in bytes; `total` is unknown for chunked responses.
    fn progress(&self, current: u64, total: Option<u64>);
}

/// Front-end for unattended workers: everything goes to the log.
#[derive(Debug, Default)]
pub struct HeadlessGui {
    completed: AtomicU64,
}

impl HeadlessGui {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

impl Gui for HeadlessGui {
    fn status(&self, text: &str) {
        info!("{}", text);
    }

    fn error(&self, text: &str) {
        error!("{}", text);
    }

    fn frame_completed(&self) {
        let total = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        info!(frames_completed = total, "Frame completed");
    }

    fn frames_remaining(&self, remaining: u64) {
        info!(frames_remaining = remaining, "Coordinator queue");
    }

    fn progress(&self, current: u64, total: Option<u64>) {
        match total {
            Some(total) if total > 0 => debug!("Transfer {}% ({} / {} bytes)", current * 100 / total, current, total),
            _ => debug!("Transfer {} bytes", current),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_counts_frames() {
        let gui = HeadlessGui::new();
        gui.frame_completed();
        gui.frame_completed();
        gui.progress(10, None);
        assert_eq!(gui.frames_completed(), 2);
    }
}
