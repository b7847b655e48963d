//! Timing and resource bookkeeping for one renderer invocation.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Record of a renderer subprocess run, owned by its job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderProcessHandle {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Peak memory reported by the renderer
    pub memory_used_kb: u64,
    pub cores_used: u32,
    /// OS process id while running
    pub pid: Option<u32>,
}

impl RenderProcessHandle {
    /// Mark the process as started now.
    pub fn start(&mut self, pid: Option<u32>, cores: u32) {
        self.start_time = Some(Utc::now());
        self.end_time = None;
        self.pid = pid;
        self.cores_used = cores;
        self.memory_used_kb = 0;
    }

    /// Mark the process as finished now.
    pub fn finish(&mut self) {
        self.end_time = Some(Utc::now());
        self.pid = None;
    }

    /// Keep the highest memory figure seen so far.
    pub fn record_memory(&mut self, kb: u64) {
        self.memory_used_kb = self.memory_used_kb.max(kb);
    }

    /// Wall time of the run; an estimate while still running, zero before start.
    pub fn duration(&self) -> Duration {
        self.duration_at(Utc::now())
    }

    pub fn duration_at(&self, now: DateTime<Utc>) -> Duration {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
            (Some(start), None) => (now - start).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }

    pub fn is_running(&self) -> bool {
        self.start_time.is_some() && self.end_time.is_none()
    }

    /// Forget everything about the run.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
