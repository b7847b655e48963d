//! Checkpointed log capture for diagnostic bundles.
//!
//! Every job request opens a checkpoint; log lines land in the current one
//! until the next checkpoint opens. When something fails the lines of the
//! failing checkpoint are bundled and sent to the coordinator, otherwise the
//! checkpoint is simply removed.
//!
//! [`CheckpointLayer`] feeds the log from `tracing`, so components never
//! call [`CheckpointLog::append`] themselves.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Lines kept per checkpoint; the oldest are dropped past this.
pub const MAX_LINES_PER_CHECKPOINT: usize = 10_000;

#[derive(Debug, Default)]
pub struct CheckpointLog {
    entries: Mutex<BTreeMap<u64, Vec<String>>>,
    current: AtomicU64,
    last_id: AtomicU64,
}

impl CheckpointLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<u64, Vec<String>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a checkpoint and make it current.
    ///
    /// Ids are milliseconds since the epoch, bumped when two checkpoints
    /// open within the same millisecond.
    pub fn new_checkpoint(&self) -> u64 {
        let mut entries = self.entries();
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let id = now.max(self.last_id.load(Ordering::SeqCst) + 1);
        self.last_id.store(id, Ordering::SeqCst);
        entries.insert(id, Vec::new());
        self.current.store(id, Ordering::SeqCst);
        id
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Append a timestamped line to the current checkpoint. Blank messages are dropped.
    pub fn append(&self, level: Level, message: &str) {
        let message = message.trim_end();
        if message.trim().is_empty() {
            return;
        }
        let line = format!("{} {:>5} {}", Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"), level, message);

        let current = self.current();
        let mut entries = self.entries();
        if let Some(lines) = entries.get_mut(&current) {
            if lines.len() >= MAX_LINES_PER_CHECKPOINT {
                lines.remove(0);
            }
            lines.push(line);
        }
    }

    /// Lines of a checkpoint, empty if unknown.
    pub fn lines(&self, id: u64) -> Vec<String> {
        self.entries().get(&id).cloned().unwrap_or_default()
    }

    /// Forget a checkpoint. Unknown ids are ignored.
    pub fn remove(&self, id: u64) {
        self.entries().remove(&id);
    }

    /// Number of open checkpoints.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `tracing` layer writing events into a [`CheckpointLog`].
pub struct CheckpointLayer {
    log: Arc<CheckpointLog>,
}

impl CheckpointLayer {
    pub fn new(log: Arc<CheckpointLog>) -> Self {
        Self { log }
    }
}

#[derive(Default)]
struct EventVisitor {
    message: String,
    fields: String,
}

impl Visit for EventVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for CheckpointLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level == Level::TRACE {
            return;
        }

        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);
        if visitor.message.is_empty() {
            return;
        }
        visitor.message.push_str(&visitor.fields);
        self.log.append(level, &visitor.message);
    }
}
