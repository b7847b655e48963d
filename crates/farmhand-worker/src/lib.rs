//! Render farm worker.
//!
//! This crate provides:
//! - The worker engine (job acquisition, backoff, suspend/resume, shutdown)
//! - Archive download cache and extraction
//! - Supervised renderer execution
//! - Background validation of rendered frames
//! - Checkpointed log capture for diagnostic bundles
//! - Session keepalive and incompatible-process watching

pub mod archive;
pub mod checkpoint;
pub mod config;
pub mod control;
pub mod download;
pub mod engine;
pub mod error;
pub mod gui;
pub mod keepalive;
pub mod logging;
pub mod metrics;
pub mod render;
pub mod reporter;
pub mod schedule;
pub mod upload;
pub mod watcher;
pub mod work;

#[cfg(test)]
mod test_support;

pub use checkpoint::{CheckpointLayer, CheckpointLog};
pub use config::{Timings, WorkerConfig};
pub use control::{EngineHandle, KillReason, SuspendReason};
pub use engine::{Clock, WorkerEngine};
pub use error::{WorkerError, WorkerResult};
pub use gui::{Gui, HeadlessGui};
pub use logging::JobLogger;
pub use work::{JobWork, LocalWork, RenderContext};
