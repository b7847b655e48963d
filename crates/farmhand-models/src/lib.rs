//! Shared data models for the farmhand render worker.
//!
//! This crate provides:
//! - The local error taxonomy and the coordinator's wire status codes
//! - Jobs and their identifiers
//! - Render process bookkeeping (timing, memory, cores)
//! - Process exit statuses

pub mod error_kind;
pub mod exit;
pub mod job;
pub mod render_process;

// Re-export common types
pub use error_kind::{ErrorKind, ServerCode};
pub use exit::ExitStatus;
pub use job::{ActiveJob, Job, JobId};
pub use render_process::RenderProcessHandle;
