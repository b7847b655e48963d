//! Coordinator protocol for the farmhand render worker.
//!
//! This crate provides:
//! - The [`Coordinator`] trait the worker programs against
//! - [`ProtocolClient`], its HTTP implementation (XML over HTTP, session cookie)
//! - Host description sent with every job request
//! - Fixed-delay retry for transfers

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod host;
pub mod metrics;
pub mod response;
pub mod retry;

#[cfg(test)]
mod client_tests;

pub use client::ProtocolClient;
pub use config::ProtocolConfig;
pub use coordinator::{
    ArchiveKind, Coordinator, ErrorReport, JobOffer, JobRequestOutcome, KeepAliveOutcome, ProgressFn,
    ServerTrouble,
};
pub use error::{ProtocolError, ProtocolResult};
pub use host::{ComputeMethod, GpuDescriptor, HostInfo};
pub use retry::{retry_fixed, Attempt, FailureTracker, RetryPolicy};
