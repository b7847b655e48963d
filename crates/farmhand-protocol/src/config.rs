//! Protocol client configuration.

use std::time::Duration;

use crate::host::{ComputeMethod, GpuDescriptor};
use crate::retry::RetryPolicy;

/// Keepalive interval used until the coordinator advises one.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(15 * 60);

/// Subtracted from the advised keepalive interval.
pub const KEEPALIVE_MARGIN: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Coordinator base URL, e.g. `https://farm.example.org`
    pub base_url: String,
    pub login: String,
    pub password: String,
    /// Reported as `version`
    pub client_version: String,
    pub compute_method: ComputeMethod,
    pub gpu: Option<GpuDescriptor>,
    /// Cores offered to the renderer; `None` means all of them
    pub cores: Option<u32>,
    /// Deadline for handshake, job request, keepalive and logout calls.
    /// Transfers are bounded by the connect timeout only.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub validation_retry: RetryPolicy,
}

impl ProtocolConfig {
    pub fn new(base_url: impl Into<String>, login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            login: login.into(),
            password: password.into(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            compute_method: ComputeMethod::default(),
            gpu: None,
            cores: None,
            timeout: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(10),
            validation_retry: RetryPolicy::validation(),
        }
    }

    /// Keepalive interval derived from the coordinator's advice.
    pub fn keepalive_from_advice(advised_secs: u64) -> Duration {
        let advised = Duration::from_secs(advised_secs);
        if advised > KEEPALIVE_MARGIN {
            advised - KEEPALIVE_MARGIN
        } else {
            advised
        }
    }
}
