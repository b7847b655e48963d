//! Protocol error types.
//!
//! These never leave the crate's public operations: every [`Coordinator`]
//! method converts them with [`ProtocolError::kind`] before returning.
//!
//! [`Coordinator`]: crate::Coordinator

use farmhand_models::{ErrorKind, ServerCode};
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP error with status {0}")]
    Http(u16),

    #[error("Malformed XML response: {0}")]
    Xml(#[from] quick_xml::DeError),

    #[error("Response is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Invalid value for field '{field}': {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("No endpoint configured for '{0}'")]
    MissingEndpoint(String),

    #[error("Coordinator answered {0:?}")]
    Status(ServerCode),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub fn missing_endpoint(operation: impl Into<String>) -> Self {
        Self::MissingEndpoint(operation.into())
    }

    /// Classify the failure for the worker.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Network(_) | ProtocolError::Http(_) => ErrorKind::NetworkIssue,
            ProtocolError::MissingEndpoint(_) => ErrorKind::WrongConfiguration,
            ProtocolError::Status(code) => code.error_kind(),
            ProtocolError::Io(e) if is_storage_full(e) => ErrorKind::NoSpaceLeftOnDevice,
            _ => ErrorKind::Unknown,
        }
    }

    /// Connection refused, unresolved host, unreachable, timeout.
    pub fn is_transport(&self) -> bool {
        match self {
            ProtocolError::Network(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            _ => false,
        }
    }
}

/// Check if an IO error is ENOSPC.
pub fn is_storage_full(e: &std::io::Error) -> bool {
    // ENOSPC is error code 28 on Linux/macOS
    e.raw_os_error() == Some(28)
}
