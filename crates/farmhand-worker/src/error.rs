//! Worker error types.
//!
//! Classified job failures travel as [`ErrorKind`]; [`WorkerError`] covers
//! what goes wrong around them (configuration, filesystem, tasks).

use farmhand_models::ErrorKind;
use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] farmhand_protocol::ProtocolError),

    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Classified(#[from] ErrorKind),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Classification reported to the coordinator.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::ConfigError(_) => ErrorKind::WrongConfiguration,
            WorkerError::Protocol(e) => e.kind(),
            WorkerError::Classified(kind) => *kind,
            WorkerError::Io(e) if farmhand_protocol::error::is_storage_full(e) => ErrorKind::NoSpaceLeftOnDevice,
            WorkerError::Io(_) | WorkerError::Join(_) => ErrorKind::Unknown,
        }
    }

    pub fn is_config_error(&self) -> bool {
        matches!(self, WorkerError::ConfigError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(WorkerError::config_error("bad").kind(), ErrorKind::WrongConfiguration);
        assert_eq!(
            WorkerError::from(ErrorKind::MissingScene).kind(),
            ErrorKind::MissingScene
        );
        let enospc = WorkerError::from(std::io::Error::from_raw_os_error(28));
        assert_eq!(enospc.kind(), ErrorKind::NoSpaceLeftOnDevice);
    }

    #[test]
    fn test_config_error_predicate() {
        assert!(WorkerError::config_error("missing login").is_config_error());
        assert!(!WorkerError::from(ErrorKind::Unknown).is_config_error());
    }
}
