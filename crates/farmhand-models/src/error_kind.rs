//! Local error kinds and coordinator status codes.
//!
//! The coordinator answers every request with an XML document whose root
//! element carries a numeric `status` attribute. [`ServerCode`] names those
//! statuses and [`ServerCode::error_kind`] maps them onto the worker's own
//! [`ErrorKind`] taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified outcome of a worker operation.
///
/// `Ok` is part of the taxonomy because render results and wire statuses are
/// both expressed in it; `Result<_, ErrorKind>` never carries `Ok` as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    #[error("no error")]
    Ok,

    #[error("wrong configuration")]
    WrongConfiguration,

    #[error("authentication failed, check login and password")]
    AuthenticationFailed,

    #[error("client is too old, please update")]
    TooOldClient,

    #[error("session disabled by the coordinator")]
    SessionDisabled,

    #[error("no renderer available for this machine")]
    RendererNotAvailable,

    #[error("renderer binary is missing")]
    MissingRender,

    #[error("scene archive is missing")]
    MissingScene,

    #[error("renderer produced no output file")]
    NoOutputFile,

    #[error("failed to download file")]
    DownloadFile,

    #[error("cannot create directory")]
    CanNotCreateDirectory,

    #[error("network issue")]
    NetworkIssue,

    #[error("renderer crashed")]
    RendererCrashed,

    #[error("renderer killed")]
    RendererKilled,

    #[error("renderer killed by user")]
    RendererKilledByUser,

    #[error("renderer killed by coordinator")]
    RendererKilledByServer,

    #[error("renderer is missing system libraries")]
    RendererMissingLibraries,

    #[error("failed to execute renderer")]
    FailedToExecute,

    #[error("operating system not supported")]
    OsNotSupported,

    #[error("CPU not supported")]
    CpuNotSupported,

    #[error("no space left on device")]
    NoSpaceLeftOnDevice,

    #[error("unknown error")]
    Unknown,
}

impl ErrorKind {
    /// Numeric code sent to the coordinator with diagnostic bundles.
    pub fn code(&self) -> u16 {
        match self {
            ErrorKind::Ok => 0,
            ErrorKind::WrongConfiguration => 1,
            ErrorKind::AuthenticationFailed => 2,
            ErrorKind::TooOldClient => 3,
            ErrorKind::SessionDisabled => 4,
            ErrorKind::RendererNotAvailable => 5,
            ErrorKind::MissingRender => 6,
            ErrorKind::MissingScene => 7,
            ErrorKind::NoOutputFile => 8,
            ErrorKind::DownloadFile => 9,
            ErrorKind::CanNotCreateDirectory => 10,
            ErrorKind::NetworkIssue => 11,
            ErrorKind::RendererCrashed => 12,
            ErrorKind::RendererKilled => 14,
            ErrorKind::RendererKilledByUser => 15,
            ErrorKind::RendererKilledByServer => 16,
            ErrorKind::RendererMissingLibraries => 17,
            ErrorKind::FailedToExecute => 18,
            ErrorKind::OsNotSupported => 19,
            ErrorKind::CpuNotSupported => 20,
            ErrorKind::NoSpaceLeftOnDevice => 21,
            ErrorKind::Unknown => 99,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ErrorKind::Ok)
    }

    /// Render was stopped on purpose (operator, coordinator, watcher, timeout).
    ///
    /// The job is simply retried: no diagnostic bundle, no cooldown.
    pub fn is_killed(&self) -> bool {
        matches!(
            self,
            ErrorKind::RendererKilled
                | ErrorKind::RendererKilledByUser
                | ErrorKind::RendererKilledByServer
        )
    }

    /// Failures after which new work may be requested without a cooldown.
    pub fn skips_cooldown(&self) -> bool {
        self.is_killed() || matches!(self, ErrorKind::RendererCrashed)
    }
}

/// Status codes returned by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerCode {
    Ok,
    Unknown,
    ErrorNoRoot,
    ErrorBadResponse,
    ErrorRequestFailed,

    ConfigurationErrorNoClientVersionGiven,
    ConfigurationErrorClientTooOld,
    ConfigurationErrorAuthFailed,
    ConfigurationErrorWebSessionExpired,
    ConfigurationErrorMissingParameter,

    JobRequestNoJob,
    JobRequestErrorNoRenderingRight,
    JobRequestErrorDeadSession,
    JobRequestErrorSessionDisabled,
    JobRequestErrorInternalError,
    JobRequestErrorRendererNotAvailable,
    JobRequestServerInMaintenance,
    JobRequestServerOverloaded,

    JobValidationErrorMissingParameter,
    JobValidationErrorBrokenMachine,
    JobValidationErrorFrameIsNotImage,
    JobValidationErrorUploadFailed,
    JobValidationErrorSessionDisabled,

    KeepMeAliveStopRendering,
}

impl ServerCode {
    /// Resolve a wire status. Unlisted values collapse to `Unknown`.
    pub fn from_status(status: i32) -> Self {
        match status {
            0 => ServerCode::Ok,
            2 => ServerCode::ErrorNoRoot,
            3 => ServerCode::ErrorBadResponse,
            5 => ServerCode::ErrorRequestFailed,
            100 => ServerCode::ConfigurationErrorNoClientVersionGiven,
            101 => ServerCode::ConfigurationErrorClientTooOld,
            102 => ServerCode::ConfigurationErrorAuthFailed,
            103 => ServerCode::ConfigurationErrorWebSessionExpired,
            104 => ServerCode::ConfigurationErrorMissingParameter,
            200 => ServerCode::JobRequestNoJob,
            201 => ServerCode::JobRequestErrorNoRenderingRight,
            202 => ServerCode::JobRequestErrorDeadSession,
            203 => ServerCode::JobRequestErrorSessionDisabled,
            204 => ServerCode::JobRequestErrorInternalError,
            205 => ServerCode::JobRequestErrorRendererNotAvailable,
            206 => ServerCode::JobRequestServerInMaintenance,
            207 => ServerCode::JobRequestServerOverloaded,
            300 => ServerCode::JobValidationErrorMissingParameter,
            301 => ServerCode::JobValidationErrorBrokenMachine,
            302 => ServerCode::JobValidationErrorFrameIsNotImage,
            303 => ServerCode::JobValidationErrorUploadFailed,
            304 => ServerCode::JobValidationErrorSessionDisabled,
            400 => ServerCode::KeepMeAliveStopRendering,
            _ => ServerCode::Unknown,
        }
    }

    /// Numeric wire value.
    pub fn status(&self) -> i32 {
        match self {
            ServerCode::Ok => 0,
            ServerCode::Unknown => 999,
            ServerCode::ErrorNoRoot => 2,
            ServerCode::ErrorBadResponse => 3,
            ServerCode::ErrorRequestFailed => 5,
            ServerCode::ConfigurationErrorNoClientVersionGiven => 100,
            ServerCode::ConfigurationErrorClientTooOld => 101,
            ServerCode::ConfigurationErrorAuthFailed => 102,
            ServerCode::ConfigurationErrorWebSessionExpired => 103,
            ServerCode::ConfigurationErrorMissingParameter => 104,
            ServerCode::JobRequestNoJob => 200,
            ServerCode::JobRequestErrorNoRenderingRight => 201,
            ServerCode::JobRequestErrorDeadSession => 202,
            ServerCode::JobRequestErrorSessionDisabled => 203,
            ServerCode::JobRequestErrorInternalError => 204,
            ServerCode::JobRequestErrorRendererNotAvailable => 205,
            ServerCode::JobRequestServerInMaintenance => 206,
            ServerCode::JobRequestServerOverloaded => 207,
            ServerCode::JobValidationErrorMissingParameter => 300,
            ServerCode::JobValidationErrorBrokenMachine => 301,
            ServerCode::JobValidationErrorFrameIsNotImage => 302,
            ServerCode::JobValidationErrorUploadFailed => 303,
            ServerCode::JobValidationErrorSessionDisabled => 304,
            ServerCode::KeepMeAliveStopRendering => 400,
        }
    }

    /// Map a coordinator status onto the local taxonomy.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            ServerCode::Ok | ServerCode::JobRequestNoJob | ServerCode::KeepMeAliveStopRendering => {
                ErrorKind::Ok
            }
            ServerCode::ErrorRequestFailed => ErrorKind::NetworkIssue,
            ServerCode::ConfigurationErrorClientTooOld => ErrorKind::TooOldClient,
            ServerCode::ConfigurationErrorAuthFailed => ErrorKind::AuthenticationFailed,
            ServerCode::ConfigurationErrorNoClientVersionGiven
            | ServerCode::ConfigurationErrorWebSessionExpired
            | ServerCode::ConfigurationErrorMissingParameter => ErrorKind::WrongConfiguration,
            ServerCode::JobRequestErrorSessionDisabled
            | ServerCode::JobValidationErrorSessionDisabled => ErrorKind::SessionDisabled,
            ServerCode::JobRequestErrorRendererNotAvailable => ErrorKind::RendererNotAvailable,
            _ => ErrorKind::Unknown,
        }
    }
}

impl From<i32> for ServerCode {
    fn from(status: i32) -> Self {
        Self::from_status(status)
    }
}
