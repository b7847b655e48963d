//! Process exit statuses.

/// Why the worker stopped. Each variant maps to a distinct process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitStatus {
    /// Operator-requested shutdown.
    Normal,
    /// Failure nobody classified (top-level catch or panic).
    Unclassified,
    /// Configuration handshake rejected (credentials, version, parameters).
    Configuration,
    /// The account is not allowed to render.
    NoRenderRight,
    /// The disk filled up during download or render.
    NoSpaceLeftOnDevice,
}

impl ExitStatus {
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Normal => 0,
            ExitStatus::Unclassified => 1,
            ExitStatus::Configuration => 2,
            ExitStatus::NoRenderRight => 3,
            ExitStatus::NoSpaceLeftOnDevice => 4,
        }
    }
}
