//! The worker's view of the coordinator.
//!
//! [`Coordinator`] is what the engine, the upload pipeline and the background
//! loops program against. [`ProtocolClient`](crate::ProtocolClient) is the HTTP
//! implementation; tests substitute fakes.

use std::path::Path;

use async_trait::async_trait;
use farmhand_models::{ActiveJob, ErrorKind, Job};

/// Why the coordinator could not serve a job request right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerTrouble {
    /// Unreachable, or answered with an HTTP error
    Down,
    Overloaded,
    Maintenance,
    /// Answer could not be parsed
    BadResponse,
}

/// A job handed out by the coordinator plus the bookkeeping sent with it.
#[derive(Debug, Clone)]
pub struct JobOffer {
    pub job: Job,
    pub frames_remaining: Option<u64>,
    /// Cached archives to delete
    pub evict: Vec<String>,
}

/// Classified answer to a job request.
#[derive(Debug, Clone)]
pub enum JobRequestOutcome {
    Job(Box<JobOffer>),
    NoJob {
        frames_remaining: Option<u64>,
        evict: Vec<String>,
    },
    NoRenderRight,
    SessionDead,
    SessionDisabled,
    RendererUnavailable,
    ServerTrouble(ServerTrouble),
    /// Anything else: malformed job, unexpected status, missing endpoint
    ProtocolError(ErrorKind),
}

/// Keepalive verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveOutcome {
    Continue,
    /// The coordinator no longer wants the current frame.
    StopRendering,
}

/// Which archive of a job to download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Renderer,
    Scene,
}

/// Diagnostic bundle upload.
#[derive(Debug, Clone, Copy)]
pub struct ErrorReport<'a> {
    pub kind: ErrorKind,
    /// File holding the captured log lines
    pub log_file: &'a Path,
    pub job: Option<&'a Job>,
}

/// Progress sink for downloads: `(bytes_done, total_if_known)`.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Configuration handshake: authenticates and fills the endpoint table.
    async fn configure(&self) -> Result<(), ErrorKind>;

    /// Ask for work, announcing the MD5s of locally cached archives.
    async fn request_job(&self, cached_md5s: &[String]) -> JobRequestOutcome;

    /// Upload the rendered frame. Deletes the local output on success.
    async fn validate_job(&self, job: &Job) -> Result<(), ErrorKind>;

    /// Ping the session. `active` is the frame being rendered, if any.
    async fn keep_alive(&self, active: Option<&ActiveJob>, paused: bool) -> Result<KeepAliveOutcome, ErrorKind>;

    /// Upload a diagnostic bundle.
    async fn send_error_report(&self, report: ErrorReport<'_>) -> Result<(), ErrorKind>;

    async fn logout(&self) -> Result<(), ErrorKind>;

    /// Stream `url` into `dest`.
    async fn download(&self, url: &str, dest: &Path, progress: ProgressFn<'_>) -> Result<(), ErrorKind>;

    /// Download location of one of a job's archives; `None` if unconfigured.
    fn archive_url(&self, kind: ArchiveKind, job: &Job) -> Option<String>;

    /// True once the session has been idle longer than the keepalive interval.
    fn keepalive_due(&self) -> bool;
}
