//! Jobs handed out by the coordinator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::RenderProcessHandle;

/// Identifier of a job, as issued by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Bootstrap job used by the coordinator to learn the compute method.
    pub const COMPUTE_METHOD: &'static str = "1";
    /// Benchmark job used by the coordinator to measure machine power.
    pub const POWER_DETECTION: &'static str = "2";

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reserved jobs whose validation gates eligibility for normal work.
    pub fn is_privileged(&self) -> bool {
        self.0 == Self::COMPUTE_METHOD || self.0 == Self::POWER_DETECTION
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One unit of render work: a frame of a scene.
///
/// The request data is fixed when the coordinator hands the job out; the
/// output path and process handle are filled in by the render phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    /// Frame to render
    pub frame_number: u64,

    /// MD5 of the scene archive
    pub scene_md5: String,

    /// MD5 of the renderer archive
    pub renderer_md5: String,

    /// Scene file path relative to the extracted scene archive
    pub path: String,

    /// Renderer command line template
    pub renderer_command: String,

    pub use_gpu: bool,

    /// Opaque data echoed back to the coordinator
    #[serde(default)]
    pub extras: String,

    /// Scene revision
    pub revision: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Password protecting the scene archive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_password: Option<String>,

    /// Overrides the validate endpoint for this job
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_url: Option<String>,

    /// Rendered image, once found
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_image_path: Option<PathBuf>,

    #[serde(skip)]
    pub process: RenderProcessHandle,
}

impl Job {
    pub fn is_privileged(&self) -> bool {
        self.id.is_privileged()
    }

    /// Identifiers reported by keepalive while this job renders.
    pub fn active(&self) -> ActiveJob {
        ActiveJob {
            id: self.id.clone(),
            frame_number: self.frame_number,
        }
    }

    /// Prefix of the files the renderer writes for this job.
    pub fn output_prefix(&self) -> String {
        format!("{}_{}_", self.id, self.frame_number)
    }
}

/// The job currently being rendered, as seen by background watchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveJob {
    pub id: JobId,
    pub frame_number: u64,
}
