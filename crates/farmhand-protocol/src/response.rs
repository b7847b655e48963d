//! XML documents returned by the coordinator.
//!
//! Every root element carries a numeric `status` attribute. Job request
//! responses look like:
//!
//! ```xml
//! <jobrequest status="0">
//!   <frames remaining="120"/>
//!   <job id="42" archive_md5="…" path="scene.blend" revision="3" use_gpu="0" frame="7" extras="…">
//!     <renderer md5="…" commandline="%RENDERER% -b %SCENE% -o %OUTPUT% -f %FRAME%"/>
//!   </job>
//!   <file md5="…" action="delete"/>
//! </jobrequest>
//! ```

use farmhand_models::{Job, JobId, RenderProcessHandle, ServerCode};
use serde::Deserialize;

use crate::error::{ProtocolError, ProtocolResult};

#[derive(Debug, Deserialize)]
struct StatusDoc {
    #[serde(rename = "@status")]
    status: i32,
}

/// Parse a response that only matters for its status.
pub fn parse_status(body: &str) -> ProtocolResult<ServerCode> {
    let doc: StatusDoc = quick_xml::de::from_str(body)?;
    Ok(ServerCode::from_status(doc.status))
}

#[derive(Debug, Deserialize)]
struct ConfigDoc {
    #[serde(rename = "@status")]
    status: i32,
    /// Advised keepalive interval in seconds
    #[serde(rename = "@keepalive", default)]
    keepalive: Option<u64>,
    #[serde(rename = "request", default)]
    requests: Vec<EndpointNode>,
}

#[derive(Debug, Deserialize)]
struct EndpointNode {
    #[serde(rename = "@type")]
    operation: String,
    #[serde(rename = "@path")]
    path: String,
}

/// Parsed configuration handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigResponse {
    pub status: ServerCode,
    pub keepalive_secs: Option<u64>,
    /// Operation name → path
    pub endpoints: Vec<(String, String)>,
}

pub fn parse_config(body: &str) -> ProtocolResult<ConfigResponse> {
    let doc: ConfigDoc = quick_xml::de::from_str(body)?;
    Ok(ConfigResponse {
        status: ServerCode::from_status(doc.status),
        keepalive_secs: doc.keepalive,
        endpoints: doc
            .requests
            .into_iter()
            .map(|node| (node.operation, node.path))
            .collect(),
    })
}

#[derive(Debug, Deserialize)]
struct JobRequestDoc {
    #[serde(rename = "@status")]
    status: i32,
    #[serde(default)]
    frames: Option<FramesNode>,
    #[serde(default)]
    job: Option<JobNode>,
    #[serde(rename = "file", default)]
    files: Vec<FileNode>,
}

#[derive(Debug, Deserialize)]
struct FramesNode {
    #[serde(rename = "@remaining", default)]
    remaining: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileNode {
    #[serde(rename = "@md5")]
    md5: String,
    #[serde(rename = "@action", default)]
    action: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct JobNode {
    #[serde(rename = "@id")]
    id: Option<String>,
    #[serde(rename = "@archive_md5")]
    archive_md5: Option<String>,
    #[serde(rename = "@path")]
    path: Option<String>,
    #[serde(rename = "@revision")]
    revision: Option<String>,
    #[serde(rename = "@use_gpu")]
    use_gpu: Option<String>,
    #[serde(rename = "@frame")]
    frame: Option<String>,
    #[serde(rename = "@extras", default)]
    extras: Option<String>,
    #[serde(rename = "@name", default)]
    name: Option<String>,
    #[serde(rename = "@password", default)]
    password: Option<String>,
    #[serde(rename = "@validation_url", default)]
    validation_url: Option<String>,
    #[serde(default)]
    renderer: Option<RendererNode>,
}

#[derive(Debug, Default, Deserialize)]
struct RendererNode {
    #[serde(rename = "@md5")]
    md5: Option<String>,
    #[serde(rename = "@commandline")]
    commandline: Option<String>,
}

/// Parsed job request, before outcome classification.
#[derive(Debug, Clone)]
pub struct JobRequestResponse {
    pub status: ServerCode,
    pub frames_remaining: Option<u64>,
    /// Cached archives the coordinator wants gone
    pub evict: Vec<String>,
    /// Present when the status is OK; `Err` when a required field is missing
    pub job: Option<Result<Job, String>>,
}

pub fn parse_job_request(body: &str) -> ProtocolResult<JobRequestResponse> {
    let doc: JobRequestDoc = quick_xml::de::from_str(body)?;
    let status = ServerCode::from_status(doc.status);

    let evict = doc
        .files
        .into_iter()
        .filter(|file| file.action.as_deref() == Some("delete"))
        .map(|file| file.md5)
        .collect();

    let job = match status {
        ServerCode::Ok => Some(
            doc.job
                .ok_or(ProtocolError::MissingField("job"))
                .and_then(JobNode::into_job)
                .map_err(|e| e.to_string()),
        ),
        _ => None,
    };

    Ok(JobRequestResponse {
        status,
        frames_remaining: doc.frames.and_then(|f| f.remaining),
        evict,
        job,
    })
}

fn required(value: Option<String>, field: &'static str) -> ProtocolResult<String> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(ProtocolError::MissingField(field))
}

fn parse_flag(value: &str, field: &'static str) -> ProtocolResult<bool> {
    match value {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(ProtocolError::InvalidField {
            field,
            value: other.to_string(),
        }),
    }
}

impl JobNode {
    fn into_job(self) -> ProtocolResult<Job> {
        let id = required(self.id, "job.id")?;
        let scene_md5 = required(self.archive_md5, "job.archive_md5")?;
        let path = required(self.path, "job.path")?;
        let revision = required(self.revision, "job.revision")?;
        let use_gpu = parse_flag(&required(self.use_gpu, "job.use_gpu")?, "job.use_gpu")?;
        let frame = required(self.frame, "job.frame")?;
        let frame_number = frame.parse().map_err(|_| ProtocolError::InvalidField {
            field: "job.frame",
            value: frame.clone(),
        })?;

        let renderer = self.renderer.ok_or(ProtocolError::MissingField("renderer"))?;
        let renderer_md5 = required(renderer.md5, "renderer.md5")?;
        let renderer_command = required(renderer.commandline, "renderer.commandline")?;

        Ok(Job {
            id: JobId::from_string(id),
            frame_number,
            scene_md5,
            renderer_md5,
            path,
            renderer_command,
            use_gpu,
            extras: self.extras.unwrap_or_default(),
            revision,
            name: self.name.filter(|s| !s.is_empty()),
            archive_password: self.password.filter(|s| !s.is_empty()),
            validation_url: self.validation_url.filter(|s| !s.is_empty()),
            output_image_path: None,
            process: RenderProcessHandle::default(),
        })
    }
}
