//! HTTP client for the coordinator.
//!
//! - Session cookie kept by reqwest's cookie store
//! - Endpoint table filled by the configuration handshake
//! - Keepalive bookkeeping (time of the last request)
//! - Observability (tracing spans, metrics)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use farmhand_models::{ActiveJob, ErrorKind, Job, ServerCode};
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Url};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{ProtocolConfig, DEFAULT_KEEPALIVE};
use crate::coordinator::{
    ArchiveKind, Coordinator, ErrorReport, JobOffer, JobRequestOutcome, KeepAliveOutcome, ProgressFn,
    ServerTrouble,
};
use crate::error::{ProtocolError, ProtocolResult};
use crate::host::HostInfo;
use crate::metrics::{record_download_bytes, record_request};
use crate::response::{parse_config, parse_job_request, parse_status};
use crate::retry::{retry_fixed, Attempt};

/// Path of the configuration handshake, relative to the base URL.
pub const CONFIG_PATH: &str = "/server/config.php";

/// Operation names used as keys of the endpoint table.
pub mod operations {
    pub const REQUEST_JOB: &str = "request-job";
    pub const VALIDATE_JOB: &str = "validate-job";
    pub const KEEPALIVE: &str = "keepmealive";
    pub const ERROR: &str = "error";
    pub const LOGOUT: &str = "logout";
    pub const DOWNLOAD_ARCHIVE: &str = "download-archive";
    pub const DOWNLOAD_BINARY: &str = "download-binary";
}

/// Coordinator client over HTTP.
pub struct ProtocolClient {
    http: Client,
    config: ProtocolConfig,
    host: HostInfo,
    endpoints: RwLock<HashMap<String, String>>,
    last_request: Mutex<Instant>,
    keepalive_interval: Mutex<Duration>,
}

impl ProtocolClient {
    pub fn new(config: ProtocolConfig) -> ProtocolResult<Self> {
        Self::with_host(config, HostInfo::detect())
    }

    /// Build with an explicit host description.
    pub fn with_host(config: ProtocolConfig, host: HostInfo) -> ProtocolResult<Self> {
        let http = Client::builder()
            .cookie_store(true)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(concat!("farmhand/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ProtocolError::Network)?;

        Ok(Self {
            http,
            config,
            host,
            endpoints: RwLock::new(HashMap::new()),
            last_request: Mutex::new(Instant::now()),
            keepalive_interval: Mutex::new(DEFAULT_KEEPALIVE),
        })
    }

    pub fn host(&self) -> &HostInfo {
        &self.host
    }

    /// Configured path for `operation`; empty when the coordinator sent none.
    pub fn endpoint_path(&self, operation: &str) -> String {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation)
            .cloned()
            .unwrap_or_default()
    }

    pub fn keepalive_interval(&self) -> Duration {
        *self.keepalive_interval.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn endpoint_url(&self, operation: &str) -> ProtocolResult<String> {
        let path = self.endpoint_path(operation);
        if path.is_empty() {
            return Err(ProtocolError::missing_endpoint(operation));
        }
        Ok(self.url_for(&path))
    }

    /// Absolute URLs are kept, paths are joined onto the base URL.
    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn touch(&self) {
        *self.last_request.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn offered_cores(&self) -> u32 {
        self.config.cores.unwrap_or(self.host.cpu_cores).max(1)
    }

    fn host_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("computemethod", self.config.compute_method.as_param().to_string()),
            ("cpu_family", self.host.cpu_family.clone()),
            ("cpu_model_name", self.host.cpu_model.clone()),
            ("cpu_cores", self.offered_cores().to_string()),
            ("os", self.host.os_name.clone()),
            ("ram", self.host.total_memory_kb.to_string()),
            ("bits", self.host.bits().to_string()),
            ("version", self.config.client_version.clone()),
            ("hostname", self.host.hostname.clone()),
        ];
        if let Some(gpu) = &self.config.gpu {
            params.push(("gpu_model", gpu.model.clone()));
            params.push(("gpu_ram", gpu.memory_mb.to_string()));
        }
        params
    }

    /// Apply the call deadline. Archive downloads and uploads go without one.
    fn bounded(&self, request: RequestBuilder) -> RequestBuilder {
        request.timeout(self.config.timeout)
    }

    /// Send a request and return the body of a successful response.
    async fn execute(&self, operation: &str, request: RequestBuilder) -> ProtocolResult<String> {
        let span = info_span!("coordinator_request", operation = %operation);

        async {
            self.touch();
            let start = Instant::now();
            let result = match request.send().await {
                Ok(response) if response.status().is_success() => response.text().await.map_err(ProtocolError::from),
                Ok(response) => Err(ProtocolError::Http(response.status().as_u16())),
                Err(e) => Err(ProtocolError::Network(e)),
            };
            let latency_ms = start.elapsed().as_millis() as f64;

            let outcome = match &result {
                Ok(_) => "ok".to_string(),
                Err(ProtocolError::Http(code)) => code.to_string(),
                Err(_) => "transport".to_string(),
            };
            record_request(operation, &outcome, latency_ms);

            if let Err(e) = &result {
                debug!("{} failed: {}", operation, e);
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn fetch_config(&self) -> ProtocolResult<()> {
        let request = self.http.get(self.url_for(CONFIG_PATH)).query(&[
            ("login", self.config.login.as_str()),
            ("password", self.config.password.as_str()),
            ("version", self.config.client_version.as_str()),
            ("os", self.host.os_name.as_str()),
            ("bits", self.host.bits()),
            ("hostname", self.host.hostname.as_str()),
        ]);

        let body = self.execute("config", self.bounded(request)).await?;
        let config = parse_config(&body)?;
        if config.status != ServerCode::Ok {
            return Err(ProtocolError::Status(config.status));
        }

        {
            let mut endpoints = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
            endpoints.clear();
            endpoints.extend(config.endpoints);
        }

        if let Some(secs) = config.keepalive_secs {
            let interval = ProtocolConfig::keepalive_from_advice(secs);
            *self.keepalive_interval.lock().unwrap_or_else(PoisonError::into_inner) = interval;
            debug!(interval_secs = interval.as_secs(), "Keepalive interval set");
        }
        Ok(())
    }

    async fn fetch_job(&self, cached_md5s: &[String]) -> ProtocolResult<crate::response::JobRequestResponse> {
        let url = self.endpoint_url(operations::REQUEST_JOB)?;
        let request = self
            .http
            .get(url)
            .query(&self.host_params())
            .form(&[("local_files", cached_md5s.join(";"))]);
        let body = self.execute(operations::REQUEST_JOB, self.bounded(request)).await?;
        parse_job_request(&body)
    }

    fn classify_job_response(response: crate::response::JobRequestResponse) -> JobRequestOutcome {
        match response.status {
            ServerCode::Ok => match response.job {
                Some(Ok(job)) => JobRequestOutcome::Job(Box::new(JobOffer {
                    job,
                    frames_remaining: response.frames_remaining,
                    evict: response.evict,
                })),
                Some(Err(reason)) => {
                    warn!("Malformed job in coordinator answer: {}", reason);
                    JobRequestOutcome::ProtocolError(ErrorKind::Unknown)
                }
                None => JobRequestOutcome::ProtocolError(ErrorKind::Unknown),
            },
            ServerCode::JobRequestNoJob => JobRequestOutcome::NoJob {
                frames_remaining: response.frames_remaining,
                evict: response.evict,
            },
            ServerCode::JobRequestErrorNoRenderingRight => JobRequestOutcome::NoRenderRight,
            ServerCode::JobRequestErrorDeadSession => JobRequestOutcome::SessionDead,
            ServerCode::JobRequestErrorSessionDisabled => JobRequestOutcome::SessionDisabled,
            ServerCode::JobRequestErrorRendererNotAvailable => JobRequestOutcome::RendererUnavailable,
            ServerCode::JobRequestErrorInternalError => JobRequestOutcome::ServerTrouble(ServerTrouble::Down),
            ServerCode::JobRequestServerInMaintenance => JobRequestOutcome::ServerTrouble(ServerTrouble::Maintenance),
            ServerCode::JobRequestServerOverloaded => JobRequestOutcome::ServerTrouble(ServerTrouble::Overloaded),
            other => JobRequestOutcome::ProtocolError(other.error_kind()),
        }
    }

    async fn upload_frame(&self, url: &str, job: &Job, output: &Path) -> ProtocolResult<ServerCode> {
        let bytes = tokio::fs::read(output).await?;
        let file_name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "frame".to_string());
        let form = Form::new().part("file", Part::bytes(bytes).file_name(file_name));

        let process = &job.process;
        let request = self
            .http
            .post(url)
            .query(&[
                ("job", job.id.to_string()),
                ("frame", job.frame_number.to_string()),
                ("rendertime", process.duration().as_secs().to_string()),
                ("memoryused", process.memory_used_kb.to_string()),
                ("cores", process.cores_used.to_string()),
                ("extras", job.extras.clone()),
            ])
            .multipart(form);

        let body = self.execute(operations::VALIDATE_JOB, request).await?;
        parse_status(&body)
    }

    async fn send_frame(&self, job: &Job, output: PathBuf) -> ProtocolResult<()> {
        let url = match &job.validation_url {
            Some(url) => self.url_for(url),
            None => self.endpoint_url(operations::VALIDATE_JOB)?,
        };

        retry_fixed(&self.config.validation_retry, |attempt| {
            let url = url.clone();
            let output = output.clone();
            async move {
                debug!(job_id = %job.id, frame = job.frame_number, attempt, "Uploading frame");
                match self.upload_frame(&url, job, &output).await {
                    Ok(ServerCode::Ok) => Attempt::Done(()),
                    Ok(code @ ServerCode::JobValidationErrorSessionDisabled)
                    | Ok(code @ ServerCode::JobValidationErrorMissingParameter) => {
                        Attempt::Fatal(ProtocolError::Status(code))
                    }
                    Ok(code) => Attempt::Retry(ProtocolError::Status(code)),
                    // Unreadable output file will not get better
                    Err(e @ ProtocolError::Io(_)) => Attempt::Fatal(e),
                    Err(e) => Attempt::Retry(e),
                }
            }
        })
        .await
    }

    async fn post_error_report(&self, report: ErrorReport<'_>) -> ProtocolResult<ServerCode> {
        let url = self.endpoint_url(operations::ERROR)?;
        let bytes = tokio::fs::read(report.log_file).await?;
        let form = Form::new().part("file", Part::bytes(bytes).file_name("log.txt"));

        let mut params = vec![("type", report.kind.code().to_string())];
        if let Some(job) = report.job {
            params.push(("job", job.id.to_string()));
            params.push(("frame", job.frame_number.to_string()));
            params.push(("render_time", job.process.duration().as_secs().to_string()));
            params.push(("memoryused", job.process.memory_used_kb.to_string()));
            params.push(("extras", job.extras.clone()));
        }

        let request = self.http.post(url).query(&params).multipart(form);
        let body = self.execute(operations::ERROR, request).await?;
        parse_status(&body)
    }

    async fn stream_to_file(&self, url: &str, dest: &Path, progress: ProgressFn<'_>) -> ProtocolResult<u64> {
        self.touch();
        let start = Instant::now();
        let response = self.http.get(self.url_for(url)).send().await?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            record_request("download", &code.to_string(), start.elapsed().as_millis() as f64);
            return Err(ProtocolError::Http(code));
        }

        let total = response.content_length();
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut done = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            done += chunk.len() as u64;
            progress(done, total);
        }
        file.flush().await?;

        record_request("download", "ok", start.elapsed().as_millis() as f64);
        record_download_bytes(done);
        Ok(done)
    }
}

#[async_trait]
impl Coordinator for ProtocolClient {
    async fn configure(&self) -> Result<(), ErrorKind> {
        match self.fetch_config().await {
            Ok(()) => {
                info!(base_url = %self.config.base_url, "Connected to coordinator");
                Ok(())
            }
            Err(e) => {
                warn!("Configuration handshake failed: {}", e);
                Err(e.kind())
            }
        }
    }

    async fn request_job(&self, cached_md5s: &[String]) -> JobRequestOutcome {
        match self.fetch_job(cached_md5s).await {
            Ok(response) => Self::classify_job_response(response),
            Err(e @ ProtocolError::MissingEndpoint(_)) => JobRequestOutcome::ProtocolError(e.kind()),
            Err(ProtocolError::Network(_)) | Err(ProtocolError::Http(_)) => {
                JobRequestOutcome::ServerTrouble(ServerTrouble::Down)
            }
            Err(ProtocolError::Xml(e)) => {
                warn!("Unreadable job request answer: {}", e);
                JobRequestOutcome::ServerTrouble(ServerTrouble::BadResponse)
            }
            Err(e) => JobRequestOutcome::ProtocolError(e.kind()),
        }
    }

    async fn validate_job(&self, job: &Job) -> Result<(), ErrorKind> {
        let output = job.output_image_path.clone().ok_or(ErrorKind::NoOutputFile)?;

        match self.send_frame(job, output.clone()).await {
            Ok(()) => {
                info!(job_id = %job.id, frame = job.frame_number, "Frame validated");
                if let Err(e) = tokio::fs::remove_file(&output).await {
                    warn!(path = %output.display(), "Failed to delete uploaded frame: {}", e);
                }
                Ok(())
            }
            Err(e) => {
                warn!(job_id = %job.id, frame = job.frame_number, "Frame validation failed: {}", e);
                Err(e.kind())
            }
        }
    }

    async fn keep_alive(&self, active: Option<&ActiveJob>, paused: bool) -> Result<KeepAliveOutcome, ErrorKind> {
        let url = self.endpoint_url(operations::KEEPALIVE).map_err(|e| e.kind())?;

        let mut params = vec![("paused", if paused { "1" } else { "0" }.to_string())];
        if let Some(active) = active {
            params.push(("job", active.id.to_string()));
            params.push(("frame", active.frame_number.to_string()));
        }

        let request = self.bounded(self.http.get(url).query(&params));
        let body = self.execute(operations::KEEPALIVE, request).await.map_err(|e| e.kind())?;

        match parse_status(&body).map_err(|e| e.kind())? {
            ServerCode::KeepMeAliveStopRendering => Ok(KeepAliveOutcome::StopRendering),
            ServerCode::Ok => Ok(KeepAliveOutcome::Continue),
            other => Err(other.error_kind()),
        }
    }

    async fn send_error_report(&self, report: ErrorReport<'_>) -> Result<(), ErrorKind> {
        match self.post_error_report(report).await {
            Ok(ServerCode::Ok) => Ok(()),
            Ok(other) => Err(other.error_kind()),
            Err(e) => Err(e.kind()),
        }
    }

    async fn logout(&self) -> Result<(), ErrorKind> {
        let url = self.endpoint_url(operations::LOGOUT).map_err(|e| e.kind())?;
        self.execute(operations::LOGOUT, self.bounded(self.http.get(url)))
            .await
            .map(|_| ())
            .map_err(|e| e.kind())
    }

    async fn download(&self, url: &str, dest: &Path, progress: ProgressFn<'_>) -> Result<(), ErrorKind> {
        match self.stream_to_file(url, dest, progress).await {
            Ok(bytes) => {
                debug!(path = %dest.display(), bytes, "Download finished");
                Ok(())
            }
            Err(e) => {
                let kind = match e.kind() {
                    ErrorKind::NoSpaceLeftOnDevice => ErrorKind::NoSpaceLeftOnDevice,
                    _ => ErrorKind::DownloadFile,
                };
                warn!(url, "Download failed: {}", e);
                Err(kind)
            }
        }
    }

    fn archive_url(&self, kind: ArchiveKind, job: &Job) -> Option<String> {
        let operation = match kind {
            ArchiveKind::Renderer => operations::DOWNLOAD_BINARY,
            ArchiveKind::Scene => operations::DOWNLOAD_ARCHIVE,
        };
        let path = self.endpoint_path(operation);
        if path.is_empty() {
            return None;
        }
        let mut url = Url::parse(&self.url_for(&path)).ok()?;
        url.query_pairs_mut().append_pair("job", job.id.as_str());
        Some(url.to_string())
    }

    fn keepalive_due(&self) -> bool {
        let last = *self.last_request.lock().unwrap_or_else(PoisonError::into_inner);
        last.elapsed() > self.keepalive_interval()
    }
}
