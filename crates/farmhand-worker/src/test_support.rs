//! Scripted coordinator for unit tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use farmhand_models::{ActiveJob, ErrorKind, Job, JobId, RenderProcessHandle};
use farmhand_protocol::{
    ArchiveKind, Coordinator, ErrorReport, JobRequestOutcome, KeepAliveOutcome, ProgressFn,
};

#[derive(Debug, Clone)]
pub struct SentReport {
    pub kind: ErrorKind,
    pub job_id: Option<String>,
    pub log: String,
}

#[derive(Default)]
pub struct FakeCoordinator {
    pub validated: Mutex<Vec<String>>,
    pub validate_results: Mutex<VecDeque<Result<(), ErrorKind>>>,
    pub validate_delay: Mutex<Duration>,
    pub reports: Mutex<Vec<SentReport>>,
    pub keepalives: Mutex<Vec<(Option<ActiveJob>, bool)>>,
    pub keepalive_results: Mutex<VecDeque<Result<KeepAliveOutcome, ErrorKind>>>,
    pub keepalive_due: AtomicBool,
}

impl FakeCoordinator {
    pub fn validated(&self) -> Vec<String> {
        self.validated.lock().unwrap().clone()
    }

    pub fn reports(&self) -> Vec<SentReport> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl Coordinator for FakeCoordinator {
    async fn configure(&self) -> Result<(), ErrorKind> {
        Ok(())
    }

    async fn request_job(&self, _cached: &[String]) -> JobRequestOutcome {
        JobRequestOutcome::NoJob {
            frames_remaining: None,
            evict: Vec::new(),
        }
    }

    async fn validate_job(&self, job: &Job) -> Result<(), ErrorKind> {
        let delay = *self.validate_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = self.validate_results.lock().unwrap().pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.validated.lock().unwrap().push(job.id.to_string());
        }
        result
    }

    async fn keep_alive(&self, active: Option<&ActiveJob>, paused: bool) -> Result<KeepAliveOutcome, ErrorKind> {
        self.keepalives.lock().unwrap().push((active.cloned(), paused));
        self.keepalive_due.store(false, Ordering::SeqCst);
        self.keepalive_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(KeepAliveOutcome::Continue))
    }

    async fn send_error_report(&self, report: ErrorReport<'_>) -> Result<(), ErrorKind> {
        let log = std::fs::read_to_string(report.log_file).unwrap_or_default();
        self.reports.lock().unwrap().push(SentReport {
            kind: report.kind,
            job_id: report.job.map(|job| job.id.to_string()),
            log,
        });
        Ok(())
    }

    async fn logout(&self) -> Result<(), ErrorKind> {
        Ok(())
    }

    async fn download(&self, _url: &str, _dest: &Path, _progress: ProgressFn<'_>) -> Result<(), ErrorKind> {
        Err(ErrorKind::DownloadFile)
    }

    fn archive_url(&self, _kind: ArchiveKind, _job: &Job) -> Option<String> {
        None
    }

    fn keepalive_due(&self) -> bool {
        self.keepalive_due.load(Ordering::SeqCst)
    }
}

pub fn job(id: &str, frame: u64) -> Job {
    Job {
        id: JobId::from_string(id),
        frame_number: frame,
        scene_md5: "5d41402abc4b2a76b9719d911017c592".to_string(),
        renderer_md5: "7d793037a0760186574b0282f2f435e7".to_string(),
        path: "main.blend".to_string(),
        renderer_command: "%RENDERER% -b %SCENE% -o %OUTPUT% -f %FRAME%".to_string(),
        use_gpu: false,
        extras: String::new(),
        revision: "1".to_string(),
        name: None,
        archive_password: None,
        validation_url: None,
        output_image_path: None,
        process: RenderProcessHandle::default(),
    }
}
