//! The per-job pipeline: download, verify, extract, render.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use farmhand_models::{ErrorKind, Job};
use farmhand_protocol::error::is_storage_full;
use farmhand_protocol::{ArchiveKind, Coordinator};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::archive::{ArchiveExtractor, ZipExtractor, RENDERER_EXECUTABLE};
use crate::control::KillReason;
use crate::download::DownloadCache;
use crate::gui::Gui;
use crate::logging::JobLogger;
use crate::render::{RenderCommand, RenderParams, RenderRunner};

/// What a job run may observe from the engine.
pub struct RenderContext<'a> {
    pub gui: &'a dyn Gui,
    /// Marked seen when the job started
    pub kill: &'a watch::Receiver<Option<KillReason>>,
}

/// Turns a job into a rendered frame on disk.
#[async_trait]
pub trait JobWork: Send + Sync {
    /// Start-up housekeeping. Returns how many corrupted cache entries were dropped.
    async fn prepare(&self) -> Result<usize, ErrorKind>;

    /// Hashes of the archives available locally.
    async fn cached_archives(&self) -> Vec<String>;

    /// Drop a cached archive on the coordinator's request.
    async fn evict(&self, md5: &str);

    /// Materialize the job's archives and render it. On success
    /// `job.output_image_path` points at the rendered frame.
    async fn run(&self, job: &mut Job, ctx: &RenderContext<'_>) -> Result<(), ErrorKind>;
}

/// Job pipeline on the local machine.
pub struct LocalWork {
    coordinator: Arc<dyn Coordinator>,
    cache: DownloadCache,
    extractor: Arc<dyn ArchiveExtractor>,
    runner: RenderRunner,
    work_dir: PathBuf,
}

impl LocalWork {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        cache_dir: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        runner: RenderRunner,
    ) -> Self {
        let work_dir = work_dir.into();
        let cache = DownloadCache::new(cache_dir, work_dir.clone(), Arc::clone(&coordinator));
        Self {
            coordinator,
            cache,
            extractor: Arc::new(ZipExtractor::default()),
            runner,
            work_dir,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ArchiveExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn cache(&self) -> &DownloadCache {
        &self.cache
    }

    async fn fetch_archive(&self, kind: ArchiveKind, job: &Job, gui: &dyn Gui) -> Result<PathBuf, ErrorKind> {
        let md5 = match kind {
            ArchiveKind::Renderer => &job.renderer_md5,
            ArchiveKind::Scene => &job.scene_md5,
        };
        let url = self
            .coordinator
            .archive_url(kind, job)
            .ok_or(ErrorKind::WrongConfiguration)?;
        let archive = self.cache.archive_path(md5);
        self.cache.fetch(&archive, md5, &url, gui).await?;
        Ok(archive)
    }

    /// Delete outputs of an earlier attempt at the same frame.
    async fn remove_stale_outputs(&self, prefix: &str) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.work_dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with(prefix) {
                debug!(path = %entry.path().display(), "Removing stale output");
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    warn!(path = %entry.path().display(), "Failed to remove stale output: {}", e);
                }
            }
        }
    }
}

async fn require(path: &Path, missing: ErrorKind) -> Result<(), ErrorKind> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        Ok(())
    } else {
        warn!(path = %path.display(), "Expected file not found after extraction");
        Err(missing)
    }
}

#[async_trait]
impl JobWork for LocalWork {
    async fn prepare(&self) -> Result<usize, ErrorKind> {
        tokio::fs::create_dir_all(&self.work_dir).await.map_err(|e| {
            warn!(path = %self.work_dir.display(), "Cannot create work directory: {}", e);
            if is_storage_full(&e) {
                ErrorKind::NoSpaceLeftOnDevice
            } else {
                ErrorKind::CanNotCreateDirectory
            }
        })?;
        Ok(self.cache.sweep().await)
    }

    async fn cached_archives(&self) -> Vec<String> {
        self.cache.manifest().await
    }

    async fn evict(&self, md5: &str) {
        self.cache.evict(md5).await;
    }

    async fn run(&self, job: &mut Job, ctx: &RenderContext<'_>) -> Result<(), ErrorKind> {
        let logger = JobLogger::new(job, "render");

        ctx.gui.status("Downloading renderer");
        let renderer_archive = self.fetch_archive(ArchiveKind::Renderer, job, ctx.gui).await?;
        ctx.gui.status("Downloading scene files");
        let scene_archive = self.fetch_archive(ArchiveKind::Scene, job, ctx.gui).await?;

        ctx.gui.status("Extracting renderer");
        let renderer_dir = self.cache.extract_dir(&job.renderer_md5);
        self.extractor.extract(&renderer_archive, &renderer_dir, None).await?;

        ctx.gui.status("Extracting scene");
        let scene_dir = self.cache.extract_dir(&job.scene_md5);
        self.extractor
            .extract(&scene_archive, &scene_dir, job.archive_password.as_deref())
            .await?;

        let renderer = renderer_dir.join(RENDERER_EXECUTABLE);
        require(&renderer, ErrorKind::MissingRender).await?;
        let scene = scene_dir.join(&job.path);
        require(&scene, ErrorKind::MissingScene).await?;
        logger.log_progress("renderer and scene ready");

        let prefix = job.output_prefix();
        self.remove_stale_outputs(&prefix).await;

        let params = RenderParams {
            renderer,
            scene,
            output_prefix: self.work_dir.join(&prefix),
            frame: job.frame_number,
            cores: self.runner.cores(),
            use_gpu: job.use_gpu,
        };
        let command = RenderCommand::from_template(&job.renderer_command, &params)?;

        ctx.gui.status(&format!("Rendering frame {}", job.frame_number));
        logger.log_start(&format!("rendering with {} cores", params.cores));
        let result = self.runner.run(job, &command, &self.work_dir, ctx.kill).await;
        match &result {
            Ok(()) => logger.log_completion("frame rendered"),
            Err(kind) if kind.is_killed() => logger.log_warning(&format!("render stopped: {}", kind)),
            Err(kind) => logger.log_error(&format!("render failed: {}", kind)),
        }
        result
    }
}
