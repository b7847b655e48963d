//! Content-addressed cache of downloaded archives.
//!
//! Archives are stored as `<cache_dir>/<md5>.zip` and extracted next to the
//! render outputs as `<work_dir>/<md5>/`. A cached file is trusted by name;
//! a fresh download is trusted once its MD5 matches.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use farmhand_models::ErrorKind;
use farmhand_protocol::error::is_storage_full;
use farmhand_protocol::{retry_fixed, Attempt, Coordinator, RetryPolicy};
use md5::{Digest, Md5};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::gui::Gui;

/// Minimum progress step reported to the front-end.
const PROGRESS_STEP: u64 = 1024 * 1024;

const ARCHIVE_EXTENSION: &str = "zip";

pub struct DownloadCache {
    cache_dir: PathBuf,
    work_dir: PathBuf,
    coordinator: Arc<dyn Coordinator>,
    policy: RetryPolicy,
}

impl DownloadCache {
    pub fn new(cache_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>, coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            work_dir: work_dir.into(),
            coordinator,
            policy: RetryPolicy::download(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Where the archive with this hash is cached.
    pub fn archive_path(&self, md5: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.{}", md5, ARCHIVE_EXTENSION))
    }

    /// Where the archive with this hash is extracted.
    pub fn extract_dir(&self, md5: &str) -> PathBuf {
        self.work_dir.join(md5)
    }

    /// Make sure `local_path` holds the file with `expected_md5`.
    ///
    /// An existing file is returned as is. Otherwise the file is downloaded
    /// from `url` and verified, starting over on mismatch or transfer failure.
    pub async fn fetch(&self, local_path: &Path, expected_md5: &str, url: &str, gui: &dyn Gui) -> Result<(), ErrorKind> {
        if tokio::fs::try_exists(local_path).await.unwrap_or(false) {
            debug!(path = %local_path.display(), "Archive already cached");
            return Ok(());
        }

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                warn!(path = %parent.display(), "Cannot create cache directory: {}", e);
                if is_storage_full(&e) {
                    ErrorKind::NoSpaceLeftOnDevice
                } else {
                    ErrorKind::CanNotCreateDirectory
                }
            })?;
        }

        let last_reported = AtomicU64::new(0);
        let progress = |done: u64, total: Option<u64>| {
            let last = last_reported.load(Ordering::Relaxed);
            let finished = total.is_some_and(|t| done >= t);
            if done >= last + PROGRESS_STEP || (finished && done != last) {
                last_reported.store(done, Ordering::Relaxed);
                gui.progress(done, total);
            }
        };

        let result = retry_fixed(&self.policy, |attempt| {
            let progress = &progress;
            let last_reported = &last_reported;
            async move {
                last_reported.store(0, Ordering::Relaxed);
                debug!(url, attempt, "Downloading archive");
                match self.coordinator.download(url, local_path, progress).await {
                    Err(ErrorKind::NoSpaceLeftOnDevice) => Attempt::Fatal(ErrorKind::NoSpaceLeftOnDevice),
                    Err(kind) => {
                        remove_quietly(local_path).await;
                        Attempt::Retry(kind)
                    }
                    Ok(()) => match md5_file(local_path).await {
                        Ok(actual) if actual.eq_ignore_ascii_case(expected_md5) => Attempt::Done(()),
                        Ok(actual) => {
                            warn!(expected = expected_md5, actual = %actual, "Downloaded archive hash mismatch");
                            remove_quietly(local_path).await;
                            Attempt::Retry(ErrorKind::DownloadFile)
                        }
                        Err(e) => {
                            warn!(path = %local_path.display(), "Cannot hash downloaded archive: {}", e);
                            remove_quietly(local_path).await;
                            Attempt::Retry(ErrorKind::DownloadFile)
                        }
                    },
                }
            }
        })
        .await;

        match result {
            Ok(()) => {
                info!(path = %local_path.display(), "Archive downloaded");
                Ok(())
            }
            Err(kind) => {
                remove_quietly(local_path).await;
                Err(match kind {
                    ErrorKind::NoSpaceLeftOnDevice => ErrorKind::NoSpaceLeftOnDevice,
                    _ => ErrorKind::DownloadFile,
                })
            }
        }
    }

    /// Hashes of the cached archives, announced with every job request.
    pub async fn manifest(&self) -> Vec<String> {
        let mut hashes = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.cache_dir).await else {
            return hashes;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(md5) = archive_hash(&entry.path()) {
                hashes.push(md5);
            }
        }
        hashes.sort();
        hashes
    }

    /// Delete an archive and its extracted tree.
    pub async fn evict(&self, md5: &str) {
        if md5.is_empty() || md5.contains(|c: char| matches!(c, '/' | '\\' | '.')) {
            warn!(md5, "Refusing to evict suspicious cache entry");
            return;
        }
        info!(md5, "Evicting cached archive");
        remove_quietly(&self.archive_path(md5)).await;
        let dir = self.extract_dir(md5);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %dir.display(), "Failed to remove extracted archive: {}", e);
            }
        }
    }

    /// Delete cached archives whose content does not match their name.
    ///
    /// Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let mut removed = 0;
        for md5 in self.manifest().await {
            let path = self.archive_path(&md5);
            match md5_file(&path).await {
                Ok(actual) if actual.eq_ignore_ascii_case(&md5) => {}
                Ok(actual) => {
                    warn!(path = %path.display(), actual = %actual, "Cached archive is corrupted, removing");
                    self.evict(&md5).await;
                    removed += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), "Cannot read cached archive, removing: {}", e);
                    self.evict(&md5).await;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(removed, "Cache sweep finished");
        }
        removed
    }
}

/// `<md5>.zip` → `<md5>`
fn archive_hash(path: &Path) -> Option<String> {
    if path.extension()?.to_str()? != ARCHIVE_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    (!stem.is_empty()).then(|| stem.to_string())
}

/// Hex MD5 of a file's content.
pub async fn md5_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), "Failed to remove file: {}", e);
        }
    }
}
