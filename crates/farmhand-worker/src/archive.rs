//! Archive extraction.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use farmhand_models::ErrorKind;
use tracing::{debug, warn};

/// Executable at the root of a renderer archive, substituted for `%RENDERER%`.
pub const RENDERER_EXECUTABLE: &str = "rend.exe";

#[async_trait]
pub trait ArchiveExtractor: Send + Sync {
    /// Extract `archive` into `dest`. An existing `dest` is taken as already extracted.
    async fn extract(&self, archive: &Path, dest: &Path, password: Option<&str>) -> Result<(), ErrorKind>;
}

/// Zip extraction with the `zip` crate.
#[derive(Debug, Clone)]
pub struct ZipExtractor {
    /// File name given executable permissions after extraction
    executable: String,
}

impl Default for ZipExtractor {
    fn default() -> Self {
        Self::new(RENDERER_EXECUTABLE)
    }
}

impl ZipExtractor {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

#[async_trait]
impl ArchiveExtractor for ZipExtractor {
    async fn extract(&self, archive: &Path, dest: &Path, password: Option<&str>) -> Result<(), ErrorKind> {
        if tokio::fs::try_exists(dest).await.unwrap_or(false) {
            debug!(path = %dest.display(), "Archive already extracted");
            return Ok(());
        }

        let archive = archive.to_path_buf();
        let dest_owned = dest.to_path_buf();
        let password = password.map(str::to_string);
        let executable = self.executable.clone();

        let result = tokio::task::spawn_blocking(move || {
            unzip(&archive, &dest_owned, password.as_deref(), &executable)
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(path = %dest.display(), "Extraction failed: {}", e);
                // A partial tree would pass for a complete one next time.
                let _ = tokio::fs::remove_dir_all(dest).await;
                Err(ErrorKind::CanNotCreateDirectory)
            }
            Err(e) => {
                warn!("Extraction task failed: {}", e);
                let _ = tokio::fs::remove_dir_all(dest).await;
                Err(ErrorKind::CanNotCreateDirectory)
            }
        }
    }
}

fn unzip(archive: &Path, dest: &Path, password: Option<&str>, executable: &str) -> io::Result<()> {
    let mut zip = zip::ZipArchive::new(File::open(archive)?).map_err(io::Error::other)?;
    std::fs::create_dir_all(dest)?;

    for index in 0..zip.len() {
        let mut entry = match password {
            Some(password) => zip.by_index_decrypt(index, password.as_bytes()),
            None => zip.by_index(index),
        }
        .map_err(io::Error::other)?;

        let Some(relative) = entry.enclosed_name() else {
            warn!(name = entry.name(), "Skipping archive entry outside of destination");
            continue;
        };
        let target: PathBuf = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let is_executable = target.file_name().is_some_and(|name| name == executable);
            let mode = match entry.unix_mode() {
                Some(mode) if is_executable => mode | 0o755,
                Some(mode) => mode,
                None if is_executable => 0o755,
                None => continue,
            };
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode & 0o7777))?;
        }
    }

    #[cfg(not(unix))]
    let _ = executable;

    Ok(())
}
