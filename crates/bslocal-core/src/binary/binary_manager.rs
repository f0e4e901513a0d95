//! Binary manager implementation for downloading and caching the tunnel binary
//!
//! Resolution order for [`BinaryManager::ensure_binary`]:
//! 1. reuse the executable when it exists, is executable, and reports the
//!    version recorded in the metadata sidecar;
//! 2. otherwise download the archive for the host target, extract the single
//!    matching entry, mark it executable and record fresh metadata.
//!
//! Failures are surfaced as [`BinaryError`] and never retried here.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use super::{
    fingerprint, is_executable, make_executable, parse_version_output, BinaryAcquisitionResult,
    BinaryError, BinaryMetadata, PlatformTarget, VERSION_FLAG,
};
use crate::remote::{ArchiveFetch, ArchiveSource};

/// Binary manager for the BrowserStackLocal executable
pub struct BinaryManager {
    source: Arc<dyn ArchiveSource>,
    target: PlatformTarget,
    version_timeout: Duration,
}

impl BinaryManager {
    /// Create a binary manager for an explicit release target
    pub fn new(source: Arc<dyn ArchiveSource>, target: PlatformTarget) -> Self {
        Self {
            source,
            target,
            version_timeout: Duration::from_secs(30),
        }
    }

    /// Create a binary manager for the host's release target
    pub fn for_current_platform(source: Arc<dyn ArchiveSource>) -> Result<Self, BinaryError> {
        Ok(Self::new(source, PlatformTarget::current()?))
    }

    pub fn with_version_timeout(mut self, timeout: Duration) -> Self {
        self.version_timeout = timeout;
        self
    }

    pub fn target(&self) -> PlatformTarget {
        self.target
    }

    /// Expected executable path inside `target_dir`
    pub fn binary_path(&self, target_dir: &Path) -> PathBuf {
        target_dir.join(self.target.executable_name())
    }

    /// Return a usable binary under `target_dir`, downloading it when missing or stale
    pub async fn ensure_binary(
        &self,
        target_dir: &Path,
    ) -> Result<BinaryAcquisitionResult, BinaryError> {
        let binary_path = self.binary_path(target_dir);

        if let Some(metadata) = self.validate_installed(target_dir).await {
            info!(
                path = %binary_path.display(),
                version = %metadata.version,
                "Reusing cached BrowserStackLocal binary"
            );
            return Ok(BinaryAcquisitionResult::Cached(binary_path));
        }

        self.download(target_dir, None).await
    }

    /// Check the remote for a newer archive using the stored cache token.
    ///
    /// Falls back to [`ensure_binary`](Self::ensure_binary) semantics when
    /// nothing valid is installed.
    pub async fn refresh(&self, target_dir: &Path) -> Result<BinaryAcquisitionResult, BinaryError> {
        match self.validate_installed(target_dir).await {
            Some(metadata) => {
                self.download(target_dir, Some(metadata.cache_token.as_str()))
                    .await
            }
            None => self.download(target_dir, None).await,
        }
    }

    /// Version reported by the binary at `path`
    pub async fn binary_version(&self, path: &Path) -> Result<String, BinaryError> {
        probe_version(path, self.version_timeout).await
    }

    /// Installed metadata, when binary and sidecar are both present and agree
    async fn validate_installed(&self, target_dir: &Path) -> Option<BinaryMetadata> {
        let binary_path = self.binary_path(target_dir);

        let metadata = BinaryMetadata::load(target_dir).await?;
        if !is_executable(&binary_path) {
            debug!(path = %binary_path.display(), "Binary missing or not executable");
            return None;
        }

        match self.binary_version(&binary_path).await {
            Ok(version) if version == metadata.version => Some(metadata),
            Ok(version) => {
                info!(
                    installed = %version,
                    recorded = %metadata.version,
                    "Binary version does not match metadata"
                );
                None
            }
            Err(e) => {
                warn!(error = %e, "Failed to probe installed binary");
                None
            }
        }
    }

    async fn download(
        &self,
        target_dir: &Path,
        cache_token: Option<&str>,
    ) -> Result<BinaryAcquisitionResult, BinaryError> {
        let archive_key = self.target.as_str();
        let binary_path = self.binary_path(target_dir);

        info!(
            target = %self.target,
            dir = %target_dir.display(),
            "Fetching BrowserStackLocal archive"
        );

        let fetched = self
            .source
            .fetch(archive_key, cache_token)
            .await
            .map_err(|source| BinaryError::Download {
                archive_key: archive_key.to_string(),
                source,
            })?;

        let (bytes, remote_token) = match fetched {
            ArchiveFetch::Archive { bytes, cache_token } => (bytes, cache_token),
            ArchiveFetch::NotModified if cache_token.is_some() => {
                info!(path = %binary_path.display(), "Archive unchanged, keeping installed binary");
                return Ok(BinaryAcquisitionResult::Cached(binary_path));
            }
            ArchiveFetch::NotModified => {
                return Err(BinaryError::Download {
                    archive_key: archive_key.to_string(),
                    source: anyhow::anyhow!(
                        "remote answered 'not modified' to an unconditional request"
                    ),
                });
            }
        };

        let cache_token = remote_token.unwrap_or_else(|| fingerprint(&bytes));
        let contents = extract_entry(&bytes, self.target.executable_name())?;

        tokio::fs::create_dir_all(target_dir)
            .await
            .map_err(|source| BinaryError::Write {
                path: target_dir.to_path_buf(),
                source,
            })?;
        install_executable(&binary_path, &contents).await?;

        let version = self.binary_version(&binary_path).await?;
        BinaryMetadata::new(version.clone(), cache_token)
            .save(target_dir)
            .await?;

        info!(
            path = %binary_path.display(),
            version = %version,
            "Downloaded BrowserStackLocal binary"
        );
        Ok(BinaryAcquisitionResult::Downloaded(binary_path))
    }
}

/// Pull the entry named `executable_name` out of a zip archive.
///
/// Other entries are skipped; the entry may sit in a subdirectory.
pub fn extract_entry(bytes: &[u8], executable_name: &str) -> Result<Vec<u8>, BinaryError> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|source| BinaryError::Archive { source })?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|source| BinaryError::Archive { source })?;

        let matches = file
            .enclosed_name()
            .and_then(|p| p.file_name().map(|n| n == executable_name))
            .unwrap_or(false);
        if !matches || file.is_dir() {
            continue;
        }

        let mut contents = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut contents)
            .map_err(|e| BinaryError::Archive { source: e.into() })?;
        return Ok(contents);
    }

    Err(BinaryError::MissingEntry {
        entry: executable_name.to_string(),
    })
}

/// Write the executable next to its final path and rename it into place.
///
/// Renaming keeps a running daemon's image intact on platforms that refuse
/// to overwrite a busy executable.
async fn install_executable(binary_path: &Path, contents: &[u8]) -> Result<(), BinaryError> {
    let temp_path = binary_path.with_extension(format!("{}.download", uuid::Uuid::new_v4()));

    tokio::fs::write(&temp_path, contents)
        .await
        .map_err(|source| BinaryError::Write {
            path: temp_path.clone(),
            source,
        })?;

    if let Err(e) = make_executable(&temp_path) {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e);
    }

    if let Err(source) = tokio::fs::rename(&temp_path, binary_path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(BinaryError::Write {
            path: binary_path.to_path_buf(),
            source,
        });
    }

    Ok(())
}

async fn probe_version(path: &Path, timeout: Duration) -> Result<String, BinaryError> {
    let probe_error = |reason: String| BinaryError::VersionProbe {
        path: path.to_path_buf(),
        reason,
    };

    let output = tokio::time::timeout(
        timeout,
        Command::new(path)
            .arg(VERSION_FLAG)
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| probe_error(format!("timed out after {}ms", timeout.as_millis())))?
    .map_err(|e| probe_error(e.to_string()))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_version_output(&stdout)
        .ok_or_else(|| probe_error(format!("unrecognized output: {:?}", stdout.trim())))
}
