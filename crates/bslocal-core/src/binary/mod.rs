//! Binary management for the BrowserStackLocal executable
//!
//! This module resolves the release target of the host, downloads and
//! extracts the matching archive, and keeps a metadata sidecar next to the
//! executable so later invocations can reuse it without touching the network.

use sha2::Digest;

pub mod binary_manager;
pub mod metadata;
pub mod platform;

pub use binary_manager::BinaryManager;
pub use metadata::BinaryMetadata;
pub use platform::PlatformTarget;

use std::path::{Path, PathBuf};

/// File name of the metadata sidecar inside a binary directory
pub const METADATA_FILE_NAME: &str = "binary-metadata.json";

/// Flag that makes the binary print its version and exit
pub const VERSION_FLAG: &str = "--version";

/// Result of binary acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryAcquisitionResult {
    /// Existing binary matched its metadata and was reused
    Cached(PathBuf),
    /// Binary was downloaded, extracted and recorded
    Downloaded(PathBuf),
}

impl BinaryAcquisitionResult {
    pub fn path(&self) -> &Path {
        match self {
            BinaryAcquisitionResult::Cached(path) => path,
            BinaryAcquisitionResult::Downloaded(path) => path,
        }
    }

    pub fn was_cached(&self) -> bool {
        matches!(self, BinaryAcquisitionResult::Cached(_))
    }

    pub fn was_downloaded(&self) -> bool {
        matches!(self, BinaryAcquisitionResult::Downloaded(_))
    }

    pub fn into_path(self) -> PathBuf {
        match self {
            BinaryAcquisitionResult::Cached(path) => path,
            BinaryAcquisitionResult::Downloaded(path) => path,
        }
    }
}

/// Error types for binary management
#[derive(Debug, thiserror::Error)]
pub enum BinaryError {
    #[error("Unsupported platform: {platform} {architecture}")]
    UnsupportedPlatform {
        platform: String,
        architecture: String,
    },

    #[error("Failed to download binary archive '{archive_key}': {source}")]
    Download {
        archive_key: String,
        source: anyhow::Error,
    },

    #[error("Failed to read binary archive: {source}")]
    Archive { source: zip::result::ZipError },

    #[error("Binary archive does not contain '{entry}'")]
    MissingEntry { entry: String },

    #[error("Failed to write binary to {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to set executable permission on {path}: {source}")]
    Permission {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to read version of binary at {path}: {reason}")]
    VersionProbe { path: PathBuf, reason: String },

    #[error("Failed to persist binary metadata at {path}: {source}")]
    Metadata {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Check if the file exists and carries an executable bit
pub fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0 && std::fs::File::open(path).is_ok()
    }

    #[cfg(not(unix))]
    {
        true
    }
}

/// Make the binary executable (Unix only)
pub fn make_executable(path: &Path) -> Result<(), BinaryError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let mut perms = std::fs::metadata(path)
            .map_err(|source| BinaryError::Permission {
                path: path.to_path_buf(),
                source,
            })?
            .permissions();
        perms.set_mode(perms.mode() | 0o755);
        std::fs::set_permissions(path, perms).map_err(|source| BinaryError::Permission {
            path: path.to_path_buf(),
            source,
        })?;
    }

    #[cfg(not(unix))]
    let _ = path;

    Ok(())
}

/// SHA-256 fingerprint of archive bytes, used when the remote sends no cache token
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Extract the version token from `--version` output.
///
/// Accepts "BrowserStackLocal version 8.6" as well as a bare "8.6".
pub fn parse_version_output(output: &str) -> Option<String> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let tokens: Vec<&str> = line.split_whitespace().collect();

    if let Some(idx) = tokens.iter().position(|t| t.eq_ignore_ascii_case("version")) {
        if let Some(version) = tokens.get(idx + 1) {
            return Some(version.trim_start_matches('v').to_string());
        }
    }

    tokens
        .last()
        .map(|t| t.trim_start_matches('v').to_string())
}
