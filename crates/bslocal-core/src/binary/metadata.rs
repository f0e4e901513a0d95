//! Metadata sidecar describing the installed binary

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{BinaryError, METADATA_FILE_NAME};
use crate::registry::atomic_writer::AtomicWriter;

/// Installed version and remote cache token of one binary directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryMetadata {
    pub version: String,
    pub cache_token: String,
    pub last_updated: DateTime<Utc>,
}

impl BinaryMetadata {
    pub fn new(version: impl Into<String>, cache_token: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            cache_token: cache_token.into(),
            last_updated: Utc::now(),
        }
    }

    /// Path of the sidecar inside `dir`
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(METADATA_FILE_NAME)
    }

    /// Load the sidecar from `dir`.
    ///
    /// A missing or unreadable sidecar yields `None`: the binary is then
    /// treated as stale and downloaded again.
    pub async fn load(dir: &Path) -> Option<Self> {
        let path = Self::path_in(dir);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No binary metadata found");
                return None;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Binary metadata is unreadable");
                return None;
            }
        };

        match serde_json::from_str(&contents) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Binary metadata is malformed");
                None
            }
        }
    }

    /// Persist the sidecar into `dir` with an atomic replace
    pub async fn save(&self, dir: &Path) -> Result<(), BinaryError> {
        let path = Self::path_in(dir);
        let json = serde_json::to_vec_pretty(self).map_err(|e| BinaryError::Metadata {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;

        AtomicWriter::global()
            .write(&path, &json)
            .await
            .map_err(|source| BinaryError::Metadata { path, source })
    }
}
