//! Durable registry of local identifiers
//!
//! The registry is a single JSON file shared by independent invocations of
//! the command-line tool:
//!
//! ```json
//! { "localIdentifiers": ["ci-1", "ci-2"], "owner": "kept verbatim" }
//! ```
//!
//! Fields other than `localIdentifiers` are preserved as-is. Every write is
//! a full rewrite through [`atomic_writer::AtomicWriter`]; there is no file
//! locking, so concurrent writers from different processes follow
//! last-writer-wins after each re-reads the file.

pub mod atomic_writer;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use atomic_writer::AtomicWriter;

/// Default registry file name inside the binary directory
pub const DEFAULT_REGISTRY_FILE_NAME: &str = "local-instances.json";

/// Contents of the registry file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    #[serde(rename = "localIdentifiers")]
    pub local_identifiers: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RegistryRecord {
    pub fn contains(&self, local_identifier: &str) -> bool {
        self.local_identifiers.iter().any(|id| id == local_identifier)
    }
}

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to read registry at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Registry at {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to write registry at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Drop repeated identifiers, keeping the first occurrence
pub fn dedupe_identifiers<I, S>(identifiers: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = HashSet::new();
    identifiers
        .into_iter()
        .map(Into::into)
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Read the registry at `path`, creating an empty one when the file is absent.
///
/// A file that exists but does not parse is an error; its contents are left
/// untouched.
pub async fn read_or_create(path: &Path) -> Result<RegistryRecord, RegistryError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            serde_json::from_str(&contents).map_err(|source| RegistryError::Malformed {
                path: path.to_path_buf(),
                source,
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "Creating empty instance registry");
            let record = RegistryRecord::default();
            write(path, &record.local_identifiers, &record.extra).await?;
            Ok(record)
        }
        Err(source) => Err(RegistryError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Replace the registry at `path` with `identifiers` (de-duplicated) and `extra`
pub async fn write(
    path: &Path,
    identifiers: &[String],
    extra: &Map<String, Value>,
) -> Result<RegistryRecord, RegistryError> {
    let record = RegistryRecord {
        local_identifiers: dedupe_identifiers(identifiers.iter().cloned()),
        extra: extra.clone(),
    };

    let json = serde_json::to_vec_pretty(&record).map_err(|e| RegistryError::Write {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })?;

    AtomicWriter::global()
        .write(path, &json)
        .await
        .map_err(|source| RegistryError::Write {
            path: path.to_path_buf(),
            source,
        })?;

    debug!(
        path = %path.display(),
        count = record.local_identifiers.len(),
        "Instance registry written"
    );
    Ok(record)
}

/// Registry bound to one file path
#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    path: PathBuf,
}

impl InstanceRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read(&self) -> Result<RegistryRecord, RegistryError> {
        read_or_create(&self.path).await
    }

    /// Identifiers in insertion order
    pub async fn list(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self.read().await?.local_identifiers)
    }

    /// Record `local_identifier` as running
    pub async fn add(&self, local_identifier: &str) -> Result<RegistryRecord, RegistryError> {
        let mut record = self.read().await?;
        record.local_identifiers.push(local_identifier.to_string());
        info!(local_identifier, "Registering tunnel instance");
        write(&self.path, &record.local_identifiers, &record.extra).await
    }

    /// Forget `local_identifier`; returns whether it was present
    pub async fn remove(&self, local_identifier: &str) -> Result<bool, RegistryError> {
        let mut record = self.read().await?;
        let before = record.local_identifiers.len();
        record.local_identifiers.retain(|id| id != local_identifier);
        let removed = record.local_identifiers.len() != before;

        if removed {
            info!(local_identifier, "Unregistering tunnel instance");
            write(&self.path, &record.local_identifiers, &record.extra).await?;
        }
        Ok(removed)
    }
}
