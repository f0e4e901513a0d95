//! Atomic file replacement
//!
//! Every write goes to a freshly named temporary file in the destination's
//! directory, is synced, and is then renamed over the destination. Readers in
//! any process see either the old or the new contents, never a partial file.
//!
//! Writes to the same destination from one process are serialized through a
//! per-path async mutex so renames land in submission order. Temporary files
//! of in-flight writes are tracked so an interrupted process can remove them
//! with [`AtomicWriter::cleanup_orphaned_temp_files`].

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

static GLOBAL_WRITER: LazyLock<AtomicWriter> = LazyLock::new(AtomicWriter::new);

/// Serialized, rename-based file writer
#[derive(Default)]
pub struct AtomicWriter {
    /// Write queue per destination path
    queues: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,

    /// Temporary files that have been created but not yet renamed
    in_flight: Arc<Mutex<HashSet<PathBuf>>>,
}

impl AtomicWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide writer shared by the registry and the binary store
    pub fn global() -> &'static AtomicWriter {
        &GLOBAL_WRITER
    }

    /// Replace `path` with `contents`
    pub async fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let queue = self.queue_for(path);
        let _turn = queue.lock().await;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp_path = temp_path_for(path);
        let guard = InFlight::track(self.in_flight.clone(), temp_path.clone());

        let result = write_then_rename(&temp_path, path, contents).await;
        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(&temp_path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %temp_path.display(), error = %e, "Failed to remove temp file");
                }
            }
        }
        drop(guard);

        debug!(path = %path.display(), ok = result.is_ok(), "Atomic write finished");
        result
    }

    /// Remove temporary files left behind by writes that never completed.
    ///
    /// Returns the number of files removed. Safe to call more than once.
    pub fn cleanup_orphaned_temp_files(&self) -> usize {
        let orphans: Vec<PathBuf> = match self.in_flight.lock() {
            Ok(mut set) => set.drain().collect(),
            Err(poisoned) => poisoned.into_inner().drain().collect(),
        };

        let mut removed = 0;
        for path in orphans {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed orphaned temp file");
                    removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to remove orphaned temp file"
                    )
                }
            }
        }
        removed
    }

    /// Number of writes currently between temp creation and rename
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn queue_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let key = path.to_path_buf();
        let mut queues = match self.queues.lock() {
            Ok(queues) => queues,
            Err(poisoned) => poisoned.into_inner(),
        };
        queues
            .entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Temp name in the destination's directory: `<name>.<uuid>.tmp`
fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "atomic".to_string());
    path.with_file_name(format!("{file_name}.{}.tmp", uuid::Uuid::new_v4()))
}

async fn write_then_rename(temp_path: &Path, path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = tokio::fs::File::create(temp_path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(temp_path, path).await
}

/// Keeps a temp path registered for orphan cleanup until dropped
struct InFlight {
    set: Arc<Mutex<HashSet<PathBuf>>>,
    path: PathBuf,
}

impl InFlight {
    fn track(set: Arc<Mutex<HashSet<PathBuf>>>, path: PathBuf) -> Self {
        if let Ok(mut paths) = set.lock() {
            paths.insert(path.clone());
        }
        Self { set, path }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut paths) = self.set.lock() {
            paths.remove(&self.path);
        }
    }
}
