#![allow(dead_code)]

//! Shared helpers: fake tunnel binaries written as shell scripts, and an
//! in-memory archive source serving them.

use std::io::{Cursor, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bslocal_core::binary::PlatformTarget;
use bslocal_core::manager::{LocalConfig, TunnelController};
use bslocal_core::remote::{ArchiveFetch, ArchiveSource};
use bslocal_core::{BinaryManager, InstanceRegistry};

pub const TEST_KEY: &str = "test-access-key";
pub const FAKE_VERSION: &str = "8.6";

pub const START_CONNECTED: &str =
    r#"echo '{"state":"connected","pid":555,"message":"Connected"}'"#;
pub const STOP_SUCCESS: &str =
    r#"echo '{"state":"success","message":"BrowserStackLocal stopped successfully"}'"#;
pub const STOP_NOT_FOUND: &str =
    r#"echo '{"status":"error","message":{"message":"Process instance not found"}}'"#;

/// Script that appends each invocation to `<dir>/calls` and dispatches on its arguments
pub fn daemon_script(start_body: &str, stop_body: &str) -> String {
    format!(
        r#"#!/bin/sh
echo "$*" >> "$(dirname "$0")/calls"
case "$*" in
  --version) echo "BrowserStackLocal version {version}" ;;
  *"--daemon start"*) {start_body} ;;
  *"--daemon stop"*) {stop_body} ;;
  *) echo "unexpected arguments: $*" >&2; exit 2 ;;
esac
"#,
        version = FAKE_VERSION
    )
}

/// Script for foreground runs; `body` runs for anything but `--version`
pub fn foreground_script(body: &str) -> String {
    format!(
        r#"#!/bin/sh
if [ "$1" = "--version" ]; then
  echo "BrowserStackLocal version {version}"
  exit 0
fi
{body}
"#,
        version = FAKE_VERSION
    )
}

pub fn write_executable(path: &Path, contents: &str) {
    std::fs::write(path, contents).unwrap();
    let mut permissions = std::fs::metadata(path).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(path, permissions).unwrap();
}

/// Write `script` as `<dir>/BrowserStackLocal`
pub fn install_fake_binary(dir: &Path, script: &str) -> PathBuf {
    let path = dir.join("BrowserStackLocal");
    write_executable(&path, script);
    path
}

/// Invocations recorded by [`daemon_script`]
pub fn recorded_calls(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("calls"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

pub fn zip_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buffer);
        let options = zip::write::SimpleFileOptions::default();
        for (name, contents) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap();
    }
    buffer.into_inner()
}

/// Archive source serving one fixed archive and counting full downloads.
///
/// Answers "not modified" when the caller presents the current cache token.
pub struct StaticArchiveSource {
    archive: Vec<u8>,
    cache_token: Option<String>,
    downloads: AtomicUsize,
}

impl StaticArchiveSource {
    pub fn new(archive: Vec<u8>, cache_token: Option<&str>) -> Self {
        Self {
            archive,
            cache_token: cache_token.map(str::to_string),
            downloads: AtomicUsize::new(0),
        }
    }

    /// Archive holding `script` as the Linux executable
    pub fn with_script(script: &str, cache_token: Option<&str>) -> Self {
        Self::new(
            zip_with(&[
                ("README.txt", b"fake release"),
                ("BrowserStackLocal", script.as_bytes()),
            ]),
            cache_token,
        )
    }

    pub fn archive(&self) -> &[u8] {
        &self.archive
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArchiveSource for StaticArchiveSource {
    async fn fetch(&self, _archive_key: &str, cache_token: Option<&str>) -> Result<ArchiveFetch> {
        if cache_token.is_some() && cache_token == self.cache_token.as_deref() {
            return Ok(ArchiveFetch::NotModified);
        }
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(ArchiveFetch::Archive {
            bytes: self.archive.clone(),
            cache_token: self.cache_token.clone(),
        })
    }
}

pub fn binary_manager(source: Arc<StaticArchiveSource>) -> BinaryManager {
    BinaryManager::new(source, PlatformTarget::LinuxX64)
        .with_version_timeout(Duration::from_secs(5))
}

/// Controller whose binary dir and registry live in `dir`
pub fn controller(dir: &Path, source: Arc<StaticArchiveSource>) -> TunnelController {
    let config = LocalConfig::default()
        .with_binary_dir(dir)
        .with_access_key(TEST_KEY)
        .with_daemon_timeout(Duration::from_secs(10));
    let registry = InstanceRegistry::new(config.registry_file());
    TunnelController::with_parts(config, binary_manager(source), registry).unwrap()
}
