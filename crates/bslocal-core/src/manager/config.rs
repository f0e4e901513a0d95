//! Configuration for tunnel management

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::registry::DEFAULT_REGISTRY_FILE_NAME;

pub const ACCESS_KEY_ENV: &str = "BROWSERSTACK_ACCESS_KEY";
pub const BINARY_DIR_ENV: &str = "BROWSERSTACK_LOCAL_BINARY_DIR";
pub const IDENTIFIER_ENV: &str = "BROWSERSTACK_LOCAL_IDENTIFIER";
pub const REGISTRY_ENV: &str = "BROWSERSTACK_LOCAL_REGISTRY";
pub const DAEMON_TIMEOUT_ENV: &str = "BROWSERSTACK_LOCAL_DAEMON_TIMEOUT_SECS";

/// Configuration for the tunnel controller
#[derive(Debug, Clone, PartialEq)]
pub struct LocalConfig {
    /// Access key used when none is passed explicitly
    pub access_key: Option<String>,

    /// Directory holding the binary and its metadata sidecar
    pub binary_dir: PathBuf,

    /// Identifier used when none is passed explicitly
    pub local_identifier: Option<String>,

    /// Registry file; `<binary_dir>/local-instances.json` when unset
    pub registry_path: Option<PathBuf>,

    /// Upper bound for one daemon command
    pub daemon_timeout: Duration,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            access_key: None,
            binary_dir: default_binary_dir(),
            local_identifier: None,
            registry_path: None,
            daemon_timeout: Duration::from_secs(60),
        }
    }
}

impl LocalConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(key) = non_empty_var(ACCESS_KEY_ENV) {
            config.access_key = Some(key);
        }

        if let Some(dir) = non_empty_var(BINARY_DIR_ENV) {
            config.binary_dir = PathBuf::from(dir);
        }

        if let Some(id) = non_empty_var(IDENTIFIER_ENV) {
            config.local_identifier = Some(id);
        }

        if let Some(path) = non_empty_var(REGISTRY_ENV) {
            config.registry_path = Some(PathBuf::from(path));
        }

        if let Some(secs) = non_empty_var(DAEMON_TIMEOUT_ENV) {
            match secs.parse::<u64>() {
                Ok(secs) => config.daemon_timeout = Duration::from_secs(secs),
                Err(e) => warn!(
                    var = DAEMON_TIMEOUT_ENV,
                    value = %secs,
                    error = %e,
                    "Ignoring invalid daemon timeout"
                ),
            }
        }

        config
    }

    pub fn with_binary_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.binary_dir = dir.into();
        self
    }

    pub fn with_access_key(mut self, key: impl Into<String>) -> Self {
        self.access_key = Some(key.into());
        self
    }

    pub fn with_registry_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.registry_path = Some(path.into());
        self
    }

    pub fn with_daemon_timeout(mut self, timeout: Duration) -> Self {
        self.daemon_timeout = timeout;
        self
    }

    /// Registry file actually in use
    pub fn registry_file(&self) -> PathBuf {
        self.registry_path
            .clone()
            .unwrap_or_else(|| self.binary_dir.join(DEFAULT_REGISTRY_FILE_NAME))
    }

    pub fn binary_dir(&self) -> &Path {
        &self.binary_dir
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), super::TunnelError> {
        if self.binary_dir.as_os_str().is_empty() {
            return Err(super::TunnelError::Config {
                message: "binary_dir cannot be empty".to_string(),
            });
        }

        if self.daemon_timeout.is_zero() {
            return Err(super::TunnelError::Config {
                message: "daemon_timeout must be greater than 0".to_string(),
            });
        }

        if let Some(id) = &self.local_identifier {
            super::validate_identifier(id)?;
        }

        Ok(())
    }
}

/// `$HOME/.browserstack`, or `./.browserstack` without a home directory
fn default_binary_dir() -> PathBuf {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".browserstack")
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
