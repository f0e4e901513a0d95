//! Tunnel management
//!
//! Composes the binary store, the process supervisor and the instance
//! registry into the operations callers need: start, stop, version query,
//! foreground runs and registry-backed multi-instance flows.

pub mod args;
pub mod config;
pub mod foreground;
pub mod local_tunnel;
pub mod tunnel_controller;

pub use args::{build_args, build_stop_args, strip_key, LocalOptions, ProxySettings, TestingMode};
pub use config::LocalConfig;
pub use foreground::ForegroundTunnel;
pub use local_tunnel::LocalTunnel;
pub use tunnel_controller::{InstanceStatus, TunnelController};

pub use crate::process::TunnelState;

use crate::binary::BinaryError;
use crate::process::{ProcessError, StreamOutput};
use crate::registry::RegistryError;

/// Error types for tunnel operations
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Invalid local identifier {identifier:?}: {reason}")]
    InvalidIdentifier { identifier: String, reason: String },

    #[error("No access key given; pass one explicitly or set {}", config::ACCESS_KEY_ENV)]
    MissingKey,

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("'{command}' failed: {message}")]
    CommandFailed {
        command: String,
        message: String,
        raw: serde_json::Value,
    },

    #[error("Tunnel is not running: {message}")]
    NotRunning { message: String },

    #[error(transparent)]
    Binary(#[from] BinaryError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Foreground tunnel reported an error: {reason}")]
    Foreground { reason: String, raw: String },

    #[error("Foreground tunnel exited before it was ready (exit code {code:?})")]
    ExitedEarly {
        code: Option<i32>,
        output: StreamOutput,
    },

    #[error("Tunnel creation was already attempted for this foreground tunnel")]
    AlreadyCreated,

    #[error("No command given to run")]
    EmptyCommand,

    #[error("Failed to run '{command}': {source}")]
    CommandSpawn {
        command: String,
        source: std::io::Error,
    },

    #[error("'{command}' exited with code {code:?}")]
    CommandExited { command: String, code: Option<i32> },
}

impl TunnelError {
    /// True for the expected outcome of stopping an instance that is already gone
    pub fn is_not_running(&self) -> bool {
        matches!(self, TunnelError::NotRunning { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TunnelError::Process(e) if e.is_timeout())
    }
}

/// Check that `identifier` can be passed on a command line and stored in the registry
pub fn validate_identifier(identifier: &str) -> Result<(), TunnelError> {
    let invalid = |reason: &str| TunnelError::InvalidIdentifier {
        identifier: identifier.to_string(),
        reason: reason.to_string(),
    };

    if identifier.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if identifier.chars().any(char::is_whitespace) {
        return Err(invalid("must not contain whitespace"));
    }
    if identifier.chars().any(char::is_control) {
        return Err(invalid("must not contain control characters"));
    }
    Ok(())
}
