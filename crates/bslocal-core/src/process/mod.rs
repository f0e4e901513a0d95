//! Process supervision for the tunnel binary
//!
//! Two protocols are supported:
//!
//! - [`daemon`]: spawn the binary, wait for it to exit, and normalize the one
//!   JSON record it prints;
//! - [`streaming`]: keep the binary running in the foreground and derive
//!   lifecycle events from its incremental output.
//!
//! [`lifecycle_manager::ShutdownHooks`] holds the cleanup callbacks that must
//! run once when the controlling process exits.

pub mod daemon;
pub mod lifecycle_manager;
pub mod streaming;

pub use daemon::{run_command, DaemonCommand, DaemonResponse};
pub use lifecycle_manager::ShutdownHooks;
pub use streaming::{launch, StreamOptions, StreamOutput, StreamingHandle, TunnelEvent};

use std::fmt;

/// Lifecycle state of a tunnel instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TunnelState {
    #[default]
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl TunnelState {
    /// `Stopped` and `Started` are the only states an operation may return in
    pub fn is_stable(&self) -> bool {
        matches!(self, TunnelState::Stopped | TunnelState::Started)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Stopped => "stopped",
            TunnelState::Starting => "starting",
            TunnelState::Started => "started",
            TunnelState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error types for process supervision
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("'{command}' timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("I/O error while running '{command}': {source}")]
    Io {
        command: String,
        source: std::io::Error,
    },

    #[error("Could not parse output of '{command}': stdout={stdout:?} stderr={stderr:?}")]
    Unparseable {
        command: String,
        stdout: String,
        stderr: String,
    },
}

impl ProcessError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProcessError::Timeout { .. })
    }
}

/// Render a command line for diagnostics, hiding the value after `--key`
pub fn display_command(binary: &std::path::Path, args: &[String]) -> String {
    let mut parts = vec![binary.display().to_string()];
    let mut hide_next = false;
    for arg in args {
        if hide_next {
            parts.push("<redacted>".to_string());
            hide_next = false;
        } else {
            hide_next = arg == "--key";
            parts.push(arg.clone());
        }
    }
    parts.join(" ")
}
