//! Daemon command protocol
//!
//! The binary is spawned with `--daemon <op>`, performs one action, prints a
//! single JSON record and exits. Field names are not stable upstream, so all
//! leniency lives in [`DaemonResponse::from_value`]:
//!
//! - `state` wins over `status` when both are present;
//! - `message` is either a string or an object with a `message` field;
//! - `pid` may be a number or a numeric string.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{display_command, ProcessError, TunnelState};

/// Normalized result of a daemon command
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonResponse {
    pub state: Option<String>,
    pub pid: Option<u32>,
    pub message: Option<String>,
    pub raw: Value,
}

impl DaemonResponse {
    /// Normalize a parsed record; anything but a JSON object is rejected
    pub fn from_value(raw: Value) -> Option<Self> {
        let object = raw.as_object()?;

        let state = object
            .get("state")
            .and_then(Value::as_str)
            .or_else(|| object.get("status").and_then(Value::as_str))
            .map(str::to_string);

        let pid = object.get("pid").and_then(|v| match v {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        });

        let message = object.get("message").and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Object(inner) => inner
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            Value::Null => None,
            other => Some(other.to_string()),
        });

        Some(Self {
            state,
            pid,
            message,
            raw,
        })
    }

    /// Lower-cased state token, empty when absent
    pub fn state_token(&self) -> String {
        self.state.as_deref().unwrap_or_default().to_lowercase()
    }

    pub fn message_text(&self) -> &str {
        self.message.as_deref().unwrap_or_default()
    }
}

/// Parse one record from a stream of output.
///
/// The whole text is tried first, then each line from the end, so log lines
/// printed before the record do not hide it.
pub fn parse_record(text: &str) -> Option<DaemonResponse> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(response) = DaemonResponse::from_value(value) {
            return Some(response);
        }
    }

    trimmed
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| {
            serde_json::from_str::<Value>(line)
                .ok()
                .and_then(DaemonResponse::from_value)
        })
}

/// Parse stdout, falling back to stderr
pub fn parse_output(
    command: &str,
    stdout: &str,
    stderr: &str,
) -> Result<DaemonResponse, ProcessError> {
    if let Some(response) = parse_record(stdout) {
        return Ok(response);
    }
    if let Some(response) = parse_record(stderr) {
        debug!(command, "Daemon record found on stderr");
        return Ok(response);
    }

    Err(ProcessError::Unparseable {
        command: command.to_string(),
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    })
}

/// Spawn the binary, wait for it within `timeout`, and parse its record.
///
/// On timeout the child is killed and [`ProcessError::Timeout`] is returned.
/// A non-zero exit status is not an error by itself: the record decides.
pub async fn run_command(
    binary: &Path,
    args: &[String],
    timeout: Duration,
) -> Result<DaemonResponse, ProcessError> {
    let command_line = display_command(binary, args);
    info!(
        command = %command_line,
        timeout_ms = timeout.as_millis() as u64,
        "Running daemon command"
    );

    let child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            command: command_line.clone(),
            source,
        })?;

    // Dropping the wait future on timeout drops the child, which kills it
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(ProcessError::Io {
                command: command_line,
                source,
            });
        }
        Err(_) => {
            warn!(
                command = %command_line,
                timeout_ms = timeout.as_millis() as u64,
                "Daemon command timed out"
            );
            return Err(ProcessError::Timeout {
                command: command_line,
                timeout_ms: timeout.as_millis() as u64,
            });
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(
        command = %command_line,
        status = ?output.status.code(),
        stdout = %stdout.trim(),
        stderr = %stderr.trim(),
        "Daemon command finished"
    );

    parse_output(&command_line, &stdout, &stderr)
}

/// One daemon operation and how to judge its result
#[derive(Debug, Clone, Copy)]
pub struct DaemonCommand {
    /// Value passed after `--daemon`
    pub name: &'static str,
    pub initial_state: TunnelState,
    pub final_state: TunnelState,
    succeeded: fn(&str, &str) -> bool,
}

impl DaemonCommand {
    pub const START: DaemonCommand = DaemonCommand {
        name: "start",
        initial_state: TunnelState::Starting,
        final_state: TunnelState::Started,
        succeeded: start_succeeded,
    };

    pub const STOP: DaemonCommand = DaemonCommand {
        name: "stop",
        initial_state: TunnelState::Stopping,
        final_state: TunnelState::Stopped,
        succeeded: stop_succeeded,
    };

    /// Apply the success predicate to a normalized response
    pub fn is_success(&self, response: &DaemonResponse) -> bool {
        (self.succeeded)(&response.state_token(), response.message_text())
    }
}

fn start_succeeded(state: &str, _message: &str) -> bool {
    state == "connected"
}

fn stop_succeeded(state: &str, message: &str) -> bool {
    state == "success" && message.to_lowercase().contains("stopped successfully")
}
