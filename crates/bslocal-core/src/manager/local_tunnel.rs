//! One named tunnel instance driven through daemon commands

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::{error, info, warn};

use super::args::{build_args, build_stop_args, strip_key};
use super::{validate_identifier, LocalOptions, TunnelError, TunnelState};
use crate::process::{display_command, run_command, DaemonCommand, DaemonResponse};

/// Message of a stop aimed at an instance the binary does not know
static NOT_RUNNING_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)process instance not found").expect("not-running pattern is a valid regex")
});

/// A tunnel addressed by its local identifier.
///
/// `pid` is set only while the daemon reported a live process; `args` holds
/// the last launch arguments without the key and is empty when stopped.
/// Operations take `&mut self`, so one instance never runs two commands at
/// once.
#[derive(Debug)]
pub struct LocalTunnel {
    local_identifier: String,
    key: String,
    binary_path: PathBuf,
    timeout: Duration,
    state: TunnelState,
    pid: Option<u32>,
    args: Vec<String>,
}

impl LocalTunnel {
    pub fn new(
        binary_path: impl Into<PathBuf>,
        key: impl Into<String>,
        local_identifier: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TunnelError> {
        let local_identifier = local_identifier.into();
        validate_identifier(&local_identifier)?;

        let key = key.into();
        if key.trim().is_empty() {
            return Err(TunnelError::MissingKey);
        }

        Ok(Self {
            local_identifier,
            key,
            binary_path: binary_path.into(),
            timeout,
            state: TunnelState::Stopped,
            pid: None,
            args: Vec::new(),
        })
    }

    pub fn local_identifier(&self) -> &str {
        &self.local_identifier
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Launch arguments without `--key <key>`
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    pub fn is_running(&self) -> bool {
        self.state == TunnelState::Started
    }

    /// Start the daemon for this identifier and return its message.
    ///
    /// Allowed from any stable state; every call spawns a new daemon.
    pub async fn start(&mut self, options: &LocalOptions) -> Result<String, TunnelError> {
        let args = build_args(
            &self.key,
            Some(DaemonCommand::START.name),
            &self.local_identifier,
            options,
        );
        let response = self.execute(DaemonCommand::START, &args).await?;

        self.pid = response.pid;
        self.args = strip_key(&args);

        let message = response_message(&response);
        info!(
            local_identifier = %self.local_identifier,
            pid = ?self.pid,
            message = %message,
            "Tunnel started"
        );
        Ok(message)
    }

    /// Stop the daemon for this identifier and return its message.
    ///
    /// An instance the binary does not know yields [`TunnelError::NotRunning`]
    /// and leaves this tunnel `Stopped` with no pid or args.
    pub async fn stop(&mut self) -> Result<String, TunnelError> {
        let args = build_stop_args(&self.key, &self.local_identifier);

        match self.execute(DaemonCommand::STOP, &args).await {
            Ok(response) => {
                self.clear();
                let message = response_message(&response);
                info!(
                    local_identifier = %self.local_identifier,
                    message = %message,
                    "Tunnel stopped"
                );
                Ok(message)
            }
            Err(TunnelError::CommandFailed { message, .. })
                if NOT_RUNNING_PATTERN.is_match(&message) =>
            {
                self.clear();
                warn!(
                    local_identifier = %self.local_identifier,
                    message = %message,
                    "Tunnel was not running"
                );
                Err(TunnelError::NotRunning { message })
            }
            Err(e) => Err(e),
        }
    }

    /// Run one daemon command through the intermediate state.
    ///
    /// Any failure restores the state held before the call.
    async fn execute(
        &mut self,
        command: DaemonCommand,
        args: &[String],
    ) -> Result<DaemonResponse, TunnelError> {
        let previous = self.state;
        self.state = command.initial_state;

        let result = run_command(&self.binary_path, args, self.timeout).await;
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.state = previous;
                error!(
                    local_identifier = %self.local_identifier,
                    command = command.name,
                    error = %e,
                    "Daemon command failed"
                );
                return Err(e.into());
            }
        };

        if command.is_success(&response) {
            self.state = command.final_state;
            return Ok(response);
        }

        self.state = previous;
        Err(TunnelError::CommandFailed {
            command: display_command(&self.binary_path, args),
            message: response_message(&response),
            raw: response.raw,
        })
    }

    fn clear(&mut self) {
        self.state = TunnelState::Stopped;
        self.pid = None;
        self.args.clear();
    }
}

/// Message to report for a response: its message, else its state
fn response_message(response: &DaemonResponse) -> String {
    response
        .message
        .clone()
        .or_else(|| response.state.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_validates_inputs() {
        let ok = LocalTunnel::new("/bin/true", "K", "ci-1", Duration::from_secs(1)).unwrap();
        assert_eq!(ok.state(), TunnelState::Stopped);
        assert_eq!(ok.pid(), None);
        assert!(ok.args().is_empty());

        let missing_key = LocalTunnel::new("/bin/true", " ", "ci-1", Duration::from_secs(1));
        assert!(matches!(missing_key, Err(TunnelError::MissingKey)));

        let bad_id = LocalTunnel::new("/bin/true", "K", "a b", Duration::from_secs(1));
        assert!(matches!(bad_id, Err(TunnelError::InvalidIdentifier { .. })));
    }

    #[test]
    fn test_not_running_pattern_is_case_insensitive() {
        assert!(NOT_RUNNING_PATTERN.is_match("Process instance not found"));
        assert!(NOT_RUNNING_PATTERN.is_match("error: PROCESS INSTANCE NOT FOUND for ci-1"));
        assert!(!NOT_RUNNING_PATTERN.is_match("instance stopped"));
    }

    #[test]
    fn test_response_message_falls_back_to_state() {
        let response = DaemonResponse {
            state: Some("connected".to_string()),
            pid: None,
            message: None,
            raw: serde_json::Value::Null,
        };
        assert_eq!(response_message(&response), "connected");
    }

    #[tokio::test]
    async fn test_spawn_failure_restores_state() {
        let mut tunnel = LocalTunnel::new(
            "/nonexistent/BrowserStackLocal",
            "K",
            "ci-1",
            Duration::from_secs(1),
        )
        .unwrap();

        let err = tunnel.start(&LocalOptions::default()).await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Process(crate::process::ProcessError::Spawn { .. })
        ));
        assert_eq!(tunnel.state(), TunnelState::Stopped);
        assert!(!err.to_string().contains(" K "));
    }
}
