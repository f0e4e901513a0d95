//! Foreground tunnels on top of the streaming protocol

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use super::TunnelError;
use crate::process::{StreamOutput, StreamingHandle, TunnelEvent};

/// Exit code reported when a tunnel is killed after an error banner
const ERROR_KILL_CODE: i32 = 1;

/// A tunnel process kept running in the foreground
pub struct ForegroundTunnel {
    local_identifier: String,
    handle: StreamingHandle,
    created: AtomicBool,
}

impl ForegroundTunnel {
    pub fn new(local_identifier: impl Into<String>, handle: StreamingHandle) -> Self {
        Self {
            local_identifier: local_identifier.into(),
            handle,
            created: AtomicBool::new(false),
        }
    }

    pub fn local_identifier(&self) -> &str {
        &self.local_identifier
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.pid()
    }

    /// Wait until the tunnel is ready.
    ///
    /// Races the first of start, error and exit. Only the first call waits;
    /// later calls fail with [`TunnelError::AlreadyCreated`]. On an error
    /// banner the process is killed before returning.
    pub async fn create_tunnel(&self) -> Result<(), TunnelError> {
        if self.created.swap(true, Ordering::SeqCst) {
            return Err(TunnelError::AlreadyCreated);
        }

        match self.handle.next_event().await {
            Some(TunnelEvent::Start) => {
                info!(
                    local_identifier = %self.local_identifier,
                    pid = ?self.pid(),
                    "Foreground tunnel ready"
                );
                Ok(())
            }
            Some(TunnelEvent::Error { reason, raw }) => {
                warn!(
                    local_identifier = %self.local_identifier,
                    reason = %reason,
                    "Foreground tunnel failed"
                );
                self.handle.kill(ERROR_KILL_CODE).await;
                Err(TunnelError::Foreground { reason, raw })
            }
            Some(TunnelEvent::Exit { code }) => {
                let output = self.handle.wait().await;
                Err(TunnelError::ExitedEarly { code, output })
            }
            None => {
                let output = self.handle.wait().await;
                Err(TunnelError::ExitedEarly {
                    code: output.exit_code,
                    output,
                })
            }
        }
    }

    /// Next event after creation, e.g. a later error or the final exit
    pub async fn next_event(&self) -> Option<TunnelEvent> {
        self.handle.next_event().await
    }

    /// Terminate the tunnel; safe to call repeatedly
    pub async fn kill(&self, exit_code: i32) -> StreamOutput {
        self.handle.kill(exit_code).await
    }

    pub fn start_kill(&self, exit_code: i32) {
        self.handle.start_kill(exit_code);
    }

    pub async fn wait(&self) -> StreamOutput {
        self.handle.wait().await
    }
}
