//! Streaming protocol for foreground tunnels
//!
//! The binary is kept running and its state is inferred from what it prints.
//! Two reader tasks accumulate stdout and stderr and scan the new text for
//! the ready banner and the error banner. Error lines are only matched once
//! complete, so a reason split across writes is reported whole. A supervisor
//! task owns the child and turns its termination into a final
//! [`TunnelEvent::Exit`] and a [`StreamOutput`].

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{display_command, ProcessError};

/// Printed once the tunnel accepts traffic
pub const READY_BANNER: &str = "You can now access your local server(s) in our remote browser";

/// Printed on fatal errors, with the reason after the colon
pub const ERROR_BANNER: &str = r"(?m)\*\*\* Error: (.*)$";

/// Time allowed for readers to drain after a natural exit
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

static READY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&regex::escape(READY_BANNER)).expect("escaped banner is a valid regex")
});

static ERROR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(ERROR_BANNER).expect("error banner is a valid regex"));

/// Pattern set and timing for a streaming launch
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Grace period between the ready banner and the `Start` event
    pub start_delay: Duration,
    pub ready_pattern: Regex,
    /// Matched against complete lines; the first capture group is the reason
    pub error_pattern: Regex,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            start_delay: Duration::ZERO,
            ready_pattern: READY_PATTERN.clone(),
            error_pattern: ERROR_PATTERN.clone(),
        }
    }
}

impl StreamOptions {
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }
}

/// Lifecycle event derived from the binary's output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    Start,
    Error { reason: String, raw: String },
    Exit { code: Option<i32> },
}

/// Everything the process printed, and how it ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOutput {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code, or the code passed to `kill`
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Copy)]
enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// Bytes read from one stream
#[derive(Default)]
struct StreamBuffer {
    bytes: Vec<u8>,
    /// End of the last complete line already scanned
    scanned: usize,
}

impl StreamBuffer {
    /// Text after the last scanned line, and the length of its complete lines.
    ///
    /// At end of stream the trailing unterminated line counts as complete.
    fn pending(&self, at_eof: bool) -> (&[u8], usize) {
        let pending = &self.bytes[self.scanned..];
        let complete = if at_eof {
            pending.len()
        } else {
            pending
                .iter()
                .rposition(|b| *b == b'\n')
                .map_or(0, |i| i + 1)
        };
        (pending, complete)
    }
}

#[derive(Default)]
struct Captured {
    stdout: StreamBuffer,
    stderr: StreamBuffer,
    started: bool,
    errored: bool,
}

impl Captured {
    fn buffer(&mut self, kind: StreamKind) -> &mut StreamBuffer {
        match kind {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        }
    }

    fn append(&mut self, kind: StreamKind, chunk: &[u8]) {
        self.buffer(kind).bytes.extend_from_slice(chunk);
    }

    /// Events newly matched in the text of `kind` read since the last scan
    fn scan(&mut self, kind: StreamKind, options: &StreamOptions) -> Vec<TunnelEvent> {
        self.scan_pending(kind, options, false)
    }

    /// Like [`Captured::scan`], once `kind` has reached end of stream
    fn finish(&mut self, kind: StreamKind, options: &StreamOptions) -> Vec<TunnelEvent> {
        self.scan_pending(kind, options, true)
    }

    fn scan_pending(
        &mut self,
        kind: StreamKind,
        options: &StreamOptions,
        at_eof: bool,
    ) -> Vec<TunnelEvent> {
        if self.started && self.errored {
            return Vec::new();
        }

        let (started, errored) = (self.started, self.errored);
        let buffer = self.buffer(kind);
        let (pending, complete) = buffer.pending(at_eof);

        // The ready banner may sit on a partial line; error lines must be whole
        let ready = !started && options.ready_pattern.is_match(&String::from_utf8_lossy(pending));
        let error = if errored || complete == 0 {
            None
        } else {
            let lines = String::from_utf8_lossy(&pending[..complete]);
            options.error_pattern.captures(&lines).map(|captures| {
                let raw = captures
                    .get(0)
                    .map(|m| m.as_str().trim_end().to_string())
                    .unwrap_or_default();
                let reason = captures
                    .get(1)
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_else(|| raw.clone());
                TunnelEvent::Error { reason, raw }
            })
        };
        buffer.scanned += complete;

        let mut events = Vec::new();
        if ready {
            self.started = true;
            events.push(TunnelEvent::Start);
        }
        if let Some(event) = error {
            self.errored = true;
            events.push(event);
        }
        events
    }

    fn output(&self, exit_code: Option<i32>) -> StreamOutput {
        StreamOutput {
            stdout: String::from_utf8_lossy(&self.stdout.bytes).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr.bytes).into_owned(),
            exit_code,
        }
    }
}

fn lock(captured: &Mutex<Captured>) -> std::sync::MutexGuard<'_, Captured> {
    match captured.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Handle to a running foreground process
pub struct StreamingHandle {
    pid: Option<u32>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<TunnelEvent>>,
    kill_tx: Mutex<Option<oneshot::Sender<i32>>>,
    done: watch::Receiver<Option<StreamOutput>>,
}

impl StreamingHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next lifecycle event; `None` once the process is gone and all events were read
    pub async fn next_event(&self) -> Option<TunnelEvent> {
        self.events.lock().await.recv().await
    }

    /// Request termination without waiting. Later calls are no-ops.
    pub fn start_kill(&self, exit_code: i32) {
        let sender = match self.kill_tx.lock() {
            Ok(mut tx) => tx.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            info!(pid = ?self.pid, exit_code, "Killing foreground process");
            let _ = sender.send(exit_code);
        }
    }

    /// Terminate the process and return its accumulated output.
    ///
    /// Idempotent: every call resolves with the same output, and a process
    /// that already exited keeps its own exit code.
    pub async fn kill(&self, exit_code: i32) -> StreamOutput {
        self.start_kill(exit_code);
        self.wait().await
    }

    /// Wait for termination, however it was triggered
    pub async fn wait(&self) -> StreamOutput {
        let mut done = self.done.clone();
        // Bound to a local so the watch guard is released before `done`
        let output = match done.wait_for(Option::is_some).await {
            Ok(output) => output.clone().unwrap_or_default(),
            Err(_) => {
                warn!(pid = ?self.pid, "Supervisor ended without publishing output");
                StreamOutput::default()
            }
        };
        output
    }

    pub fn is_finished(&self) -> bool {
        self.done.borrow().is_some()
    }
}

impl Drop for StreamingHandle {
    fn drop(&mut self) {
        // Dropping the kill sender makes the supervisor kill the child
        if !self.is_finished() {
            warn!(
                pid = ?self.pid,
                "Streaming handle dropped while process still running, killing it"
            );
        }
    }
}

/// Spawn `binary` in streaming mode.
///
/// Must be called from within a tokio runtime.
pub fn launch(
    binary: &Path,
    args: &[String],
    options: StreamOptions,
) -> Result<StreamingHandle, ProcessError> {
    let command_line = display_command(binary, args);

    let mut child = Command::new(binary)
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

    let pid = child.id();
    info!(command = %command_line, pid = ?pid, "Launched foreground process");

    let captured = Arc::new(Mutex::new(Captured::default()));
    let options = Arc::new(options);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (kill_tx, kill_rx) = oneshot::channel::<i32>();
    let (done_tx, done_rx) = watch::channel(None);

    let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(read_stream(
            stdout,
            StreamKind::Stdout,
            captured.clone(),
            options.clone(),
            events_tx.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(read_stream(
            stderr,
            StreamKind::Stderr,
            captured.clone(),
            options.clone(),
            events_tx.clone(),
        )));
    }

    tokio::spawn(async move {
        let exit_code = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => {
                    let drained = tokio::time::timeout(READER_DRAIN_TIMEOUT, async {
                        for reader in readers.iter_mut() {
                            let _ = reader.await;
                        }
                    })
                    .await;
                    if drained.is_err() {
                        debug!(pid = ?pid, "Readers still open after exit, detaching them");
                        readers.iter().for_each(JoinHandle::abort);
                    }
                    info!(pid = ?pid, code = ?status.code(), "Foreground process exited");
                    status.code()
                }
                Err(e) => {
                    readers.iter().for_each(JoinHandle::abort);
                    warn!(pid = ?pid, error = %e, "Failed to wait for foreground process");
                    let _ = events_tx.send(TunnelEvent::Error {
                        reason: e.to_string(),
                        raw: String::new(),
                    });
                    None
                }
            },
            requested = kill_rx => {
                // Detach readers before the child goes away
                readers.iter().for_each(JoinHandle::abort);
                if let Err(e) = child.kill().await {
                    warn!(pid = ?pid, error = %e, "Failed to kill foreground process");
                }
                requested.ok()
            }
        };

        let _ = events_tx.send(TunnelEvent::Exit { code: exit_code });
        let output = lock(&captured).output(exit_code);
        let _ = done_tx.send(Some(output));
    });

    Ok(StreamingHandle {
        pid,
        events: tokio::sync::Mutex::new(events_rx),
        kill_tx: Mutex::new(Some(kill_tx)),
        done: done_rx,
    })
}

async fn read_stream<R>(
    mut reader: R,
    kind: StreamKind,
    captured: Arc<Mutex<Captured>>,
    options: Arc<StreamOptions>,
    events: mpsc::UnboundedSender<TunnelEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(stream = kind.as_str(), error = %e, "Stream read failed");
                break;
            }
        };

        let matched = {
            let mut captured = lock(&captured);
            captured.append(kind, &buf[..n]);
            captured.scan(kind, &options)
        };
        dispatch(matched, kind, &options, &events);
    }

    let matched = lock(&captured).finish(kind, &options);
    dispatch(matched, kind, &options, &events);
}

fn dispatch(
    matched: Vec<TunnelEvent>,
    kind: StreamKind,
    options: &StreamOptions,
    events: &mpsc::UnboundedSender<TunnelEvent>,
) {
    for event in matched {
        match event {
            TunnelEvent::Start if !options.start_delay.is_zero() => {
                let events = events.clone();
                let delay = options.start_delay;
                debug!(
                    delay_ms = delay.as_millis() as u64,
                    "Ready banner seen, delaying start"
                );
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(TunnelEvent::Start);
                });
            }
            event => {
                debug!(stream = kind.as_str(), event = ?event, "Tunnel event");
                let _ = events.send(event);
            }
        }
    }
}
