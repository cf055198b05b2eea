//! Process-backed headless sessions.
//!
//! Spawns the provider executable with stream-JSON pipes, drains its stdout
//! on a background task into a bounded queue, and writes user/control
//! messages to its stdin. Transport failures become `error` events on the
//! queue rather than call-site errors.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};

use crate::session::backend::{LaunchSpec, LaunchedSession, SessionControl, SessionLauncher};
use crate::session::message::{normalize_event, AgentMessage, DeltaBuffer};
use crate::session::server::ServerPool;

/// Bound on the per-session message queue. When the consumer falls this far
/// behind, further messages are dropped and surfaced as one `error` event.
pub const QUEUE_CAPACITY: usize = 256;

/// Launches process-backed sessions, optionally holding a lease on a shared
/// provider server for the lifetime of each session.
pub struct ProcessLauncher {
    base_args: Vec<String>,
    shared_server: Option<Arc<ServerPool<Child>>>,
}

/// Flags putting an agent CLI into headless stream-JSON mode.
const STREAM_ARGS: &[&str] = &[
    "-p",
    "--output-format",
    "stream-json",
    "--input-format",
    "stream-json",
];

impl ProcessLauncher {
    /// A launcher with the standard stream flags and no shared server.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base_args: STREAM_ARGS.iter().map(|s| (*s).to_owned()).collect(),
            shared_server: None,
        }
    }

    /// Override the flags passed before the spec's extra args. Providers
    /// that speak stream-JSON by default take an empty list.
    #[must_use]
    pub fn with_base_args(mut self, base_args: Vec<String>) -> Self {
        self.base_args = base_args;
        self
    }

    /// Acquire `server` per session and release it on close.
    #[must_use]
    pub fn with_shared_server(mut self, server: Arc<ServerPool<Child>>) -> Self {
        self.shared_server = Some(server);
        self
    }

    fn build_command(&self, spec: &LaunchSpec) -> Command {
        let mut cmd = Command::new(&spec.executable);
        cmd.args(&self.base_args);
        if let Some(resume) = &spec.resume {
            cmd.args(["--resume", resume]);
        }
        cmd.args(&spec.extra_args);
        cmd.current_dir(&spec.working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionLauncher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedSession> {
        if let Some(server) = &self.shared_server {
            server.acquire().await?;
        }

        let spawned = self.build_command(spec).spawn().with_context(|| {
            format!("spawning session executable '{}'", spec.executable)
        });
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                // The lease must not leak when the spawn itself fails.
                if let Some(server) = &self.shared_server {
                    server.release().await;
                }
                return Err(e);
            }
        };

        let stdout = child
            .stdout
            .take()
            .context("session child has no stdout pipe")?;
        let stdin = child
            .stdin
            .take()
            .context("session child has no stdin pipe")?;

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(drain_stream(stdout, tx));

        let control = Arc::new(ProcessControl {
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(child),
            closed: AtomicBool::new(false),
            shared_server: self.shared_server.clone(),
        });

        if let Some(prompt) = &spec.prompt {
            control.send_message(prompt).await?;
        }

        Ok(LaunchedSession {
            control,
            messages: rx,
        })
    }
}

/// Background task: provider stdout → normalized events → bounded queue.
async fn drain_stream(stdout: tokio::process::ChildStdout, tx: mpsc::Sender<AgentMessage>) {
    let mut lines = BufReader::new(stdout).lines();
    let mut deltas = DeltaBuffer::default();
    let dropped = AtomicU64::new(0);

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                let _ = tx
                    .send(AgentMessage::Error {
                        content: format!("session stream read failed: {e}"),
                        raw: None,
                    })
                    .await;
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let messages = match serde_json::from_str::<serde_json::Value>(&line) {
            Ok(event) => normalize_event(&event, &mut deltas),
            Err(e) => vec![AgentMessage::Error {
                content: format!("unparseable session event: {e}"),
                raw: Some(serde_json::Value::String(line)),
            }],
        };

        for message in messages {
            // Report a backlog of drops once, ahead of the next message
            // that fits.
            let pending_drops = dropped.swap(0, Ordering::Relaxed);
            if pending_drops > 0 {
                let notice = AgentMessage::Error {
                    content: format!(
                        "message queue overflow: dropped {pending_drops} message(s)"
                    ),
                    raw: None,
                };
                if tx.try_send(notice).is_err() {
                    dropped.fetch_add(pending_drops, Ordering::Relaxed);
                }
            }
            match tx.try_send(message) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    }
}

struct ProcessControl {
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Child>,
    closed: AtomicBool,
    shared_server: Option<Arc<ServerPool<Child>>>,
}

#[async_trait]
impl SessionControl for ProcessControl {
    async fn send_message(&self, text: &str) -> Result<()> {
        let line = serde_json::json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{"type": "text", "text": text}],
            },
        })
        .to_string();
        self.write_line(&line).await
    }

    async fn interrupt(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let line = serde_json::json!({
            "type": "control_request",
            "request": {"subtype": "interrupt"},
        })
        .to_string();
        // An interrupt racing stream completion is fine; a broken pipe just
        // means the turn already finished.
        if let Err(e) = self.write_line(&line).await {
            tracing::debug!(error = %e, "interrupt after stream end");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stdin.lock().await.take();
        {
            let mut child = self.child.lock().await;
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "session child already gone");
            }
        }
        if let Some(server) = &self.shared_server {
            server.release().await;
        }
        Ok(())
    }
}

impl ProcessControl {
    async fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().context("session is closed")?;
        stdin
            .write_all(line.as_bytes())
            .await
            .context("writing to session stdin")?;
        stdin.write_all(b"\n").await.context("writing newline")?;
        stdin.flush().await.context("flushing session stdin")?;
        Ok(())
    }
}
