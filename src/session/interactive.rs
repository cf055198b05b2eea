//! Interactive sessions over a PTY.
//!
//! The interactive flavor exposes raw byte I/O plus resize and kill; it
//! never normalizes messages. One reader thread owns the PTY output and
//! forwards it as [`PtyEvent`]s; the PTY process is owned by exactly one
//! session and killed on close.

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use tokio::sync::mpsc;

/// Events emitted by an interactive session.
#[derive(Debug, PartialEq, Eq)]
pub enum PtyEvent {
    /// Raw output bytes.
    Data(Vec<u8>),
    /// The process exited (code, when known).
    Exit(Option<u32>),
}

/// A PTY-backed interactive session.
pub struct InteractiveSession {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    events: mpsc::Receiver<PtyEvent>,
    killed: bool,
}

impl InteractiveSession {
    /// Spawn `command` on a fresh PTY of the given size.
    ///
    /// # Errors
    /// PTY allocation or spawn failures.
    pub fn spawn(command: CommandBuilder, cols: u16, rows: u16) -> Result<Self> {
        let pty = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| anyhow::anyhow!("allocating pty: {e}"))?;

        let child = pty
            .slave
            .spawn_command(command)
            .map_err(|e| anyhow::anyhow!("spawning pty command: {e}"))?;
        drop(pty.slave);

        let mut reader = pty
            .master
            .try_clone_reader()
            .map_err(|e| anyhow::anyhow!("cloning pty reader: {e}"))?;
        let writer = pty
            .master
            .take_writer()
            .map_err(|e| anyhow::anyhow!("taking pty writer: {e}"))?;

        let (tx, events) = mpsc::channel(64);
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.blocking_send(PtyEvent::Data(buf[..n].to_vec())).is_err() {
                            return;
                        }
                    }
                }
            }
            let _ = tx.blocking_send(PtyEvent::Exit(None));
        });

        Ok(Self {
            master: pty.master,
            writer,
            child,
            events,
            killed: false,
        })
    }

    /// Write raw bytes to the session's input.
    ///
    /// # Errors
    /// I/O failures on the PTY writer.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).context("writing to pty")?;
        self.writer.flush().context("flushing pty")?;
        Ok(())
    }

    /// Resize the terminal.
    ///
    /// # Errors
    /// PTY resize failures.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| anyhow::anyhow!("resizing pty: {e}"))
    }

    /// Next output or exit event; `None` once the reader has shut down.
    pub async fn next_event(&mut self) -> Option<PtyEvent> {
        self.events.recv().await
    }

    /// Kill the PTY process. Idempotent.
    ///
    /// # Errors
    /// Kill failures on the first call; later calls are no-ops.
    pub fn kill(&mut self) -> Result<()> {
        if self.killed {
            return Ok(());
        }
        self.killed = true;
        self.child.kill().context("killing pty child")?;
        Ok(())
    }
}

impl Drop for InteractiveSession {
    fn drop(&mut self) {
        let _ = self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pty_round_trips_bytes_and_exits() {
        let mut cmd = CommandBuilder::new("cat");
        cmd.cwd(std::env::temp_dir());
        let mut session = InteractiveSession::spawn(cmd, 80, 24).expect("spawn cat");

        session.write(b"ping\n").expect("write");
        let mut seen = Vec::new();
        while let Some(event) = session.next_event().await {
            match event {
                PtyEvent::Data(bytes) => {
                    seen.extend_from_slice(&bytes);
                    if seen.windows(4).any(|w| w == b"ping") {
                        break;
                    }
                }
                PtyEvent::Exit(_) => break,
            }
        }
        assert!(seen.windows(4).any(|w| w == b"ping"));

        session.kill().expect("kill");
        session.kill().expect("kill is idempotent");
    }
}
