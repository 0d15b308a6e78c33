//! PTY Host: spawn/write/resize/kill child processes bound to a
//! pseudo-terminal, forwarding raw bytes to the Output Processor.
//!
//! Grounded on `tui.rs`'s `PtyPane::new`/`resize` (portable_pty + reader-task wiring)
//! and `runner.rs::spawn_agent` (env/cwd conventions), generalized from "PTY feeding a
//! vt100 screen for a TUI pane" to "PTY feeding a byte channel for the output processor".

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub const MIN_COLS: u16 = 40;
pub const MIN_ROWS: u16 = 10;
const CLAUDECODE_ENV: &str = "CLAUDECODE";

#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("failed to spawn tool {tool_id}: {cause}")]
    SpawnFailed { tool_id: String, cause: String },
    #[error("pty io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub enum PtyEvent {
    Data(Vec<u8>),
    Exited { code: Option<i32> },
}

/// A live child process attached to a PTY.
pub struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn portable_pty::ChildKiller + Send + Sync>,
    exited: Arc<AtomicBool>,
}

impl PtyHandle {
    pub fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::Relaxed)
    }

    /// Propagate a resize to the child's TTY. A minimum of (40,10) is enforced.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let cols = cols.max(MIN_COLS);
        let rows = rows.max(MIN_ROWS);
        self.master
            .resize(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
            .map_err(|e| PtyError::SpawnFailed { tool_id: "resize".into(), cause: e.to_string() })?;
        Ok(())
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), PtyError> {
        self.writer.write_all(bytes)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Best-effort SIGTERM (unix) / terminate (other platforms) the child.
    pub fn kill(&mut self) -> Result<(), PtyError> {
        self.killer
            .kill()
            .map_err(|e| PtyError::SpawnFailed { tool_id: "kill".into(), cause: e.to_string() })?;
        Ok(())
    }
}

/// Spawn a tool as a child process attached to a new PTY of at least (40,10).
///
/// `CLAUDECODE` is stripped from the child's environment unconditionally (prevents a
/// nesting guard in one supported CLI). Returns the handle plus a channel the caller
/// uses to receive raw output bytes and the exit notification — the moral equivalent
/// of `onData`/`onExit` callbacks, expressed as a Rust channel.
pub fn spawn(
    tool_id: &str,
    command: &str,
    args: &[String],
    env: &[(String, String)],
    cwd: &Path,
    cols: u16,
    rows: u16,
) -> Result<(PtyHandle, mpsc::UnboundedReceiver<PtyEvent>), PtyError> {
    let cols = cols.max(MIN_COLS);
    let rows = rows.max(MIN_ROWS);

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
        .map_err(|e| PtyError::SpawnFailed { tool_id: tool_id.to_string(), cause: e.to_string() })?;

    let mut cmd = CommandBuilder::new(command);
    cmd.args(args);
    cmd.cwd(cwd);
    cmd.env_remove(CLAUDECODE_ENV);
    for (k, v) in env {
        cmd.env(k, v);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| PtyError::SpawnFailed { tool_id: tool_id.to_string(), cause: e.to_string() })?;
    drop(pair.slave);

    let killer = child.clone_killer();
    let exited = Arc::new(AtomicBool::new(false));

    let writer = pair
        .master
        .take_writer()
        .map_err(|e| PtyError::SpawnFailed { tool_id: tool_id.to_string(), cause: e.to_string() })?;

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| PtyError::SpawnFailed { tool_id: tool_id.to_string(), cause: e.to_string() })?;

    let (tx, rx) = mpsc::unbounded_channel();

    let reader_tx = tx.clone();
    let reader_exited = exited.clone();
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8192];
        loop {
            match std::io::Read::read(&mut reader, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if reader_tx.send(PtyEvent::Data(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        reader_exited.store(true, Ordering::Relaxed);
    });

    let mut child = child;
    let wait_tx = tx;
    tokio::task::spawn_blocking(move || {
        let status = child.wait();
        let code = status.ok().map(|s| s.exit_code() as i32);
        let _ = wait_tx.send(PtyEvent::Exited { code });
    });

    Ok((PtyHandle { master: pair.master, writer, killer, exited }, rx))
}
