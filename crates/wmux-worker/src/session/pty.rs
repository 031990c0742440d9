//! PTY-backed shell session using portable-pty.
//!
//! Spawns the user's shell on a fresh pseudo-terminal and exposes write,
//! resize, signal, and teardown operations. Reading is done elsewhere: the
//! read half is split off at spawn time and handed to a per-session reader
//! task.

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};
use wmux_core::{HistoryBuffer, WmuxError, WmuxResult};

/// Terminal dimensions a fresh session starts with.
pub const INITIAL_ROWS: u16 = 30;
pub const INITIAL_COLS: u16 = 120;

/// How long a shell gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(1);
const WAIT_POLL: Duration = Duration::from_millis(50);

/// The interrupt keypress (Ctrl+C). Written to the terminal rather than
/// delivered as a signal, so the line discipline interrupts whatever is
/// in the foreground.
const INTERRUPT_BYTE: &[u8] = b"\x03";

/// Shells tried in order when `$SHELL` is unset or not usable.
const SHELL_FALLBACKS: &[&str] = &["/bin/bash", "/bin/sh", "/bin/zsh"];

/// Pick the shell to spawn. `$SHELL` wins if it points at something
/// executable, then the fallback list; `/bin/sh` no matter what when every
/// probe fails.
pub fn choose_shell<F>(env_shell: Option<&str>, is_executable: F) -> String
where
    F: Fn(&Path) -> bool,
{
    let fallbacks = SHELL_FALLBACKS.iter().copied();
    for candidate in env_shell.into_iter().chain(fallbacks) {
        if !candidate.is_empty() && is_executable(Path::new(candidate)) {
            return candidate.to_string();
        }
    }
    "/bin/sh".to_string()
}

/// Filesystem probe for [`choose_shell`]: the path names a file with an
/// execute bit set.
pub fn executable_on_disk(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Read half of a session's master side, plus the fd used for readiness
/// polling. Handed to the reader task at spawn time. The polled fd is a
/// dup owned by this pipe; teardown dropping the session's master does
/// not invalidate it.
pub struct ReaderPipe {
    pub reader: Box<dyn Read + Send>,
    pub poll_fd: Option<OwnedFd>,
}

impl ReaderPipe {
    /// Raw fd to poll for readability, when the platform exposes one.
    pub fn poll_raw_fd(&self) -> Option<RawFd> {
        self.poll_fd.as_ref().map(|fd| fd.as_raw_fd())
    }
}

/// One live PTY-backed shell session.
pub struct PtySession {
    id: String,
    /// Master side, kept for resize. `None` after teardown started.
    /// (std Mutex because MasterPty is not Sync.)
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    child: Mutex<Box<dyn portable_pty::Child + Send>>,
    history: Mutex<HistoryBuffer>,
}

impl PtySession {
    /// Open a PTY and spawn a shell on it. Returns the session plus the
    /// read half for the caller's reader loop.
    pub fn spawn(
        id: &str,
        cwd: Option<PathBuf>,
        shell_override: Option<&str>,
        history_bytes: usize,
    ) -> WmuxResult<(Self, ReaderPipe)> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows: INITIAL_ROWS,
            cols: INITIAL_COLS,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| WmuxError::Spawn(format!("failed to open PTY: {e}")))?;

        let shell = match shell_override {
            Some(shell) => shell.to_string(),
            None => choose_shell(std::env::var("SHELL").ok().as_deref(), executable_on_disk),
        };
        let cwd = cwd
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/"));

        let mut cmd = CommandBuilder::new(&shell);
        cmd.cwd(&cwd);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| WmuxError::Spawn(format!("failed to spawn {shell}: {e}")))?;
        // The child owns its slave handle now; ours would only keep the
        // terminal open after the shell exits.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| WmuxError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| WmuxError::Spawn(format!("failed to take PTY writer: {e}")))?;
        // The reader keeps polling after teardown drops the session's
        // master handle; it polls a dup with its own lifetime instead.
        let poll_fd = pair.master.as_raw_fd().and_then(|fd| {
            let duped = unsafe { libc::dup(fd) };
            if duped >= 0 {
                Some(unsafe { OwnedFd::from_raw_fd(duped) })
            } else {
                None
            }
        });

        info!(session_id = %id, shell = %shell, cwd = %cwd.display(), "shell spawned");

        let session = Self {
            id: id.to_string(),
            master: Mutex::new(Some(pair.master)),
            writer: Mutex::new(Some(writer)),
            child: Mutex::new(child),
            history: Mutex::new(HistoryBuffer::new(history_bytes)),
        };
        Ok((session, ReaderPipe { reader, poll_fd }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Write bytes into the shell's terminal. Writes racing teardown are
    /// dropped; the reader loop notices the dead session and cleans up.
    pub fn write(&self, data: &[u8]) {
        let mut guard = match self.writer.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if let Some(writer) = guard.as_mut() {
            if let Err(e) = writer.write_all(data).and_then(|()| writer.flush()) {
                debug!(session_id = %self.id, error = %e, "pty write dropped");
            }
        }
    }

    /// Resize the terminal. A no-op once teardown has started.
    pub fn resize(&self, rows: u16, cols: u16) {
        let guard = match self.master.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if let Some(master) = guard.as_ref() {
            let size = PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            };
            match master.resize(size) {
                Ok(()) => debug!(session_id = %self.id, rows, cols, "resized"),
                Err(e) => debug!(session_id = %self.id, error = %e, "resize failed"),
            }
        }
    }

    /// Whether the shell process is still running.
    pub fn is_alive(&self) -> bool {
        match self.child.lock() {
            Ok(mut child) => child.try_wait().ok().flatten().is_none(),
            Err(_) => false,
        }
    }

    /// Interrupt semantics: the Ctrl+C keypress goes through the terminal
    /// so the foreground job receives SIGINT, not the shell itself.
    pub fn interrupt(&self) {
        self.write(INTERRUPT_BYTE);
    }

    /// SIGKILL the shell's whole process group, foreground job included.
    pub fn kill_group(&self) {
        let pid = match self.pid() {
            Some(pid) => pid,
            None => return,
        };
        unsafe {
            let pgid = libc::getpgid(pid as libc::pid_t);
            if pgid > 0 {
                libc::killpg(pgid, libc::SIGKILL);
            } else {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        }
        debug!(session_id = %self.id, pid, "SIGKILL sent to process group");
    }

    /// Tear the session down: hang up the terminal, ask the shell to exit,
    /// kill it if it lingers past the grace period. Safe to call twice.
    pub async fn terminate(&self) {
        // Dropping our ends of the master delivers the hangup a closing
        // terminal would.
        if let Ok(mut writer) = self.writer.lock() {
            writer.take();
        }
        if let Ok(mut master) = self.master.lock() {
            master.take();
        }

        if !self.is_alive() {
            return;
        }
        if let Some(pid) = self.pid() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        let deadline = tokio::time::Instant::now() + TERMINATE_GRACE;
        while tokio::time::Instant::now() < deadline {
            if !self.is_alive() {
                return;
            }
            tokio::time::sleep(WAIT_POLL).await;
        }

        warn!(session_id = %self.id, "shell outlived SIGTERM grace period, killing");
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
        }
        // Give the kill a moment to land, then reap.
        tokio::time::sleep(WAIT_POLL).await;
        if let Ok(mut child) = self.child.lock() {
            let _ = child.try_wait();
        }
    }

    pub fn append_history(&self, text: &str) {
        if let Ok(mut history) = self.history.lock() {
            history.push_str(text);
        }
    }

    pub fn history_snapshot(&self) -> String {
        match self.history.lock() {
            Ok(history) => history.snapshot(),
            Err(_) => String::new(),
        }
    }

    fn pid(&self) -> Option<u32> {
        self.child.lock().ok().and_then(|child| child.process_id())
    }
}
