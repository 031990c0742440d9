//! Session registry: the canonical map of live sessions.
//!
//! All session lifecycle goes through here. Each live session has exactly
//! one reader task pumping PTY output into the worker event channel; the
//! registry's tombstone set keeps output that raced a close from leaking
//! to viewers, and makes teardown idempotent no matter which side (viewer
//! request or reader loop) gets there first. Readers are bound to the
//! session they were spawned with, not just its id: one that outlives a
//! close stands down instead of touching a successor registered under the
//! same id.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use wmux_core::{SignalKind, WorkerEvent};

use super::pty::{PtySession, ReaderPipe};

/// Bytes read from a PTY per iteration.
const READ_CHUNK_SIZE: usize = 1024;
/// Readiness poll timeout; bounds how stale the reader's liveness and
/// registration checks can get.
const READY_POLL_MS: libc::c_int = 100;

/// Message appended to a session's stream when its shell goes away.
const EXIT_MESSAGE: &str = "\n[Process exited]\n";

struct RegistryState {
    sessions: HashMap<String, Arc<PtySession>>,
    tombstones: HashSet<String>,
}

/// Owns every live session and the tombstones of dead ones.
pub struct SessionRegistry {
    state: RwLock<RegistryState>,
    events: broadcast::Sender<WorkerEvent>,
    history_bytes: usize,
    shell: Option<String>,
}

impl SessionRegistry {
    pub fn new(
        history_bytes: usize,
        shell: Option<String>,
        events: broadcast::Sender<WorkerEvent>,
    ) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                sessions: HashMap::new(),
                tombstones: HashSet::new(),
            }),
            events,
            history_bytes,
            shell,
        }
    }

    /// Create a session under `id`, spawning a shell and its reader task.
    /// Idempotent: an existing `id` is left untouched. Spawn failures are
    /// reported to viewers as a diagnostic line, not an error.
    pub async fn create_session(self: &Arc<Self>, id: &str, cwd: Option<PathBuf>) {
        let mut state = self.state.write().await;
        if state.sessions.contains_key(id) {
            debug!(session_id = %id, "session already exists");
            return;
        }
        match PtySession::spawn(id, cwd, self.shell.as_deref(), self.history_bytes) {
            Ok((session, pipe)) => {
                // Re-registering an id lifts its tombstone: the new session
                // must not inherit suppression from the old one.
                state.tombstones.remove(id);
                let session = Arc::new(session);
                state.sessions.insert(id.to_string(), Arc::clone(&session));
                info!(session_id = %id, "session created");
                let _ = self.events.send(WorkerEvent::SessionCreated {
                    session_id: id.to_string(),
                });
                tokio::spawn(run_session_reader(
                    Arc::clone(self),
                    id.to_string(),
                    session,
                    pipe,
                ));
            }
            Err(e) => {
                drop(state);
                warn!(session_id = %id, error = %e, "session create failed");
                let _ = self.events.send(WorkerEvent::Output {
                    output: format!("Error creating session: {e}\n"),
                });
            }
        }
    }

    /// Write raw keystrokes into a session. Unknown ids are ignored.
    pub async fn write_input(&self, id: &str, input: &str) {
        if input.is_empty() {
            return;
        }
        if let Some(session) = self.session(id).await {
            session.write(input.as_bytes());
        }
    }

    /// Run a command line in a session by appending a newline.
    pub async fn send_command(&self, id: &str, cmd: &str) {
        if cmd.is_empty() {
            return;
        }
        if let Some(session) = self.session(id).await {
            let mut line = cmd.to_string();
            line.push('\n');
            session.write(line.as_bytes());
        }
    }

    pub async fn resize(&self, id: &str, rows: u16, cols: u16) {
        if let Some(session) = self.session(id).await {
            session.resize(rows, cols);
        }
    }

    /// Deliver a signal to a session's process. Dead or unknown sessions
    /// ignore it.
    pub async fn send_signal(&self, id: &str, signal: SignalKind) {
        let session = match self.session(id).await {
            Some(session) => session,
            None => return,
        };
        if !session.is_alive() {
            return;
        }
        match signal {
            SignalKind::Interrupt => session.interrupt(),
            SignalKind::Kill => session.kill_group(),
            SignalKind::Unknown => {
                debug!(session_id = %id, "unrecognized signal ignored");
            }
        }
    }

    /// Close a session: remove it from the map, tombstone the id, tear the
    /// shell down, and announce the close. Exactly one caller wins when the
    /// viewer request races the reader loop; the loser returns quietly.
    pub async fn close_session(&self, id: &str) {
        let removed = {
            let mut state = self.state.write().await;
            let removed = state.sessions.remove(id);
            if removed.is_some() {
                state.tombstones.insert(id.to_string());
            }
            removed
        };
        let session = match removed {
            Some(session) => session,
            None => return,
        };
        session.terminate().await;
        info!(session_id = %id, "session closed");
        let _ = self.events.send(WorkerEvent::SessionClosed {
            session_id: id.to_string(),
        });
    }

    /// Teardown driven by a session's own reader once the shell is gone.
    /// No-op unless `session` is still the entry registered under `id`: a
    /// reader whose session was closed or replaced must not announce an
    /// exit, and must not tear down the replacement. The identity check,
    /// the removal, and the exit line share one critical section so a
    /// close or re-create cannot slip between them.
    async fn finish_session(&self, id: &str, session: &Arc<PtySession>) {
        {
            let mut state = self.state.write().await;
            match state.sessions.get(id) {
                Some(current) if Arc::ptr_eq(current, session) => {}
                _ => return,
            }
            state.sessions.remove(id);
            state.tombstones.insert(id.to_string());
            let _ = self.events.send(WorkerEvent::TermOutput {
                session_id: id.to_string(),
                output: EXIT_MESSAGE.to_string(),
            });
        }
        session.terminate().await;
        info!(session_id = %id, "session closed");
        let _ = self.events.send(WorkerEvent::SessionClosed {
            session_id: id.to_string(),
        });
    }

    /// Close every session, in parallel, each with its own teardown grace.
    pub async fn shutdown_all(&self) {
        let ids = self.session_ids().await;
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "closing all sessions");
        futures_util::future::join_all(ids.iter().map(|id| self.close_session(id))).await;
    }

    /// Scrollback snapshot for `id`; empty for unknown sessions.
    pub async fn history(&self, id: &str) -> String {
        match self.session(id).await {
            Some(session) => session.history_snapshot(),
            None => String::new(),
        }
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.state.read().await.sessions.keys().cloned().collect()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.state.read().await.sessions.contains_key(id)
    }

    pub async fn count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    /// Record output for a session and publish it. This is the single gate
    /// all PTY output passes through: tombstoned ids are dropped here, so
    /// output racing a close never reaches viewers. Publishing stays under
    /// the same lock as the gate, so a chunk that passed it is on the
    /// channel before any close of the id can announce.
    pub(crate) async fn emit_output(&self, id: &str, text: &str) {
        let state = self.state.read().await;
        if state.tombstones.contains(id) {
            debug!(session_id = %id, "dropping output for closed session");
            return;
        }
        if let Some(session) = state.sessions.get(id) {
            session.append_history(text);
        }
        // The send is synchronous; the lock is never held across an await.
        let _ = self.events.send(WorkerEvent::TermOutput {
            session_id: id.to_string(),
            output: text.to_string(),
        });
    }

    async fn session(&self, id: &str) -> Option<Arc<PtySession>> {
        self.state.read().await.sessions.get(id).cloned()
    }

    /// Whether `session` is still the entry registered under `id`. A close
    /// followed by a re-create puts a different session under the same id;
    /// the old one's reader must treat that as deregistration.
    async fn is_current(&self, id: &str, session: &Arc<PtySession>) -> bool {
        let state = self.state.read().await;
        state
            .sessions
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, session))
    }
}

enum ReadStep {
    Data(usize),
    Idle,
    Closed,
}

/// Wait up to [`READY_POLL_MS`] for the master to become readable, then
/// read one chunk. Blocking; runs on the blocking pool.
fn wait_and_read(poll_fd: Option<RawFd>, reader: &mut dyn Read, buf: &mut [u8]) -> ReadStep {
    if let Some(fd) = poll_fd {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, READY_POLL_MS) };
        if rc == 0 {
            return ReadStep::Idle;
        }
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return ReadStep::Idle;
            }
            return ReadStep::Closed;
        }
        // Readable, or HUP/error: read() reports which.
    }
    match reader.read(buf) {
        Ok(0) => ReadStep::Closed,
        Ok(n) => ReadStep::Data(n),
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => ReadStep::Idle,
        Err(_) => ReadStep::Closed,
    }
}

/// Per-session reader loop. Pumps PTY output into the event channel until
/// its session is deregistered or replaced, the shell exits, or the master
/// drops, then funnels teardown through `finish_session`, which ignores
/// readers that are no longer current.
async fn run_session_reader(
    registry: Arc<SessionRegistry>,
    session_id: String,
    session: Arc<PtySession>,
    mut pipe: ReaderPipe,
) {
    let poll_fd = pipe.poll_raw_fd();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        if !registry.is_current(&session_id, &session).await {
            break;
        }

        let worker = tokio::task::spawn_blocking(move || {
            let step = wait_and_read(poll_fd, pipe.reader.as_mut(), &mut buf);
            (pipe, buf, step)
        });
        let (p, b, step) = match worker.await {
            Ok(parts) => parts,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "reader task failed");
                break;
            }
        };
        pipe = p;
        buf = b;

        match step {
            ReadStep::Data(n) => {
                let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                registry.emit_output(&session_id, &text).await;
            }
            ReadStep::Idle => {}
            ReadStep::Closed => break,
        }

        if !session.is_alive() {
            break;
        }
    }

    registry.finish_session(&session_id, &session).await;
    debug!(session_id = %session_id, "reader loop done");
}
