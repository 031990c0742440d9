//! Async worker client: one WebSocket, typed operations, broadcast events.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use wmux_core::{
    decode_event, encode_frame, ControlMessage, HistoryBuffer, SignalKind, WmuxError, WmuxResult,
    WorkerEvent, DEFAULT_HISTORY_BYTES,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long to wait for the worker to acknowledge the auth frame.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the outbound queue and the event fanout.
const CHANNEL_CAPACITY: usize = 256;

/// State shared between the client handle and its dispatch task.
#[derive(Debug)]
struct SharedState {
    /// Per-session scrollback mirror, fed from term_output events.
    replay: Mutex<HashMap<String, HistoryBuffer>>,
    /// Sessions dismissed locally; their late output is dropped.
    closed: Mutex<HashSet<String>>,
}

impl SharedState {
    fn new() -> Self {
        Self {
            replay: Mutex::new(HashMap::new()),
            closed: Mutex::new(HashSet::new()),
        }
    }
}

/// Handle to an authenticated worker connection.
///
/// Cloning is not supported; share the client behind an [`Arc`] instead.
#[derive(Debug)]
pub struct WorkerClient {
    outbound: mpsc::Sender<ControlMessage>,
    shutdown_tx: mpsc::Sender<()>,
    events: broadcast::Sender<WorkerEvent>,
    state: Arc<SharedState>,
    connected_rx: watch::Receiver<bool>,
    dispatch_handle: Option<JoinHandle<()>>,
}

impl WorkerClient {
    /// Connect to a worker and authenticate.
    ///
    /// The token rides in the first frame. The worker's greeting doubles as
    /// the acknowledgement; a worker that dislikes the token closes the
    /// socket instead of speaking.
    pub async fn connect(url: &str, token: &str) -> WmuxResult<Self> {
        let (mut ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| WmuxError::Transport(format!("connect to {url} failed: {e}")))?;

        let auth = ControlMessage::Auth {
            token: token.to_string(),
        };
        ws.send(Message::Text(encode_frame(&auth)?))
            .await
            .map_err(|e| WmuxError::Transport(format!("auth send failed: {e}")))?;

        match tokio::time::timeout(CONNECT_TIMEOUT, wait_for_greeting(&mut ws)).await {
            Ok(Ok(greeting)) => debug!(greeting = greeting.trim_end(), "authenticated"),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(WmuxError::Timeout),
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (events_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (connected_tx, connected_rx) = watch::channel(true);
        let state = Arc::new(SharedState::new());

        let dispatch_handle = tokio::spawn(dispatch_loop(
            ws,
            outbound_rx,
            shutdown_rx,
            events_tx.clone(),
            Arc::clone(&state),
            connected_tx,
        ));

        Ok(Self {
            outbound: outbound_tx,
            shutdown_tx,
            events: events_tx,
            state,
            connected_rx,
            dispatch_handle: Some(dispatch_handle),
        })
    }

    /// Subscribe to worker events.
    ///
    /// The fanout has no memory: subscribe before issuing operations, and
    /// rely on [`create_session`](Self::create_session) replay (surfaced as a
    /// `term_output` event) to cover anything missed before that.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// Watch the connection state; the value flips to false when the link
    /// drops for any reason.
    pub fn connection_watch(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    // ── Session operations ───────────────────────────────────────────

    /// Create a session, or re-attach to it if it already exists.
    ///
    /// Either way the worker answers with `session_created`, and with a
    /// `term_output` carrying accumulated scrollback when there is any.
    pub async fn create_session(&self, session_id: &str) -> WmuxResult<()> {
        self.send(ControlMessage::CreateSession {
            session_id: session_id.to_string(),
            cwd: None,
        })
        .await
    }

    /// Like [`create_session`](Self::create_session), with a starting
    /// directory for the shell.
    pub async fn create_session_in(&self, session_id: &str, cwd: &str) -> WmuxResult<()> {
        self.send(ControlMessage::CreateSession {
            session_id: session_id.to_string(),
            cwd: Some(cwd.to_string()),
        })
        .await
    }

    /// Send raw keystrokes to a session's terminal.
    pub async fn send_input(&self, session_id: &str, input: &str) -> WmuxResult<()> {
        self.send(ControlMessage::TermInput {
            session_id: session_id.to_string(),
            input: input.to_string(),
        })
        .await
    }

    /// Run a shell command line in a session (the worker appends the newline).
    pub async fn send_command(&self, session_id: &str, command: &str) -> WmuxResult<()> {
        self.send(ControlMessage::Command {
            session_id: session_id.to_string(),
            cmd: command.to_string(),
        })
        .await
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> WmuxResult<()> {
        self.send(ControlMessage::Resize {
            session_id: session_id.to_string(),
            cols,
            rows,
        })
        .await
    }

    pub async fn send_signal(&self, session_id: &str, signal: SignalKind) -> WmuxResult<()> {
        self.send(ControlMessage::SendSignal {
            session_id: session_id.to_string(),
            signal,
        })
        .await
    }

    /// Close a session. The local mirror forgets it immediately; the
    /// worker's `session_closed` confirms once teardown is done.
    pub async fn close_session(&self, session_id: &str) -> WmuxResult<()> {
        {
            let mut closed = self.state.closed.lock().await;
            closed.insert(session_id.to_string());
        }
        self.state.replay.lock().await.remove(session_id);
        self.send(ControlMessage::CloseSession {
            session_id: session_id.to_string(),
        })
        .await
    }

    /// Run a one-shot command outside any session. The result arrives as an
    /// `exec_result` event carrying the same `id`.
    pub async fn exec(&self, id: &str, command: &str, cwd: Option<&str>) -> WmuxResult<()> {
        self.send(ControlMessage::Exec {
            id: id.to_string(),
            command: command.to_string(),
            cwd: cwd.map(str::to_string),
        })
        .await
    }

    /// Locally mirrored scrollback for a session; empty when unknown.
    pub async fn history(&self, session_id: &str) -> String {
        match self.state.replay.lock().await.get(session_id) {
            Some(buffer) => buffer.snapshot(),
            None => String::new(),
        }
    }

    /// Close the link and wait for the dispatch task to wind down.
    pub async fn disconnect(&self) {
        if self.shutdown_tx.send(()).await.is_err() {
            return; // dispatch already gone
        }
        let mut watch = self.connected_rx.clone();
        while *watch.borrow() {
            if watch.changed().await.is_err() {
                break;
            }
        }
    }

    // ── Internal ─────────────────────────────────────────────────────

    async fn send(&self, msg: ControlMessage) -> WmuxResult<()> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| WmuxError::Transport("connection closed".into()))
    }
}

impl Drop for WorkerClient {
    fn drop(&mut self) {
        if let Some(h) = self.dispatch_handle.take() {
            h.abort();
        }
    }
}

/// Read frames until the first decodable event, which is the worker's
/// greeting. A close before that means the token was rejected.
async fn wait_for_greeting(ws: &mut WsStream) -> WmuxResult<String> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => match decode_event(&text) {
                Ok(WorkerEvent::Output { output }) => return Ok(output),
                Ok(other) => {
                    return Err(WmuxError::Protocol(format!(
                        "expected greeting, got {other:?}"
                    )))
                }
                Err(e) => return Err(e),
            },
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(WmuxError::AuthFailed(
                    "worker closed the connection during auth".into(),
                ))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(WmuxError::Transport(e.to_string())),
        }
    }
}

/// Pump the socket: control messages out, events in, cache updated on the
/// way through. Runs until either side closes or a shutdown is requested.
async fn dispatch_loop(
    ws: WsStream,
    mut outbound_rx: mpsc::Receiver<ControlMessage>,
    mut shutdown_rx: mpsc::Receiver<()>,
    events: broadcast::Sender<WorkerEvent>,
    state: Arc<SharedState>,
    connected_tx: watch::Sender<bool>,
) {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            msg = outbound_rx.recv() => {
                let Some(msg) = msg else {
                    // client handle dropped
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let frame = match encode_frame(&msg) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("failed to encode control message: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    debug!("send failed: {e}");
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => match decode_event(&text) {
                        Ok(event) => {
                            if handle_event(&state, &event).await {
                                let _ = events.send(event);
                            }
                        }
                        Err(e) => warn!("undecodable worker event: {e}"),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("worker closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("receive failed: {e}");
                        break;
                    }
                }
            }
        }
    }

    let _ = connected_tx.send(false);
    debug!("dispatch loop ended");
}

/// Mirror session lifecycle into the local cache. Returns false when the
/// event is for a locally dismissed session and should not be surfaced.
async fn handle_event(state: &SharedState, event: &WorkerEvent) -> bool {
    match event {
        WorkerEvent::SessionCreated { session_id } => {
            state.closed.lock().await.remove(session_id);
            state
                .replay
                .lock()
                .await
                .entry(session_id.clone())
                .or_insert_with(|| HistoryBuffer::new(DEFAULT_HISTORY_BYTES));
            true
        }
        WorkerEvent::SessionClosed { session_id } => {
            state.closed.lock().await.insert(session_id.clone());
            state.replay.lock().await.remove(session_id);
            true
        }
        WorkerEvent::TermOutput { session_id, output } => {
            if state.closed.lock().await.contains(session_id) {
                debug!(%session_id, "dropping output for dismissed session");
                return false;
            }
            state
                .replay
                .lock()
                .await
                .entry(session_id.clone())
                .or_insert_with(|| HistoryBuffer::new(DEFAULT_HISTORY_BYTES))
                .push_str(output);
            true
        }
        WorkerEvent::Output { .. } | WorkerEvent::ExecResult { .. } => true,
    }
}
