//! Control-channel server: admits viewers and bridges them to the worker.
//!
//! Each accepted connection must authenticate with the shared-secret token
//! in its very first frame. After that the connection is symmetric: control
//! messages flow in and are dispatched against the worker; every worker
//! event is fanned out to every connected viewer. Replies that belong to a
//! single viewer (history replay, exec results) bypass the fanout.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use wmux_core::{
    decode_control, encode_frame, token_fingerprint, verify_token, ControlMessage, WmuxError,
    WmuxResult, WorkerEvent,
};

use crate::config::{expand_tilde_str, WorkerConfig};
use crate::transport::{self, WsConnection};
use crate::worker::Worker;

/// How long a fresh connection gets to present its auth frame.
const AUTH_DEADLINE: Duration = Duration::from_secs(10);

/// First line a viewer sees after authenticating.
const GREETING: &str = "Connected to wmux worker (multi-tab enabled)\n";

pub struct WorkerServer {
    worker: Arc<Worker>,
    config: WorkerConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl WorkerServer {
    pub fn new(worker: Arc<Worker>, config: WorkerConfig) -> Self {
        Self {
            worker,
            config,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// Bind the listener and serve connections until the listener dies.
    pub async fn run(self: Arc<Self>) -> WmuxResult<()> {
        let addr = self.config.listen_addr()?;
        let (bound, conn_rx) = transport::start_listener(addr).await?;
        if self.config.token_generated {
            info!(token = %self.config.auth_token, "no auth token configured, generated one");
        }
        info!(
            addr = %bound,
            token = %token_fingerprint(&self.config.auth_token),
            "wmux-worker ready"
        );
        self.accept_loop(conn_rx).await
    }

    /// Tell connected viewers the worker is going away. The accept loop is
    /// stopped by dropping the `run` future; this only drains viewers.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub(crate) async fn accept_loop(
        self: Arc<Self>,
        mut conn_rx: mpsc::Receiver<WsConnection>,
    ) -> WmuxResult<()> {
        while let Some(conn) = conn_rx.recv().await {
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let remote = conn.remote_addr;
                if let Err(e) = server.handle_connection(conn).await {
                    debug!(remote = %remote, error = %e, "connection ended");
                }
            });
        }
        Ok(())
    }

    async fn handle_connection(&self, mut conn: WsConnection) -> WmuxResult<()> {
        let remote = conn.remote_addr;
        debug!(remote = %remote, "handling connection");

        // First frame must be auth, inside the deadline. Anything else
        // closes the connection with nothing revealed.
        let first = match tokio::time::timeout(
            AUTH_DEADLINE,
            transport::recv_text(&mut conn.ws_stream),
        )
        .await
        {
            Ok(frame) => frame?
                .ok_or_else(|| WmuxError::AuthFailed("closed before auth".into()))?,
            Err(_) => {
                return Err(WmuxError::AuthFailed("no auth frame within deadline".into()));
            }
        };
        match decode_control(&first) {
            Ok(ControlMessage::Auth { token }) => {
                if !verify_token(&token, &self.config.auth_token) {
                    warn!(remote = %remote, "auth rejected: token mismatch");
                    return Err(WmuxError::AuthFailed("invalid token".into()));
                }
            }
            Ok(_) => {
                warn!(remote = %remote, "auth rejected: first frame not auth");
                return Err(WmuxError::AuthFailed("expected auth frame".into()));
            }
            Err(e) => {
                warn!(remote = %remote, error = %e, "auth rejected: malformed frame");
                return Err(WmuxError::AuthFailed("malformed auth frame".into()));
            }
        }
        info!(remote = %remote, "viewer authenticated");

        // Subscribe before touching sessions so this viewer sees the
        // events its own connect triggers.
        let mut events = self.worker.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let (conn_tx, mut conn_rx) = mpsc::channel::<WorkerEvent>(64);

        let greeting = WorkerEvent::Output {
            output: GREETING.to_string(),
        };
        transport::send_text(&mut conn.ws_stream, &encode_frame(&greeting)?).await?;

        // Make sure the default tab exists. No replay here: a viewer that
        // wants scrollback asks by (re-)creating the session explicitly.
        if self.config.default_session {
            self.worker
                .create_session(&self.config.default_session_id, None)
                .await;
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(remote = %remote, "notifying viewer of shutdown");
                    let bye = WorkerEvent::Output {
                        output: "Worker shutting down\n".to_string(),
                    };
                    if let Ok(frame) = encode_frame(&bye) {
                        let _ = transport::send_text(&mut conn.ws_stream, &frame).await;
                    }
                    break;
                }

                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            let frame = encode_frame(&event)?;
                            transport::send_text(&mut conn.ws_stream, &frame).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(remote = %remote, skipped, "viewer lagging, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                Some(event) = conn_rx.recv() => {
                    let frame = encode_frame(&event)?;
                    transport::send_text(&mut conn.ws_stream, &frame).await?;
                }

                frame = transport::recv_text(&mut conn.ws_stream) => {
                    match frame {
                        Ok(Some(text)) => {
                            if let Some(reply) = self.dispatch(&text, &conn_tx).await {
                                let frame = encode_frame(&reply)?;
                                transport::send_text(&mut conn.ws_stream, &frame).await?;
                            }
                        }
                        Ok(None) => {
                            debug!(remote = %remote, "viewer disconnected");
                            break;
                        }
                        Err(e) => {
                            debug!(remote = %remote, error = %e, "viewer connection error");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle one control message. The return value, if any, is a reply
    /// for the requesting viewer alone.
    async fn dispatch(&self, text: &str, conn_tx: &mpsc::Sender<WorkerEvent>) -> Option<WorkerEvent> {
        let msg = match decode_control(text) {
            Ok(msg) => msg,
            Err(e) => {
                // Malformed traffic must not take the dispatcher down.
                debug!(error = %e, "ignoring malformed frame");
                return None;
            }
        };
        match msg {
            ControlMessage::Auth { .. } => {
                debug!("redundant auth frame ignored");
                None
            }
            ControlMessage::CreateSession { session_id, cwd } => {
                let cwd = cwd.map(|c| expand_tilde_str(&c));
                self.worker.create_session(&session_id, cwd).await;
                // Replay scrollback to the requester; everyone else already
                // watched it happen.
                let history = self.worker.history(&session_id).await;
                if history.is_empty() {
                    None
                } else {
                    Some(WorkerEvent::TermOutput {
                        session_id,
                        output: history,
                    })
                }
            }
            ControlMessage::TermInput { session_id, input } => {
                self.worker.write_input(&session_id, &input).await;
                None
            }
            ControlMessage::Command { session_id, cmd } => {
                self.worker.send_command(&session_id, &cmd).await;
                None
            }
            ControlMessage::Resize {
                session_id,
                cols,
                rows,
            } => {
                self.worker.resize(&session_id, rows, cols).await;
                None
            }
            ControlMessage::SendSignal { session_id, signal } => {
                self.worker.send_signal(&session_id, signal).await;
                None
            }
            ControlMessage::CloseSession { session_id } => {
                self.worker.close_session(&session_id).await;
                None
            }
            ControlMessage::Exec { id, command, cwd } => {
                // Runs off the connection loop so a slow command cannot
                // stall the viewer's event stream.
                let worker = Arc::clone(&self.worker);
                let conn_tx = conn_tx.clone();
                tokio::spawn(async move {
                    let result = worker.exec(&id, &command, cwd.as_deref()).await;
                    let _ = conn_tx.send(result).await;
                });
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use std::path::Path;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
    use wmux_core::decode_event;

    type TestWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const TEST_TOKEN: &str = "server-test-token";

    async fn start_server(default_session: bool) -> (Arc<WorkerServer>, SocketAddr) {
        let mut config =
            WorkerConfig::load(Some(Path::new("/nonexistent.toml")), None, Some(TEST_TOKEN))
                .unwrap();
        config.shell = Some("/bin/sh".to_string());
        config.default_session = default_session;
        let worker = Arc::new(Worker::new(&config));
        let server = Arc::new(WorkerServer::new(worker, config));
        let (addr, conn_rx) = transport::start_listener("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        tokio::spawn(Arc::clone(&server).accept_loop(conn_rx));
        (server, addr)
    }

    async fn connect(addr: SocketAddr) -> TestWs {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        ws
    }

    async fn send(ws: &mut TestWs, msg: &ControlMessage) {
        ws.send(Message::Text(encode_frame(msg).unwrap()))
            .await
            .unwrap();
    }

    async fn authed_connection(addr: SocketAddr) -> TestWs {
        let mut ws = connect(addr).await;
        send(
            &mut ws,
            &ControlMessage::Auth {
                token: TEST_TOKEN.to_string(),
            },
        )
        .await;
        ws
    }

    /// Read events until `pred` matches one, or the deadline passes.
    async fn wait_for<F>(ws: &mut TestWs, mut pred: F) -> Option<WorkerEvent>
    where
        F: FnMut(&WorkerEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while tokio::time::Instant::now() < deadline {
            let frame = tokio::time::timeout(Duration::from_millis(250), ws.next()).await;
            match frame {
                Ok(Some(Ok(Message::Text(text)))) => {
                    if let Ok(event) = decode_event(&text) {
                        if pred(&event) {
                            return Some(event);
                        }
                    }
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(_))) | Ok(None) => return None,
                Err(_) => {}
            }
        }
        None
    }

    /// Accumulate term_output for a session until it contains `needle`.
    async fn wait_for_output(ws: &mut TestWs, id: &str, needle: &str) -> String {
        let mut acc = String::new();
        wait_for(ws, |event| {
            if let WorkerEvent::TermOutput { session_id, output } = event {
                if session_id == id {
                    acc.push_str(output);
                }
            }
            acc.contains(needle)
        })
        .await;
        acc
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wrong_token_is_rejected() {
        let (_server, addr) = start_server(false).await;
        let mut ws = connect(addr).await;
        send(
            &mut ws,
            &ControlMessage::Auth {
                token: "wrong".to_string(),
            },
        )
        .await;
        // No greeting; the stream just ends.
        let got = wait_for(&mut ws, |e| matches!(e, WorkerEvent::Output { .. })).await;
        assert!(got.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn non_auth_first_frame_is_rejected() {
        let (_server, addr) = start_server(false).await;
        let mut ws = connect(addr).await;
        send(
            &mut ws,
            &ControlMessage::CreateSession {
                session_id: "t1".to_string(),
                cwd: None,
            },
        )
        .await;
        let got = wait_for(&mut ws, |e| matches!(e, WorkerEvent::Output { .. })).await;
        assert!(got.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn greets_and_creates_default_session() {
        let (_server, addr) = start_server(true).await;
        let mut ws = authed_connection(addr).await;

        let greeting = wait_for(&mut ws, |e| matches!(e, WorkerEvent::Output { .. })).await;
        match greeting {
            Some(WorkerEvent::Output { output }) => assert!(output.contains("wmux worker")),
            other => panic!("expected greeting, got {other:?}"),
        }
        let created = wait_for(&mut ws, |e| {
            matches!(e, WorkerEvent::SessionCreated { session_id } if session_id == "session-1")
        })
        .await;
        assert!(created.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn command_round_trip() {
        let (_server, addr) = start_server(false).await;
        let mut ws = authed_connection(addr).await;
        send(
            &mut ws,
            &ControlMessage::CreateSession {
                session_id: "t1".to_string(),
                cwd: None,
            },
        )
        .await;
        send(
            &mut ws,
            &ControlMessage::Command {
                session_id: "t1".to_string(),
                cmd: "echo over_the_wire".to_string(),
            },
        )
        .await;
        let out = wait_for_output(&mut ws, "t1", "over_the_wire").await;
        assert!(out.contains("over_the_wire"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_frames_do_not_kill_the_connection() {
        let (_server, addr) = start_server(false).await;
        let mut ws = authed_connection(addr).await;
        ws.send(Message::Text("this is not json".to_string()))
            .await
            .unwrap();
        ws.send(Message::Text("{\"type\":\"no_such_op\"}".to_string()))
            .await
            .unwrap();
        send(
            &mut ws,
            &ControlMessage::CreateSession {
                session_id: "t1".to_string(),
                cwd: None,
            },
        )
        .await;
        send(
            &mut ws,
            &ControlMessage::Command {
                session_id: "t1".to_string(),
                cmd: "echo still_alive".to_string(),
            },
        )
        .await;
        let out = wait_for_output(&mut ws, "t1", "still_alive").await;
        assert!(out.contains("still_alive"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reattach_replays_scrollback() {
        let (_server, addr) = start_server(false).await;

        let mut first = authed_connection(addr).await;
        send(
            &mut first,
            &ControlMessage::CreateSession {
                session_id: "t1".to_string(),
                cwd: None,
            },
        )
        .await;
        send(
            &mut first,
            &ControlMessage::Command {
                session_id: "t1".to_string(),
                cmd: "echo replay_marker".to_string(),
            },
        )
        .await;
        wait_for_output(&mut first, "t1", "replay_marker").await;
        first.close(None).await.ok();

        // A new viewer re-creating the session gets the scrollback.
        let mut second = authed_connection(addr).await;
        send(
            &mut second,
            &ControlMessage::CreateSession {
                session_id: "t1".to_string(),
                cwd: None,
            },
        )
        .await;
        let out = wait_for_output(&mut second, "t1", "replay_marker").await;
        assert!(out.contains("replay_marker"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exec_runs_and_replies() {
        let (_server, addr) = start_server(false).await;
        let mut ws = authed_connection(addr).await;
        send(
            &mut ws,
            &ControlMessage::Exec {
                id: "req-1".to_string(),
                command: "echo via_ws".to_string(),
                cwd: None,
            },
        )
        .await;
        let got = wait_for(&mut ws, |e| {
            matches!(e, WorkerEvent::ExecResult { id, .. } if id == "req-1")
        })
        .await;
        match got {
            Some(WorkerEvent::ExecResult {
                stdout, returncode, ..
            }) => {
                assert_eq!(stdout, "via_ws\n");
                assert_eq!(returncode, 0);
            }
            other => panic!("expected exec result, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_is_announced_to_viewers() {
        let (_server, addr) = start_server(false).await;
        let mut ws = authed_connection(addr).await;
        send(
            &mut ws,
            &ControlMessage::CreateSession {
                session_id: "t1".to_string(),
                cwd: None,
            },
        )
        .await;
        send(
            &mut ws,
            &ControlMessage::CloseSession {
                session_id: "t1".to_string(),
            },
        )
        .await;
        let closed = wait_for(&mut ws, |e| {
            matches!(e, WorkerEvent::SessionClosed { session_id } if session_id == "t1")
        })
        .await;
        assert!(closed.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_notifies_viewers() {
        let (server, addr) = start_server(false).await;
        let mut ws = authed_connection(addr).await;
        // Wait for the greeting so the connection is fully up.
        wait_for(&mut ws, |e| matches!(e, WorkerEvent::Output { .. })).await;

        server.shutdown();
        let bye = wait_for(&mut ws, |e| {
            matches!(e, WorkerEvent::Output { output } if output.contains("shutting down"))
        })
        .await;
        assert!(bye.is_some());
    }
}
