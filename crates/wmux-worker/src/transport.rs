//! WebSocket listener and frame helpers using tokio-tungstenite.
//!
//! The control channel is one JSON object per text frame. Binary frames
//! are not part of the protocol and are ignored.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use wmux_core::{WmuxError, WmuxResult, MAX_FRAME_SIZE};

pub type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// A handle to an accepted WebSocket connection.
pub struct WsConnection {
    pub ws_stream: WsStream,
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener.
///
/// Returns the bound address (useful when binding port 0) and a receiver
/// that yields accepted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> WmuxResult<(SocketAddr, mpsc::Receiver<WsConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| WmuxError::Transport(format!("bind {bind_addr} failed: {e}")))?;
    let bound = tcp_listener
        .local_addr()
        .map_err(|e| WmuxError::Transport(format!("listener address unavailable: {e}")))?;

    info!(addr = %bound, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WsConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WsConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((bound, rx))
}

/// Send one text frame.
pub async fn send_text(ws: &mut WsStream, text: &str) -> WmuxResult<()> {
    ws.send(Message::Text(text.to_string()))
        .await
        .map_err(|e| WmuxError::Transport(format!("WS send failed: {e}")))
}

/// Receive the next text frame.
///
/// Returns `None` when the connection is closed. Pings are answered in
/// place; binary and other frames are skipped. Oversized frames are an
/// error.
pub async fn recv_text(ws: &mut WsStream) -> WmuxResult<Option<String>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_FRAME_SIZE {
                    return Err(WmuxError::Protocol(format!(
                        "frame too large: {} bytes (max {})",
                        text.len(),
                        MAX_FRAME_SIZE
                    )));
                }
                return Ok(Some(text));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(_)) => {
                continue;
            }
            Some(Err(e)) => {
                return Err(WmuxError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}
