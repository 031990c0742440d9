//! Keep a worker link alive across restarts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::WorkerClient;

/// Pause between connection attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Reported on the status channel as the link comes and goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub url: String,
    pub token: String,
    pub retry_interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:7703".to_string(),
            token: String::new(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// A worker connection that redials whenever the link drops.
///
/// The current [`WorkerClient`] is swapped out of [`client`](Self::client)
/// while disconnected, so callers always see either a live handle or `None`.
pub struct ReconnectingWorker {
    client: Arc<Mutex<Option<Arc<WorkerClient>>>>,
    task: Option<JoinHandle<()>>,
}

impl ReconnectingWorker {
    /// Start dialing. Status transitions stream out of the returned channel.
    pub fn spawn(config: ReconnectConfig) -> (Self, mpsc::Receiver<ConnectionStatus>) {
        let slot: Arc<Mutex<Option<Arc<WorkerClient>>>> = Arc::new(Mutex::new(None));
        let (status_tx, status_rx) = mpsc::channel(16);

        let task = tokio::spawn(run_reconnect_loop(config, Arc::clone(&slot), status_tx));

        (
            Self {
                client: slot,
                task: Some(task),
            },
            status_rx,
        )
    }

    /// The live client, or `None` while the link is down.
    pub async fn client(&self) -> Option<Arc<WorkerClient>> {
        self.client.lock().await.clone()
    }
}

impl Drop for ReconnectingWorker {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_reconnect_loop(
    config: ReconnectConfig,
    slot: Arc<Mutex<Option<Arc<WorkerClient>>>>,
    status_tx: mpsc::Sender<ConnectionStatus>,
) {
    loop {
        match WorkerClient::connect(&config.url, &config.token).await {
            Ok(client) => {
                info!(url = %config.url, "worker link up");
                let client = Arc::new(client);
                let mut watch = client.connection_watch();
                *slot.lock().await = Some(Arc::clone(&client));
                let _ = status_tx.send(ConnectionStatus::Connected).await;

                while *watch.borrow() {
                    if watch.changed().await.is_err() {
                        break;
                    }
                }

                *slot.lock().await = None;
                warn!(url = %config.url, "worker link lost, retrying");
                let _ = status_tx.send(ConnectionStatus::Disconnected).await;
            }
            Err(e) => {
                debug!(url = %config.url, "connect failed: {e}");
                let _ = status_tx.send(ConnectionStatus::Failed(e.to_string())).await;
            }
        }

        tokio::time::sleep(config.retry_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;
    use wmux_core::{encode_frame, WorkerEvent};

    #[test]
    fn defaults_point_at_the_local_worker() {
        let config = ReconnectConfig::default();
        assert_eq!(config.url, "ws://127.0.0.1:7703");
        assert_eq!(config.retry_interval, DEFAULT_RETRY_INTERVAL);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unreachable_worker_keeps_retrying() {
        let (_handle, mut status_rx) = ReconnectingWorker::spawn(ReconnectConfig {
            url: "ws://127.0.0.1:1".to_string(),
            token: "token".to_string(),
            retry_interval: Duration::from_millis(20),
        });

        for _ in 0..2 {
            let status = tokio::time::timeout(Duration::from_secs(5), status_rx.recv())
                .await
                .expect("status before timeout")
                .unwrap();
            assert!(matches!(status, ConnectionStatus::Failed(_)), "got {status:?}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn redials_after_the_link_drops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let (tcp, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                let _ = ws.next().await; // auth frame
                ws.send(Message::Text(
                    encode_frame(&WorkerEvent::Output {
                        output: "Connected\n".to_string(),
                    })
                    .unwrap(),
                ))
                .await
                .unwrap();
                let _ = ws.close(None).await;
            }
        });

        let (handle, mut status_rx) = ReconnectingWorker::spawn(ReconnectConfig {
            url,
            token: "token".to_string(),
            retry_interval: Duration::from_millis(20),
        });

        let mut seen = Vec::new();
        while seen.len() < 3 {
            let status = tokio::time::timeout(Duration::from_secs(5), status_rx.recv())
                .await
                .expect("status before timeout")
                .unwrap();
            seen.push(status);
        }
        assert_eq!(
            seen,
            vec![
                ConnectionStatus::Connected,
                ConnectionStatus::Disconnected,
                ConnectionStatus::Connected,
            ]
        );

        drop(handle);
        server.await.unwrap();
    }
}
