//! The worker facade: one session registry plus its event stream.
//!
//! This is the surface both modes share. The WebSocket server drives it on
//! behalf of remote viewers; an embedding process can hold one directly
//! and skip the network entirely.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use wmux_core::{SignalKind, WorkerEvent};

use crate::config::WorkerConfig;
use crate::exec;
use crate::session::SessionRegistry;

/// Sizing for the worker event fanout. Slow subscribers see `Lagged`
/// rather than stalling the readers.
const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct Worker {
    registry: Arc<SessionRegistry>,
    events: broadcast::Sender<WorkerEvent>,
}

impl Worker {
    pub fn new(config: &WorkerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let registry = Arc::new(SessionRegistry::new(
            config.history_bytes,
            config.shell.clone(),
            events.clone(),
        ));
        Self { registry, events }
    }

    /// Subscribe to the live event stream. Events sent before the call are
    /// not replayed; use [`Worker::history`] for scrollback.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub async fn create_session(&self, id: &str, cwd: Option<PathBuf>) {
        self.registry.create_session(id, cwd).await;
    }

    pub async fn write_input(&self, id: &str, input: &str) {
        self.registry.write_input(id, input).await;
    }

    pub async fn send_command(&self, id: &str, cmd: &str) {
        self.registry.send_command(id, cmd).await;
    }

    pub async fn resize(&self, id: &str, rows: u16, cols: u16) {
        self.registry.resize(id, rows, cols).await;
    }

    pub async fn send_signal(&self, id: &str, signal: SignalKind) {
        self.registry.send_signal(id, signal).await;
    }

    pub async fn close_session(&self, id: &str) {
        self.registry.close_session(id).await;
    }

    pub async fn history(&self, id: &str) -> String {
        self.registry.history(id).await
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.registry.session_ids().await
    }

    /// Run a one-shot command outside any session. The result is returned
    /// to the caller, not broadcast.
    pub async fn exec(&self, id: &str, command: &str, cwd: Option<&str>) -> WorkerEvent {
        exec::run_exec(id, command, cwd).await
    }

    /// Close every session. Called on shutdown so shells exit cleanly.
    pub async fn shutdown(&self) {
        self.registry.shutdown_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn test_config() -> WorkerConfig {
        WorkerConfig::load(Some(Path::new("/nonexistent.toml")), None, Some("test-token"))
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn facade_round_trip() {
        let mut config = test_config();
        config.shell = Some("/bin/sh".to_string());
        let worker = Worker::new(&config);
        let mut events = worker.subscribe();

        worker.create_session("w1", None).await;
        assert_eq!(worker.session_ids().await, vec!["w1".to_string()]);
        worker.send_command("w1", "echo facade_check").await;

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
        let mut seen = String::new();
        while tokio::time::Instant::now() < deadline && !seen.contains("facade_check") {
            match tokio::time::timeout(std::time::Duration::from_millis(250), events.recv()).await
            {
                Ok(Ok(WorkerEvent::TermOutput { session_id, output })) if session_id == "w1" => {
                    seen.push_str(&output);
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) => break,
                Err(_) => {}
            }
        }
        assert!(seen.contains("facade_check"));
        assert!(worker.history("w1").await.contains("facade_check"));

        worker.shutdown().await;
        assert!(worker.session_ids().await.is_empty());
    }

    #[tokio::test]
    async fn exec_returns_result_without_broadcast() {
        let worker = Worker::new(&test_config());
        let mut events = worker.subscribe();
        let event = worker.exec("x1", "echo direct", None).await;
        match event {
            WorkerEvent::ExecResult { id, stdout, .. } => {
                assert_eq!(id, "x1");
                assert_eq!(stdout, "direct\n");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }
}
