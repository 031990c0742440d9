//! wmux-client: Rust client library for the wmux worker protocol.
//!
//! Provides a native async client that connects to a worker over WebSocket,
//! authenticates with a shared-secret token, and drives terminal sessions
//! through the tagged JSON control/event protocol. A reconnecting wrapper
//! keeps a link alive across worker restarts.
//!
//! # Quick Start
//!
//! ```no_run
//! use wmux_client::WorkerClient;
//! use wmux_core::WorkerEvent;
//!
//! # async fn example() -> wmux_core::WmuxResult<()> {
//! let client = WorkerClient::connect("ws://127.0.0.1:7703", "secret-token").await?;
//! let mut events = client.subscribe();
//!
//! client.create_session("session-1").await?;
//! client.send_command("session-1", "echo hello").await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let WorkerEvent::TermOutput { output, .. } = event {
//!         print!("{output}");
//!     }
//! }
//!
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod reconnect;

// Re-export primary public types.
pub use client::WorkerClient;
pub use reconnect::{ConnectionStatus, ReconnectConfig, ReconnectingWorker};

// Re-export wmux-core protocol types for convenience.
pub use wmux_core::{ControlMessage, SignalKind, WmuxError, WmuxResult, WorkerEvent};
