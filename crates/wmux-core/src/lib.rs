//! wmux-core: shared protocol library for wmux.
//!
//! Provides the tagged control/event message types and their JSON codec, the
//! error taxonomy, shared-secret auth tokens, and the bounded history buffer
//! used for scrollback replay.

pub mod auth;
pub mod error;
pub mod history;
pub mod protocol;

// Re-export commonly used items at crate root.
pub use auth::{generate_token, token_fingerprint, verify_token, AUTH_TOKEN_ENV};
pub use error::{WmuxError, WmuxResult};
pub use history::{HistoryBuffer, DEFAULT_HISTORY_BYTES};
pub use protocol::{
    decode_control, decode_event, encode_frame, ControlMessage, SignalKind, WorkerEvent,
    DEFAULT_SESSION_ID, MAX_FRAME_SIZE,
};
