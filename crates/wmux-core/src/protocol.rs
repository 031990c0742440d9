//! Wire protocol for the worker control channel.
//!
//! One JSON object per WebSocket text frame, tagged by a `"type"` field.
//! Frames flowing toward the worker are [`ControlMessage`]; frames flowing
//! back to viewers are [`WorkerEvent`].

use serde::{Deserialize, Serialize};

use crate::error::{WmuxError, WmuxResult};

/// Largest accepted frame (1 MiB). Anything bigger is a protocol error.
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Well-known id of the session auto-created for a connecting viewer.
pub const DEFAULT_SESSION_ID: &str = "session-1";

/// Signal kinds deliverable to a session.
///
/// Unrecognized wire values deserialize to `Unknown`, which dispatch ignores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SignalKind {
    #[default]
    Interrupt,
    Kill,
    Unknown,
}

impl Serialize for SignalKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(match self {
            SignalKind::Interrupt => "SIGINT",
            SignalKind::Kill => "SIGKILL",
            SignalKind::Unknown => "UNKNOWN",
        })
    }
}

impl<'de> Deserialize<'de> for SignalKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "SIGINT" => SignalKind::Interrupt,
            "SIGKILL" => SignalKind::Kill,
            _ => SignalKind::Unknown,
        })
    }
}

/// A control frame from a viewer or aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// First frame on every connection: the shared secret.
    Auth { token: String },
    /// Open a session. Idempotent; reopening an existing id replays history.
    CreateSession {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    /// Raw keystrokes for the session's PTY.
    TermInput { session_id: String, input: String },
    /// A command line; the worker appends a newline before writing.
    Command { session_id: String, cmd: String },
    /// Change the session's terminal dimensions.
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    /// Deliver an interrupt or kill to the session's foreground job.
    SendSignal {
        session_id: String,
        #[serde(default)]
        signal: SignalKind,
    },
    /// Tear the session down.
    CloseSession { session_id: String },
    /// Run a one-shot command outside any session, correlated by `id`.
    Exec {
        id: String,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
}

/// An event frame from the worker to its viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// A new session is live.
    SessionCreated { session_id: String },
    /// A session is fully torn down.
    SessionClosed { session_id: String },
    /// Incremental PTY output, decoded to text.
    TermOutput { session_id: String, output: String },
    /// Connection-level diagnostics not tied to a session.
    Output { output: String },
    /// Completion of an `exec` request.
    ExecResult {
        id: String,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
        returncode: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Encode a frame as a JSON string.
pub fn encode_frame<T: Serialize>(frame: &T) -> WmuxResult<String> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode one inbound control frame.
pub fn decode_control(text: &str) -> WmuxResult<ControlMessage> {
    check_frame_size(text)?;
    Ok(serde_json::from_str(text)?)
}

/// Decode one event frame (the client side of the channel).
pub fn decode_event(text: &str) -> WmuxResult<WorkerEvent> {
    check_frame_size(text)?;
    Ok(serde_json::from_str(text)?)
}

fn check_frame_size(text: &str) -> WmuxResult<()> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(WmuxError::Protocol(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            text.len()
        )));
    }
    Ok(())
}
