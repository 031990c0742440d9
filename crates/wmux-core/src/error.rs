use thiserror::Error;

/// Errors produced across the wmux crates.
#[derive(Debug, Error)]
pub enum WmuxError {
    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for WmuxError {
    fn from(e: serde_json::Error) -> Self {
        WmuxError::Protocol(e.to_string())
    }
}

pub type WmuxResult<T> = Result<T, WmuxError>;
