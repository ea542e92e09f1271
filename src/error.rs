use thiserror::Error;

use crate::transport::{ECONNREFUSED, EPIPE, SESSION_CLOSED};

/// Numeric code surfaced when `recv` is called with a stream id the client
/// never issued.
pub const UNKNOWN_STREAM_CODE: i32 = 86;

/// Main error type for WireLink operations
#[derive(Error, Debug)]
pub enum WireLinkError {
    /// Transport-level failure (connect or send) carrying the transport's
    /// numeric error code
    #[error("transport error: {message}")]
    Transport { code: i32, message: String },

    /// `recv` was called with a stream id this client never issued
    #[error("unknown stream id {0}")]
    UnknownStream(u32),

    /// `send` gave up after exhausting its retry budget
    #[error("send failed after {0} attempts")]
    SendExhausted(u32),

    /// The client or pool has been closed
    #[error("connection closed")]
    Closed,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic errors
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for WireLink operations
pub type Result<T> = std::result::Result<T, WireLinkError>;

impl WireLinkError {
    /// Build a transport error for `code` observed while talking to
    /// `host:port`. The message is `strerror(code) + " host:port"`.
    pub fn transport(code: i32, host: &str, port: u16) -> Self {
        Self::Transport {
            code,
            message: format!("{} {host}:{port}", strerror(code)),
        }
    }

    /// The numeric code carried by this error, if it has one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Transport { code, .. } => Some(*code),
            Self::UnknownStream(_) => Some(UNKNOWN_STREAM_CODE),
            _ => None,
        }
    }
}

/// Human-readable description of a transport error code.
fn strerror(code: i32) -> &'static str {
    match code {
        EPIPE => "Broken pipe",
        ECONNREFUSED => "Connection refused",
        SESSION_CLOSED => "Session closed",
        _ => "Transport error",
    }
}
