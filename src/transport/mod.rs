//! WireLink Transport Layer
//!
//! The client consumes an HTTP/2 session as an abstract capability:
//! connect, submit a request, write additional body frames, and read
//! multiplexed responses. Concrete transports (TLS, framing, connect
//! primitives) live outside this crate; [`mock::MockTransport`] is the
//! scripted in-memory implementation driving the test suite.

pub mod mock;

// Re-exports
pub use mock::MockTransport;

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::config::ClientSettings;

/// EPIPE-class code: the peer went away mid-write.
pub const EPIPE: i32 = 32;
/// Connection-refused-class code.
pub const ECONNREFUSED: i32 = 111;
/// Transport-internal marker for a session that closed after a successful
/// connect (peer reset detected on an established session).
pub const SESSION_CLOSED: i32 = 5001;

/// Error reported by a transport operation, carrying the transport's
/// numeric error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("transport error code {code}")]
pub struct TransportError {
    pub code: i32,
}

impl TransportError {
    pub fn new(code: i32) -> Self {
        Self { code }
    }

    /// Whether a forced reconnect may recover from this error.
    pub fn is_reconnect_eligible(&self) -> bool {
        matches!(self.code, EPIPE | ECONNREFUSED | SESSION_CLOSED)
    }
}

/// A fully-built gRPC request submitted to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    /// Request path, e.g. `/pkg.Svc/Method`
    pub path: String,
    /// Full header block, pseudo-headers included
    pub headers: Vec<(String, String)>,
    /// Length-prefixed request body
    pub body: Vec<u8>,
    /// Whether the request stream ends with this body
    pub end_stream: bool,
}

impl TransportRequest {
    /// Look up a header value by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// One response read from the multiplexed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub stream_id: u32,
    /// Raw body, length prefix included
    pub data: Vec<u8>,
    /// `true` while the server keeps the stream open; `false` at
    /// end-of-stream
    pub pipeline: bool,
    /// Response headers; trailers ride here (`grpc-status`, `grpc-message`)
    pub headers: Vec<(String, String)>,
}

/// Session-level counters passed through by `WireClient::stats`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub connects: u64,
    pub closes: u64,
    pub streams_opened: u64,
    pub responses_delivered: u64,
}

/// HTTP/2 session capability consumed by `WireClient`.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Establish the session.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Apply client settings (timeouts, frame sizes, stream limits) before
    /// or after connecting.
    fn configure(&self, settings: &ClientSettings);

    /// Submit a request. `Ok(Some(id))` carries the positive stream id;
    /// `Ok(None)` means the session accepted nothing yet and the caller
    /// should retry.
    async fn send(&self, request: TransportRequest) -> Result<Option<u32>, TransportError>;

    /// Write an additional body frame on an open stream; `end` closes the
    /// request side.
    async fn write(&self, stream_id: u32, data: Vec<u8>, end: bool) -> Result<(), TransportError>;

    /// Next response in unary mode, or `None` if nothing arrived within
    /// `timeout`.
    async fn recv(&self, timeout: Duration) -> Option<TransportResponse>;

    /// Next response in streaming mode.
    async fn read(&self, timeout: Duration) -> Option<TransportResponse>;

    /// Tear down the session.
    async fn close(&self);

    /// Session-level counters.
    fn stats(&self) -> TransportStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_eligible_codes() {
        assert!(TransportError::new(EPIPE).is_reconnect_eligible());
        assert!(TransportError::new(ECONNREFUSED).is_reconnect_eligible());
        assert!(TransportError::new(SESSION_CLOSED).is_reconnect_eligible());
        assert!(!TransportError::new(104).is_reconnect_eligible());
        assert!(!TransportError::new(0).is_reconnect_eligible());
    }

    #[test]
    fn test_request_header_lookup() {
        let request = TransportRequest {
            path: "/pkg.Svc/Method".to_string(),
            headers: vec![("te".to_string(), "trailers".to_string())],
            body: Vec::new(),
            end_stream: true,
        };
        assert_eq!(request.header("te"), Some("trailers"));
        assert_eq!(request.header("content-type"), None);
    }
}
