//! Multiplexed gRPC client over an abstract HTTP/2 transport.
//!
//! A `WireClient` owns one long-lived HTTP/2 session carrying many
//! concurrent logical streams. A single receiver task fans inbound
//! responses out to per-stream mailboxes, and the send path transparently
//! reconnects on recognized transport resets when `force_reconnect` is on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::WireClientConfig;
use crate::error::{Result, WireLinkError};
use crate::message::{self, Encoding, Trailers};
use crate::transport::{Transport, TransportRequest, TransportStats};

/// Whether the request stream ends on `send` or stays open for `push`es.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClientMode {
    /// The request body sent by `send` ends the stream
    #[default]
    Unary,
    /// The stream stays open; `push` writes further frames
    Streaming,
}

/// Back-off before retrying a submission that produced no stream id.
const RETRY_DELAY: Duration = Duration::from_millis(10);
/// Settle delay taken by the task that performed the reconnect.
const RECONNECT_DELAY: Duration = Duration::from_millis(100);
/// Receiver back-off when the session produced nothing.
const RECEIVER_IDLE_DELAY: Duration = Duration::from_secs(1);

/// What the receiver task drops into a stream mailbox.
type Delivery = (Vec<u8>, Trailers);

/// Per-stream record: a single-slot hand-off channel plus lifecycle state.
/// The receiver task is the sole producer; the `recv` caller is the sole
/// consumer and checks the receiver half out while waiting.
struct StreamEntry {
    tx: Option<mpsc::Sender<Delivery>>,
    rx: Option<mpsc::Receiver<Delivery>>,
    /// Server closed the stream; the entry is removed once the final
    /// delivery has been consumed.
    ended: bool,
}

/// One response delivered on a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Decoded payload. `None` when the deadline elapsed before anything
    /// arrived; an empty `Some` payload is a valid delivery.
    pub payload: Option<Vec<u8>>,
    pub trailers: Trailers,
}

impl Reply {
    /// Whether this reply is a synthesized deadline expiry.
    pub fn timed_out(&self) -> bool {
        self.payload.is_none()
    }
}

/// Multiplexed gRPC client bound to one HTTP/2 session.
pub struct WireClient {
    config: WireClientConfig,
    transport: Arc<dyn Transport>,
    streams: Arc<Mutex<HashMap<u32, StreamEntry>>>,
    closed: Arc<AtomicBool>,
    reconnecting: Arc<AtomicBool>,
    receiver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for WireClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireClient")
            .field("endpoint", &self.config.endpoint.as_str())
            .field("mode", &self.config.mode)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl WireClient {
    /// Create an unconnected client over the given transport.
    pub fn new(config: WireClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            streams: Arc::new(Mutex::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
            reconnecting: Arc::new(AtomicBool::new(false)),
            receiver: Mutex::new(None),
        }
    }

    /// Establish the HTTP/2 session and spawn the receiver task.
    ///
    /// A connect failure is terminal for this client.
    pub async fn connect(&self) -> Result<()> {
        self.config.validate()?;
        self.transport.configure(&self.config.settings);

        if let Err(err) = self.transport.connect().await {
            return Err(self.transport_error(err.code));
        }
        debug!(endpoint = %self.config.endpoint, "connected");

        let mut receiver = self.receiver.lock().unwrap();
        if receiver.is_none() {
            // Bound each transport read by the full retry window.
            let read_timeout = self.config.settings.timeout * self.config.settings.max_retries;
            *receiver = Some(tokio::spawn(receive_loop(
                Arc::clone(&self.transport),
                Arc::clone(&self.streams),
                Arc::clone(&self.closed),
                self.config.mode,
                read_timeout,
            )));
        }
        Ok(())
    }

    /// Submit a request and return its stream id.
    ///
    /// At most `max_retries` submissions are attempted. Reconnect-eligible
    /// transport errors (broken pipe, connection refused, session closed)
    /// trigger one forced reconnect per burst when `force_reconnect` is on;
    /// concurrent senders observing the same burst yield and retry instead
    /// of reconnecting again.
    pub async fn send(&self, method: &str, payload: &[u8], encoding: Encoding) -> Result<u32> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WireLinkError::Closed);
        }
        let settings = &self.config.settings;
        let body = message::frame(payload);
        let end_stream = self.config.mode == ClientMode::Unary;

        for attempt in 1..=settings.max_retries {
            let request = self.build_request(method, encoding, body.clone(), end_stream);
            match self.transport.send(request).await {
                Ok(Some(stream_id)) => {
                    self.register_stream(stream_id);
                    self.reconnecting.store(false, Ordering::Release);
                    debug!(stream_id, method, "request submitted");
                    return Ok(stream_id);
                }
                Ok(None) => {
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(err)
                    if err.is_reconnect_eligible()
                        && settings.force_reconnect
                        && attempt < settings.max_retries =>
                {
                    if self
                        .reconnecting
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        warn!(code = err.code, endpoint = %self.config.endpoint, "session reset, reconnecting");
                        self.transport.close().await;
                        if let Err(connect_err) = self.transport.connect().await {
                            warn!(code = connect_err.code, "reconnect attempt failed");
                        }
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    } else {
                        // Another sender owns the reconnect for this burst.
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
                Err(err) => {
                    self.reconnecting.store(false, Ordering::Release);
                    return Err(self.transport_error(err.code));
                }
            }
        }

        self.reconnecting.store(false, Ordering::Release);
        Err(WireLinkError::SendExhausted(settings.max_retries))
    }

    /// Write an additional length-prefixed frame on an open stream; `end`
    /// closes the request side.
    pub async fn push(&self, stream_id: u32, payload: &[u8], end: bool) -> Result<()> {
        if !self.streams.lock().unwrap().contains_key(&stream_id) {
            return Err(WireLinkError::UnknownStream(stream_id));
        }
        self.transport
            .write(stream_id, message::frame(payload), end)
            .await
            .map_err(|err| self.transport_error(err.code))
    }

    /// Block until the receiver task delivers a message for this stream or
    /// the deadline fires.
    ///
    /// `settings.receive_timeout` overrides `wait` when set. A deadline
    /// expiry is not an error: the reply carries no payload and the
    /// synthesized `DEADLINE_EXCEEDED` trailer pair.
    pub async fn recv(&self, stream_id: u32, wait: Duration) -> Result<Reply> {
        let wait = self.config.settings.receive_timeout.unwrap_or(wait);

        let mut rx = {
            let mut streams = self.streams.lock().unwrap();
            let entry = streams
                .get_mut(&stream_id)
                .ok_or(WireLinkError::UnknownStream(stream_id))?;
            entry
                .rx
                .take()
                .ok_or(WireLinkError::UnknownStream(stream_id))?
        };

        match timeout(wait, rx.recv()).await {
            Ok(Some((payload, trailers))) => {
                let mut streams = self.streams.lock().unwrap();
                let ended = streams.get(&stream_id).map(|entry| entry.ended);
                match ended {
                    Some(true) => {
                        streams.remove(&stream_id);
                    }
                    Some(false) => {
                        if let Some(entry) = streams.get_mut(&stream_id) {
                            entry.rx = Some(rx);
                        }
                    }
                    None => {}
                }
                Ok(Reply {
                    payload: Some(payload),
                    trailers,
                })
            }
            Ok(None) => {
                // Mailbox closed with nothing delivered: the client went away.
                self.streams.lock().unwrap().remove(&stream_id);
                Err(WireLinkError::Closed)
            }
            Err(_) => {
                let mut streams = self.streams.lock().unwrap();
                if let Some(entry) = streams.get_mut(&stream_id) {
                    entry.rx = Some(rx);
                }
                Ok(Reply {
                    payload: None,
                    trailers: Trailers::deadline_exceeded(),
                })
            }
        }
    }

    /// Close the session. The receiver task observes the flag and exits at
    /// its next read boundary.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.close().await;
        debug!(endpoint = %self.config.endpoint, "client closed");
    }

    /// Transport-level counters.
    pub fn stats(&self) -> TransportStats {
        self.transport.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn mode(&self) -> ClientMode {
        self.config.mode
    }

    pub fn config(&self) -> &WireClientConfig {
        &self.config
    }

    /// Number of streams currently registered.
    pub fn active_streams(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    // -- Internal --

    fn register_stream(&self, stream_id: u32) {
        let (tx, rx) = mpsc::channel(1);
        self.streams.lock().unwrap().insert(
            stream_id,
            StreamEntry {
                tx: Some(tx),
                rx: Some(rx),
                ended: false,
            },
        );
    }

    fn build_request(
        &self,
        method: &str,
        encoding: Encoding,
        body: Vec<u8>,
        end_stream: bool,
    ) -> TransportRequest {
        let headers = vec![
            (":method".to_string(), "POST".to_string()),
            (":path".to_string(), method.to_string()),
            ("user-agent".to_string(), self.config.user_agent.clone()),
            (
                "content-type".to_string(),
                encoding.content_type().to_string(),
            ),
            ("te".to_string(), "trailers".to_string()),
        ];
        TransportRequest {
            path: method.to_string(),
            headers,
            body,
            end_stream,
        }
    }

    fn transport_error(&self, code: i32) -> WireLinkError {
        WireLinkError::transport(code, self.config.host(), self.config.port())
    }
}

/// Long-lived fan-out task: reads multiplexed responses from the transport
/// and routes each to its stream mailbox. Never surfaces errors to callers;
/// an idle or failing read backs off and loops, since the session may still
/// be alive for other streams. `close()` is the termination signal.
async fn receive_loop(
    transport: Arc<dyn Transport>,
    streams: Arc<Mutex<HashMap<u32, StreamEntry>>>,
    closed: Arc<AtomicBool>,
    mode: ClientMode,
    read_timeout: Duration,
) {
    while !closed.load(Ordering::Acquire) {
        let response = match mode {
            ClientMode::Unary => transport.recv(read_timeout).await,
            ClientMode::Streaming => transport.read(read_timeout).await,
        };

        let Some(response) = response else {
            if closed.load(Ordering::Acquire) {
                break;
            }
            tokio::time::sleep(RECEIVER_IDLE_DELAY).await;
            continue;
        };

        let payload = message::strip_frame(&response.data);
        let trailers = Trailers::from_headers(&response.headers);
        let end_of_stream = !response.pipeline;

        let tx = streams
            .lock()
            .unwrap()
            .get(&response.stream_id)
            .and_then(|entry| entry.tx.clone());
        let Some(tx) = tx else {
            debug!(
                stream_id = response.stream_id,
                "response for unknown stream (already consumed?)"
            );
            continue;
        };

        if tx.send((payload, trailers)).await.is_err() {
            debug!(
                stream_id = response.stream_id,
                "mailbox dropped before delivery"
            );
        }

        if end_of_stream {
            let mut streams = streams.lock().unwrap();
            if let Some(entry) = streams.get_mut(&response.stream_id) {
                entry.ended = true;
                entry.tx = None;
            }
        }
    }
    debug!("receiver task terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockTransport, TransportError, ECONNREFUSED, EPIPE};

    fn client_over(mock: &Arc<MockTransport>, config: WireClientConfig) -> WireClient {
        WireClient::new(config, Arc::clone(mock) as Arc<dyn Transport>)
    }

    fn test_config() -> WireClientConfig {
        WireClientConfig::builder()
            .endpoint("http://127.0.0.1:50051")
            .timeout(Duration::from_millis(200))
            .build()
    }

    #[tokio::test]
    async fn test_unary_round_trip() {
        let mock = Arc::new(MockTransport::new());
        let client = client_over(&mock, test_config());
        client.connect().await.unwrap();

        let stream_id = client
            .send("/echo.Echo/Ping", b"hello", Encoding::Proto)
            .await
            .unwrap();
        assert_eq!(stream_id, 1);
        assert_eq!(client.active_streams(), 1);

        mock.respond(stream_id, b"world", "0");

        let reply = client.recv(stream_id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.payload.as_deref(), Some(&b"world"[..]));
        assert_eq!(reply.trailers.status, "0");
        assert_eq!(reply.trailers.message, "");
        assert!(reply.trailers.is_ok());

        // Final delivery consumed; the stream is gone.
        assert_eq!(client.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_request_headers_and_framing() {
        let mock = Arc::new(MockTransport::new());
        let client = client_over(&mock, test_config());
        client.connect().await.unwrap();

        client
            .send("/pkg.Svc/Method", b"hi", Encoding::Json)
            .await
            .unwrap();

        let requests = mock.requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.path, "/pkg.Svc/Method");
        assert_eq!(request.header(":method"), Some("POST"));
        assert_eq!(request.header(":path"), Some("/pkg.Svc/Method"));
        assert_eq!(request.header("te"), Some("trailers"));
        assert_eq!(request.header("content-type"), Some("application/grpc+json"));
        assert!(request
            .header("user-agent")
            .unwrap()
            .starts_with("grpc-wirelink/"));
        assert!(request.end_stream);
        assert_eq!(request.body, message::frame(b"hi"));
    }

    #[tokio::test]
    async fn test_recv_timeout_synthesizes_deadline() {
        let mock = Arc::new(MockTransport::new());
        let client = client_over(&mock, test_config());
        client.connect().await.unwrap();

        let stream_id = client.send("/svc/M", b"x", Encoding::Proto).await.unwrap();

        let reply = client
            .recv(stream_id, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(reply.timed_out());
        assert_eq!(reply.trailers.status, "4");
        assert_eq!(reply.trailers.message, "DEADLINE_EXCEEDED");

        // The stream is still registered; a late response can be consumed.
        assert_eq!(client.active_streams(), 1);
        mock.respond(stream_id, b"late", "0");
        let reply = client.recv(stream_id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.payload.as_deref(), Some(&b"late"[..]));
    }

    #[tokio::test]
    async fn test_recv_unknown_stream() {
        let mock = Arc::new(MockTransport::new());
        let client = client_over(&mock, test_config());
        client.connect().await.unwrap();

        let err = client.recv(42, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, WireLinkError::UnknownStream(42)));
        assert_eq!(err.code(), Some(crate::error::UNKNOWN_STREAM_CODE));
    }

    #[tokio::test]
    async fn test_zero_length_response_is_a_delivery() {
        let mock = Arc::new(MockTransport::new());
        let client = client_over(&mock, test_config());
        client.connect().await.unwrap();

        let stream_id = client.send("/svc/M", b"x", Encoding::Proto).await.unwrap();
        // End-of-stream with no body at all: trailers still delivered.
        mock.push_response(crate::transport::TransportResponse {
            stream_id,
            data: Vec::new(),
            pipeline: false,
            headers: vec![("grpc-status".to_string(), "0".to_string())],
        });

        let reply = client.recv(stream_id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.payload.as_deref(), Some(&b""[..]));
        assert!(!reply.timed_out());
        assert!(reply.trailers.is_ok());
    }

    #[tokio::test]
    async fn test_send_surfaces_terminal_transport_error() {
        let mock = Arc::new(MockTransport::new());
        let client = client_over(&mock, test_config());
        client.connect().await.unwrap();

        // Not in the reconnect-eligible set.
        mock.fail_sends(104, 1);
        let err = client.send("/svc/M", b"x", Encoding::Proto).await.unwrap_err();
        assert_eq!(err.code(), Some(104));
        assert!(err.to_string().contains("127.0.0.1:50051"));
    }

    #[tokio::test]
    async fn test_eligible_error_without_force_reconnect_is_terminal() {
        let mock = Arc::new(MockTransport::new());
        let client = client_over(&mock, test_config());
        client.connect().await.unwrap();

        mock.fail_sends(ECONNREFUSED, 1);
        let err = client.send("/svc/M", b"x", Encoding::Proto).await.unwrap_err();
        assert_eq!(err.code(), Some(ECONNREFUSED));
        // No reconnect was attempted.
        assert_eq!(mock.close_count(), 0);
        assert_eq!(mock.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_forced_reconnect_then_success() {
        let mock = Arc::new(MockTransport::new());
        let config = WireClientConfig::builder()
            .endpoint("http://127.0.0.1:50051")
            .timeout(Duration::from_millis(200))
            .with_force_reconnect()
            .build();
        let client = client_over(&mock, config);
        client.connect().await.unwrap();

        mock.fail_sends(EPIPE, 1);
        let stream_id = client.send("/svc/M", b"x", Encoding::Proto).await.unwrap();
        assert!(stream_id > 0);

        // One close + one reconnect on top of the initial connect.
        assert_eq!(mock.close_count(), 1);
        assert_eq!(mock.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_send_exhausted_after_idle_retries() {
        let mock = Arc::new(MockTransport::new());
        let config = WireClientConfig::builder()
            .endpoint("http://127.0.0.1:50051")
            .timeout(Duration::from_millis(200))
            .max_retries(3)
            .build();
        let client = client_over(&mock, config);
        client.connect().await.unwrap();

        for _ in 0..3 {
            mock.script_send(Ok(None));
        }
        let err = client.send("/svc/M", b"x", Encoding::Proto).await.unwrap_err();
        assert!(matches!(err, WireLinkError::SendExhausted(3)));
    }

    #[tokio::test]
    async fn test_push_frames_and_ends_stream() {
        let mock = Arc::new(MockTransport::new());
        let config = WireClientConfig::builder()
            .endpoint("http://127.0.0.1:50051")
            .timeout(Duration::from_millis(200))
            .streaming()
            .build();
        let client = client_over(&mock, config);
        client.connect().await.unwrap();

        let stream_id = client.send("/svc/M", b"a", Encoding::Proto).await.unwrap();
        // Streaming mode leaves the request side open.
        assert!(!mock.requests()[0].end_stream);

        client.push(stream_id, b"b", false).await.unwrap();
        client.push(stream_id, b"c", true).await.unwrap();

        let writes = mock.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], (stream_id, message::frame(b"b"), false));
        assert_eq!(writes[1], (stream_id, message::frame(b"c"), true));
    }

    #[tokio::test]
    async fn test_push_unknown_stream() {
        let mock = Arc::new(MockTransport::new());
        let client = client_over(&mock, test_config());
        client.connect().await.unwrap();

        let err = client.push(7, b"x", false).await.unwrap_err();
        assert!(matches!(err, WireLinkError::UnknownStream(7)));
    }

    #[tokio::test]
    async fn test_server_streaming_keeps_stream_open() {
        let mock = Arc::new(MockTransport::new());
        let client = client_over(&mock, test_config());
        client.connect().await.unwrap();

        let stream_id = client.send("/svc/M", b"q", Encoding::Proto).await.unwrap();
        mock.respond_part(stream_id, b"part-1");

        let reply = client.recv(stream_id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.payload.as_deref(), Some(&b"part-1"[..]));
        assert_eq!(client.active_streams(), 1);

        mock.respond(stream_id, b"part-2", "0");
        let reply = client.recv(stream_id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.payload.as_deref(), Some(&b"part-2"[..]));
        assert_eq!(client.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_receive_timeout_setting_overrides_caller() {
        let mock = Arc::new(MockTransport::new());
        let config = WireClientConfig::builder()
            .endpoint("http://127.0.0.1:50051")
            .timeout(Duration::from_millis(200))
            .receive_timeout(Duration::from_millis(20))
            .build();
        let client = client_over(&mock, config);
        client.connect().await.unwrap();

        let stream_id = client.send("/svc/M", b"x", Encoding::Proto).await.unwrap();

        // The caller asks for a long wait, but the configured override wins.
        let started = std::time::Instant::now();
        let reply = client.recv(stream_id, Duration::from_secs(30)).await.unwrap();
        assert!(reply.timed_out());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_send_after_close() {
        let mock = Arc::new(MockTransport::new());
        let client = client_over(&mock, test_config());
        client.connect().await.unwrap();
        client.close().await;

        assert!(client.is_closed());
        let err = client.send("/svc/M", b"x", Encoding::Proto).await.unwrap_err();
        assert!(matches!(err, WireLinkError::Closed));
        assert_eq!(mock.close_count(), 1);

        // Idempotent.
        client.close().await;
        assert_eq!(mock.close_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_terminal() {
        let mock = Arc::new(MockTransport::new());
        mock.script_connect(Err(TransportError::new(ECONNREFUSED)));
        let client = client_over(&mock, test_config());

        let err = client.connect().await.unwrap_err();
        assert_eq!(err.code(), Some(ECONNREFUSED));
        assert!(err.to_string().contains("Connection refused"));
    }

    #[tokio::test]
    async fn test_connect_applies_settings() {
        let mock = Arc::new(MockTransport::new());
        let client = client_over(&mock, test_config());
        client.connect().await.unwrap();

        let applied = mock.applied_settings().unwrap();
        assert_eq!(applied.timeout, Duration::from_millis(200));
        assert_eq!(applied.http2_max_concurrent_streams, 1000);
    }

    #[tokio::test]
    async fn test_stats_pass_through() {
        let mock = Arc::new(MockTransport::new());
        let client = client_over(&mock, test_config());
        client.connect().await.unwrap();
        client.send("/svc/M", b"x", Encoding::Proto).await.unwrap();

        let stats = client.stats();
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.streams_opened, 1);
    }
}
