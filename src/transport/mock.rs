//! Scripted in-memory transport.
//!
//! `MockTransport` stands in for a real HTTP/2 session in the test suite:
//! `send` outcomes and `connect` outcomes are scripted up front, inbound
//! responses are fed through a queue consumed by `recv`/`read`, and every
//! submitted request and written frame is captured for assertions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Transport, TransportError, TransportRequest, TransportResponse, TransportStats};
use crate::config::ClientSettings;
use crate::message;

type SendOutcome = Result<Option<u32>, TransportError>;

pub struct MockTransport {
    /// Scripted outcomes for `send`; once exhausted, odd stream ids are
    /// handed out in order (1, 3, 5, ...).
    send_script: Mutex<VecDeque<SendOutcome>>,
    /// Scripted outcomes for `connect`; once exhausted, connects succeed.
    connect_script: Mutex<VecDeque<Result<(), TransportError>>>,
    next_stream_id: AtomicU32,
    inbound_tx: mpsc::UnboundedSender<TransportResponse>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportResponse>>,
    requests: Mutex<Vec<TransportRequest>>,
    writes: Mutex<Vec<(u32, Vec<u8>, bool)>>,
    applied: Mutex<Option<ClientSettings>>,
    connects: AtomicU64,
    closes: AtomicU64,
    streams_opened: AtomicU64,
    responses_delivered: AtomicU64,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            send_script: Mutex::new(VecDeque::new()),
            connect_script: Mutex::new(VecDeque::new()),
            next_stream_id: AtomicU32::new(1),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            requests: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            applied: Mutex::new(None),
            connects: AtomicU64::new(0),
            closes: AtomicU64::new(0),
            streams_opened: AtomicU64::new(0),
            responses_delivered: AtomicU64::new(0),
        }
    }

    /// Queue an outcome for the next unscripted `send`.
    pub fn script_send(&self, outcome: SendOutcome) {
        self.send_script.lock().unwrap().push_back(outcome);
    }

    /// Queue `n` failing `send` outcomes with the given code.
    pub fn fail_sends(&self, code: i32, n: usize) {
        let mut script = self.send_script.lock().unwrap();
        for _ in 0..n {
            script.push_back(Err(TransportError::new(code)));
        }
    }

    /// Queue an outcome for the next `connect`.
    pub fn script_connect(&self, outcome: Result<(), TransportError>) {
        self.connect_script.lock().unwrap().push_back(outcome);
    }

    /// Feed a raw response into the session.
    pub fn push_response(&self, response: TransportResponse) {
        let _ = self.inbound_tx.send(response);
    }

    /// Feed a complete (end-of-stream) gRPC response: framed payload plus
    /// the trailer pair.
    pub fn respond(&self, stream_id: u32, payload: &[u8], status: &str) {
        self.push_response(TransportResponse {
            stream_id,
            data: message::frame(payload),
            pipeline: false,
            headers: vec![
                ("grpc-status".to_string(), status.to_string()),
                ("grpc-message".to_string(), String::new()),
            ],
        });
    }

    /// Feed a mid-stream response (server streaming, stream stays open).
    pub fn respond_part(&self, stream_id: u32, payload: &[u8]) {
        self.push_response(TransportResponse {
            stream_id,
            data: message::frame(payload),
            pipeline: true,
            headers: Vec::new(),
        });
    }

    /// Snapshot of every request submitted so far.
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Snapshot of every `write` call so far.
    pub fn writes(&self) -> Vec<(u32, Vec<u8>, bool)> {
        self.writes.lock().unwrap().clone()
    }

    /// Settings last applied via `configure`.
    pub fn applied_settings(&self) -> Option<ClientSettings> {
        self.applied.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Acquire)
    }

    pub fn close_count(&self) -> u64 {
        self.closes.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("connects", &self.connects.load(Ordering::Relaxed))
            .field("closes", &self.closes.load(Ordering::Relaxed))
            .field(
                "streams_opened",
                &self.streams_opened.load(Ordering::Relaxed),
            )
            .finish()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let outcome = self
            .connect_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        if outcome.is_ok() {
            self.connects.fetch_add(1, Ordering::AcqRel);
        }
        outcome
    }

    fn configure(&self, settings: &ClientSettings) {
        *self.applied.lock().unwrap() = Some(settings.clone());
    }

    async fn send(&self, request: TransportRequest) -> Result<Option<u32>, TransportError> {
        self.requests.lock().unwrap().push(request);
        let outcome = self
            .send_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Some(self.next_stream_id.fetch_add(2, Ordering::AcqRel))));
        if let Ok(Some(_)) = outcome {
            self.streams_opened.fetch_add(1, Ordering::AcqRel);
        }
        outcome
    }

    async fn write(&self, stream_id: u32, data: Vec<u8>, end: bool) -> Result<(), TransportError> {
        self.writes.lock().unwrap().push((stream_id, data, end));
        Ok(())
    }

    async fn recv(&self, timeout: Duration) -> Option<TransportResponse> {
        self.next_response(timeout).await
    }

    async fn read(&self, timeout: Duration) -> Option<TransportResponse> {
        self.next_response(timeout).await
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::AcqRel);
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            connects: self.connects.load(Ordering::Acquire),
            closes: self.closes.load(Ordering::Acquire),
            streams_opened: self.streams_opened.load(Ordering::Acquire),
            responses_delivered: self.responses_delivered.load(Ordering::Acquire),
        }
    }
}

impl MockTransport {
    async fn next_response(&self, timeout: Duration) -> Option<TransportResponse> {
        let mut rx = self.inbound_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(response)) => {
                self.responses_delivered.fetch_add(1, Ordering::AcqRel);
                Some(response)
            }
            _ => None,
        }
    }
}
