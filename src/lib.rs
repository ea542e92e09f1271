//! # WireLink
//!
//! Pooled multiplexed gRPC client runtime for Rust.
//!
//! WireLink provides the connection core of a gRPC client stack:
//! - **Multiplexed clients**: one long-lived HTTP/2 session per
//!   [`WireClient`], carrying many concurrent logical streams with a single
//!   receiver task fanning responses out to per-stream mailboxes
//! - **Transparent reconnection**: recognized transport resets (broken
//!   pipe, connection refused, session closed) trigger one coalesced
//!   reconnect per burst when `force_reconnect` is enabled
//! - **Cooperative pooling**: a bounded, lazily-filled [`ClientPool`] with
//!   reservation-based capacity accounting and an in-flight-respecting
//!   drain
//!
//! Serialization and the HTTP/2 transport itself are collaborator
//! concerns: payloads are opaque octet strings, and the session is
//! consumed through the [`Transport`] capability trait.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use wirelink::{ClientPool, ClientSettings, Encoding, PoolConfig, WireClient, WireClientConfig};
//!
//! # fn connect_transport(host: &str, port: u16) -> Arc<dyn wirelink::Transport> { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> wirelink::Result<()> {
//!     let config = PoolConfig::new("http://127.0.0.1:50051").with_size(4);
//!     let pool = ClientPool::new(config, |host: &str, port: u16, settings: &ClientSettings| {
//!         let client_config = WireClientConfig::builder()
//!             .endpoint(format!("http://{host}:{port}"))
//!             .settings(settings.clone())
//!             .build();
//!         WireClient::new(client_config, connect_transport(host, port))
//!     });
//!     pool.fill().await;
//!
//!     let client = pool.acquire(Duration::from_secs(1)).await.unwrap();
//!     let stream_id = client
//!         .send("/echo.Echo/Ping", b"hello", Encoding::Proto)
//!         .await?;
//!     let reply = client.recv(stream_id, Duration::from_secs(3)).await?;
//!     println!("status {}: {:?}", reply.trailers.status, reply.payload);
//!     pool.release(Some(client), false).await;
//!
//!     pool.close().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod pool;
pub mod transport;

// Re-exports for convenience
pub use client::{ClientMode, Reply, WireClient};
pub use config::{ClientSettings, PoolConfig, WireClientConfig};
pub use error::{Result, WireLinkError};
pub use message::{Encoding, GrpcStatus, Trailers};
pub use pool::{ClientFactory, ClientPool, PoolStats};
pub use transport::{
    Transport, TransportError, TransportRequest, TransportResponse, TransportStats,
};

/// Current version of WireLink
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default gRPC endpoint
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:50051";

/// Default number of clients a pool may hold
pub const DEFAULT_POOL_SIZE: usize = 16;
