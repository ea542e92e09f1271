//! WireLink client and pool configuration

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::client::ClientMode;

/// Tunables applied to every client (and consumed by the pool for its own
/// `force_reconnect` / `receive_timeout` / `force_recreate` behavior).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Per-call transport timeout
    pub timeout: Duration,
    /// Detect half-closed peers on idle sessions
    pub open_eof_check: bool,
    /// Maximum accepted message size in octets
    pub package_max_length: usize,
    /// HTTP/2 concurrent stream limit advertised to the transport
    pub http2_max_concurrent_streams: u32,
    /// HTTP/2 maximum frame size in octets
    pub http2_max_frame_size: u32,
    /// Submission attempts before `send` gives up
    pub max_retries: u32,
    /// Reconnect transparently on EPIPE / connection-refused / session-closed
    pub force_reconnect: bool,
    /// When set, overrides the caller-supplied timeout in `recv` and
    /// `acquire`. `Some(Duration::ZERO)` polls and returns immediately.
    pub receive_timeout: Option<Duration>,
    /// Pool only: keep retrying failed background creations every 500 ms
    pub force_recreate: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            open_eof_check: true,
            package_max_length: 2 * 1024 * 1024,
            http2_max_concurrent_streams: 1000,
            http2_max_frame_size: 2 * 1024 * 1024,
            max_retries: 10,
            force_reconnect: false,
            receive_timeout: None,
            force_recreate: false,
        }
    }
}

/// Configuration for a single WireLink client connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireClientConfig {
    /// gRPC endpoint URL (host + port)
    pub endpoint: Url,
    /// Whether `send` ends the request stream or leaves it open for `push`
    pub mode: ClientMode,
    /// User agent string
    pub user_agent: String,
    /// Transport and retry tunables
    pub settings: ClientSettings,
}

impl Default for WireClientConfig {
    fn default() -> Self {
        Self {
            endpoint: Url::parse(crate::DEFAULT_ENDPOINT).unwrap(),
            mode: ClientMode::Unary,
            user_agent: format!("grpc-wirelink/{}", crate::VERSION),
            settings: ClientSettings::default(),
        }
    }
}

/// Builder for WireClientConfig
pub struct WireClientConfigBuilder {
    config: WireClientConfig,
}

impl Default for WireClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WireClientConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: WireClientConfig::default(),
        }
    }

    /// Set the endpoint URL
    pub fn endpoint<S: AsRef<str>>(mut self, endpoint: S) -> Self {
        self.config.endpoint = Url::parse(endpoint.as_ref()).expect("Invalid endpoint URL");
        self
    }

    /// Unary mode: `send` ends the request stream (default)
    pub fn unary(mut self) -> Self {
        self.config.mode = ClientMode::Unary;
        self
    }

    /// Streaming mode: the request stream stays open for `push`es
    pub fn streaming(mut self) -> Self {
        self.config.mode = ClientMode::Streaming;
        self
    }

    /// Set custom user agent
    pub fn user_agent<S: Into<String>>(mut self, user_agent: S) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Set the per-call transport timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.settings.timeout = timeout;
        self
    }

    /// Override the caller-supplied timeout for `recv` and `acquire`
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.config.settings.receive_timeout = Some(timeout);
        self
    }

    /// Set the submission retry budget
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.settings.max_retries = max_retries;
        self
    }

    /// Reconnect transparently on recognized transport resets
    pub fn with_force_reconnect(mut self) -> Self {
        self.config.settings.force_reconnect = true;
        self
    }

    /// Surface transport resets to the caller instead of reconnecting
    pub fn without_force_reconnect(mut self) -> Self {
        self.config.settings.force_reconnect = false;
        self
    }

    /// Replace the full settings block
    pub fn settings(mut self, settings: ClientSettings) -> Self {
        self.config.settings = settings;
        self
    }

    /// Build the configuration
    pub fn build(self) -> WireClientConfig {
        self.config
    }
}

impl WireClientConfig {
    /// Create a new builder
    pub fn builder() -> WireClientConfigBuilder {
        WireClientConfigBuilder::new()
    }

    /// Endpoint host
    pub fn host(&self) -> &str {
        self.endpoint.host_str().unwrap_or("localhost")
    }

    /// Endpoint port, falling back to the scheme default
    pub fn port(&self) -> u16 {
        self.endpoint.port_or_known_default().unwrap_or(50051)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.scheme() != "https" && self.endpoint.scheme() != "http" {
            return Err(anyhow::anyhow!(
                "Invalid endpoint scheme: {}",
                self.endpoint.scheme()
            ));
        }

        if self.endpoint.host_str().is_none() {
            return Err(anyhow::anyhow!("Endpoint has no host"));
        }

        if self.settings.timeout.is_zero() {
            return Err(anyhow::anyhow!("Timeout cannot be zero"));
        }

        if self.settings.max_retries == 0 {
            return Err(anyhow::anyhow!("Max retries must be greater than 0"));
        }

        if self.settings.package_max_length == 0 {
            return Err(anyhow::anyhow!("Package max length must be greater than 0"));
        }

        Ok(())
    }
}

/// Configuration for a client pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Endpoint every pooled client connects to
    pub endpoint: Url,
    /// Intended pool capacity
    pub size: usize,
    /// Settings shared by the pool and the clients it creates
    pub settings: ClientSettings,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            endpoint: Url::parse(crate::DEFAULT_ENDPOINT).unwrap(),
            size: crate::DEFAULT_POOL_SIZE,
            settings: ClientSettings::default(),
        }
    }
}

impl PoolConfig {
    /// Pool config for the given endpoint with default capacity
    pub fn new<S: AsRef<str>>(endpoint: S) -> Self {
        Self {
            endpoint: Url::parse(endpoint.as_ref()).expect("Invalid endpoint URL"),
            ..Self::default()
        }
    }

    /// Set the pool capacity
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Replace the settings block
    pub fn with_settings(mut self, settings: ClientSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Endpoint host
    pub fn host(&self) -> &str {
        self.endpoint.host_str().unwrap_or("localhost")
    }

    /// Endpoint port, falling back to the scheme default
    pub fn port(&self) -> u16 {
        self.endpoint.port_or_known_default().unwrap_or(50051)
    }
}
