//! Bounded, lazily-filled pool of `WireClient`s.
//!
//! Capacity accounting distinguishes in-flight creation, idle, and checked
//! out: `num` is a reservation counter incremented before the factory runs
//! and rolled back on failure, so concurrent acquires cannot oversubscribe
//! the pool. Draining is cooperative and waits for in-flight users.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::WireClient;
use crate::config::{ClientSettings, PoolConfig};

/// Builds unconnected clients for the pool.
pub trait ClientFactory: Send + Sync {
    fn make(&self, host: &str, port: u16, settings: &ClientSettings) -> WireClient;
}

impl<F> ClientFactory for F
where
    F: Fn(&str, u16, &ClientSettings) -> WireClient + Send + Sync,
{
    fn make(&self, host: &str, port: u16, settings: &ClientSettings) -> WireClient {
        self(host, port, settings)
    }
}

/// Cadence of the cooperative drain poll in `close`.
const DRAIN_POLL_DELAY: Duration = Duration::from_millis(500);
/// Back-off between background creation attempts under `force_recreate`.
const RECREATE_DELAY: Duration = Duration::from_millis(500);

/// Snapshot of pool counters for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Intended capacity
    pub size: usize,
    /// Clients that exist or are being created
    pub num: usize,
    /// Clients currently checked out
    pub used: usize,
    /// Ready clients waiting in the idle channel
    pub idle: usize,
}

/// Cooperatively-shared pool of multiplexed gRPC clients.
pub struct ClientPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    factory: Box<dyn ClientFactory>,
    /// Reservation counter: incremented before the factory runs.
    num: AtomicUsize,
    used: AtomicUsize,
    idle_tx: Mutex<Option<mpsc::Sender<WireClient>>>,
    idle_rx: tokio::sync::Mutex<Option<mpsc::Receiver<WireClient>>>,
    closed: AtomicBool,
}

impl ClientPool {
    /// Create an empty pool. Clients are built lazily on `acquire` unless
    /// `fill` is called first.
    pub fn new<F: ClientFactory + 'static>(config: PoolConfig, factory: F) -> Self {
        let (idle_tx, idle_rx) = mpsc::channel(config.size.max(1));
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory: Box::new(factory),
                num: AtomicUsize::new(0),
                used: AtomicUsize::new(0),
                idle_tx: Mutex::new(Some(idle_tx)),
                idle_rx: tokio::sync::Mutex::new(Some(idle_rx)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Eagerly create clients until the pool is at capacity. Stops at the
    /// first failed creation (rolled back and logged); returns the number
    /// of clients created by this pass.
    pub async fn fill(&self) -> usize {
        let mut created = 0;
        while self.inner.num.load(Ordering::Acquire) < self.inner.config.size {
            if !make(&self.inner).await {
                break;
            }
            created += 1;
        }
        if created > 0 {
            info!(created, size = self.inner.config.size, "pool filled");
        }
        created
    }

    /// Check a client out of the pool, waiting up to `wait` for one to
    /// become available. `settings.receive_timeout` overrides `wait` when
    /// set. Returns `None` on timeout or once the pool is closed.
    pub async fn acquire(&self, wait: Duration) -> Option<WireClient> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return None;
        }
        let wait = inner.config.settings.receive_timeout.unwrap_or(wait);

        // Grow opportunistically while below capacity.
        if inner.idle_len() == 0 && inner.num.load(Ordering::Acquire) < inner.config.size {
            spawn_make(inner);
        }

        let checkout = async {
            let mut guard = inner.idle_rx.lock().await;
            match guard.as_mut() {
                Some(rx) => rx.recv().await,
                None => None,
            }
        };

        match tokio::time::timeout(wait, checkout).await {
            Ok(Some(client)) => {
                inner.used.fetch_add(1, Ordering::AcqRel);
                Some(client)
            }
            Ok(None) => None,
            Err(_) => {
                debug!("acquire timed out");
                None
            }
        }
    }

    /// Return a checked-out client to the pool.
    ///
    /// `Some(client)` goes back to the idle channel; `used` is decremented
    /// unless `is_new`. `None` signals the client is no longer viable: the
    /// capacity reservation is rolled back and a replacement creation is
    /// scheduled. After the pool has drained this is a no-op for pool
    /// state; a stray returned client is closed.
    pub async fn release(&self, client: Option<WireClient>, is_new: bool) {
        release(&self.inner, client, is_new).await;
    }

    /// Drain the pool cooperatively: wait for every checked-out client to
    /// come back, then close each idle client and the idle channel.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(size = inner.config.size, "draining client pool");

        while inner.used.load(Ordering::Acquire) > 0 {
            tokio::time::sleep(DRAIN_POLL_DELAY).await;
        }

        // Null the sender out first so late releases see the drain.
        let idle_tx = inner.idle_tx.lock().unwrap().take();
        drop(idle_tx);

        let idle_rx = inner.idle_rx.lock().await.take();
        if let Some(mut rx) = idle_rx {
            while let Ok(client) = rx.try_recv() {
                client.close().await;
                inner.num.fetch_sub(1, Ordering::AcqRel);
            }
        }
        info!("client pool closed");
    }

    pub fn size(&self) -> usize {
        self.inner.config.size
    }

    /// Clients that exist or are mid-creation.
    pub fn num(&self) -> usize {
        self.inner.num.load(Ordering::Acquire)
    }

    /// Clients currently checked out.
    pub fn used(&self) -> usize {
        self.inner.used.load(Ordering::Acquire)
    }

    /// Ready clients waiting in the idle channel.
    pub fn idle_len(&self) -> usize {
        self.inner.idle_len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.inner.config.size,
            num: self.num(),
            used: self.used(),
            idle: self.idle_len(),
        }
    }
}

impl PoolInner {
    /// Reserve one capacity slot; `false` when the pool is full.
    fn try_reserve(&self) -> bool {
        let mut num = self.num.load(Ordering::Acquire);
        loop {
            if num >= self.config.size {
                return false;
            }
            match self.num.compare_exchange_weak(
                num,
                num + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => num = current,
            }
        }
    }

    fn idle_len(&self) -> usize {
        match &*self.idle_tx.lock().unwrap() {
            Some(tx) => tx.max_capacity() - tx.capacity(),
            None => 0,
        }
    }
}

/// Create one client: reserve capacity, build, connect, and release it into
/// the idle channel as new. Failures roll the reservation back and never
/// escape.
async fn make(inner: &Arc<PoolInner>) -> bool {
    if inner.closed.load(Ordering::Acquire) {
        return false;
    }
    if !inner.try_reserve() {
        return false;
    }

    let client = inner
        .factory
        .make(inner.config.host(), inner.config.port(), &inner.config.settings);
    match client.connect().await {
        Ok(()) => {
            debug!(endpoint = %inner.config.endpoint, "pool client created");
            release(inner, Some(client), true).await;
            true
        }
        Err(err) => {
            warn!(error = %err, "pool client creation failed");
            inner.num.fetch_sub(1, Ordering::AcqRel);
            false
        }
    }
}

/// Background creation task. A single attempt unless `force_recreate` keeps
/// retrying every 500 ms until the pool closes.
fn spawn_make(inner: &Arc<PoolInner>) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        loop {
            if make(&inner).await {
                break;
            }
            if !inner.config.settings.force_recreate || inner.closed.load(Ordering::Acquire) {
                break;
            }
            tokio::time::sleep(RECREATE_DELAY).await;
        }
    });
}

async fn release(inner: &Arc<PoolInner>, client: Option<WireClient>, is_new: bool) {
    match client {
        Some(client) => {
            let idle_tx = inner.idle_tx.lock().unwrap().clone();
            match idle_tx {
                Some(tx) => {
                    // Check the client back in before it lands in the
                    // channel so `used + idle` never overshoots `num`.
                    if !is_new {
                        let _ = inner.used.fetch_update(
                            Ordering::AcqRel,
                            Ordering::Acquire,
                            |used| used.checked_sub(1),
                        );
                    }
                    if let Err(send_err) = tx.send(client).await {
                        // Drained while the client was in flight.
                        debug!("pool drained; closing returned client");
                        send_err.0.close().await;
                    }
                }
                None => {
                    debug!("pool drained; closing returned client");
                    client.close().await;
                }
            }
        }
        None => {
            if !is_new {
                let _ = inner
                    .used
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                        used.checked_sub(1)
                    });
            }
            let _ = inner
                .num
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |num| {
                    num.checked_sub(1)
                });
            debug!("client discarded; scheduling replacement");
            spawn_make(inner);
        }
    }
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("size", &self.size())
            .field("num", &self.num())
            .field("used", &self.used())
            .field("idle", &self.idle_len())
            .finish()
    }
}
