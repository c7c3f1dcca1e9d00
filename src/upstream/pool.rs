use crate::config::ProxyConfig;
use crate::proxy::context::BoxBody;
use crate::upstream::Endpoint;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub type HttpClient = Client<HttpsConnector<HttpConnector>, BoxBody>;

/// Transport sizing and dial parameters, extracted from a config snapshot.
///
/// `max_conns_per_host` and `max_idle_conns_per_host` are deliberately
/// distinct fields sourced from distinct config fields; collapsing them has
/// caused an outage before and is regression-guarded in tests.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    pub idle_conn_timeout: Duration,
    pub max_idle_conns: usize,
    pub max_conns_per_host: usize,
    pub max_idle_conns_per_host: usize,
}

impl TransportOptions {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            connect_timeout: config.connection_timeout(),
            keep_alive: config.keep_alive(),
            idle_conn_timeout: config.idle_conn_timeout(),
            max_idle_conns: config.max_idle_conns,
            max_conns_per_host: config.max_conns_per_host,
            max_idle_conns_per_host: config.max_idle_conns_per_host,
        }
    }
}

/// Build a hyper client for upstream round-trips.
///
/// Plain `http://` goes through the inner `HttpConnector`; `https://` is
/// terminated with rustls (ring, webpki roots) and negotiates HTTP/2 via
/// ALPN. TCP_NODELAY is set on dialed connections so token-sized writes are
/// not Nagle-delayed.
pub fn build_transport(opts: &TransportOptions) -> HttpClient {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(opts.keep_alive));
    http.set_connect_timeout(Some(opts.connect_timeout));
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(opts.idle_conn_timeout)
        .pool_max_idle_per_host(opts.max_idle_conns_per_host)
        .build(https)
}

/// One endpoint's dedicated transport plus its bookkeeping.
pub struct PooledTransport {
    client: HttpClient,
    /// Milliseconds since the manager's epoch.
    last_used_ms: AtomicU64,
    healthy: AtomicBool,
    /// Bounds concurrent round-trips when `max_conns_per_host > 0`.
    limiter: Option<Arc<Semaphore>>,
}

impl PooledTransport {
    fn new(opts: &TransportOptions) -> Self {
        Self {
            client: build_transport(opts),
            last_used_ms: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            limiter: (opts.max_conns_per_host > 0)
                .then(|| Arc::new(Semaphore::new(opts.max_conns_per_host))),
        }
    }

    pub fn client(&self) -> HttpClient {
        self.client.clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Relaxed);
    }

    fn touch(&self, now_ms: u64) {
        self.last_used_ms.store(now_ms, Ordering::Relaxed);
    }

    fn idle_since(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.last_used_ms.load(Ordering::Relaxed)))
    }

    /// Wait for a connection slot on this endpoint. `None` when unlimited.
    pub async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        match &self.limiter {
            Some(sem) => sem.clone().acquire_owned().await.ok(),
            None => None,
        }
    }
}

/// Per-endpoint HTTP transports with idle reaping.
///
/// Lookup is double-checked: a read-lock fast path for the common case, a
/// write-lock slow path that re-checks before inserting. The map is
/// read-dominated; per-entry state is atomic so the read lock is never held
/// across I/O.
pub struct ConnectionPoolManager {
    entries: RwLock<HashMap<String, Arc<PooledTransport>>>,
    epoch: Instant,
}

impl Default for ConnectionPoolManager {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            epoch: Instant::now(),
        }
    }
}

impl ConnectionPoolManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Fetch (or lazily build) the transport dedicated to an endpoint.
    pub fn transport(&self, endpoint: &Endpoint, opts: &TransportOptions) -> Arc<PooledTransport> {
        let now = self.now_ms();

        if let Ok(entries) = self.entries.read() {
            if let Some(entry) = entries.get(endpoint.name()) {
                if entry.is_healthy() {
                    entry.touch(now);
                    return entry.clone();
                }
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        // Double-check: another request may have built it while we waited.
        if let Some(entry) = entries.get(endpoint.name()) {
            if entry.is_healthy() {
                entry.touch(now);
                return entry.clone();
            }
        }
        let entry = Arc::new(PooledTransport::new(opts));
        entry.touch(now);
        entries.insert(endpoint.name().to_string(), entry.clone());
        tracing::debug!(endpoint = endpoint.name(), "pool: transport created");
        entry
    }

    /// Evict entries idle beyond `cutoff`, marking them unhealthy so any
    /// in-flight holder stops trusting them. Returns the eviction count.
    pub fn reap_idle(&self, cutoff: Duration) -> usize {
        let now = self.now_ms();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|name, entry| {
            if entry.idle_since(now) > cutoff {
                entry.mark_unhealthy();
                tracing::debug!(endpoint = name.as_str(), "pool: idle transport reaped");
                false
            } else {
                true
            }
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Background reaper: wakes every `idle_conn_timeout` and evicts entries
    /// idle beyond twice that. Exits when the manager is dropped.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        config: Arc<arc_swap::ArcSwap<ProxyConfig>>,
    ) -> tokio::task::JoinHandle<()> {
        let weak: Weak<ConnectionPoolManager> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let interval = config.load().idle_conn_timeout().max(Duration::from_secs(1));
                tokio::time::sleep(interval).await;
                match weak.upgrade() {
                    Some(manager) => {
                        let reaped = manager.reap_idle(interval * 2);
                        if reaped > 0 {
                            tracing::info!(reaped, "pool: reaped idle transports");
                        }
                    }
                    None => return,
                }
            }
        })
    }
}
