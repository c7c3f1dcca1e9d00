use crate::upstream::Endpoint;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Outcome of a single proxied request, as reported to stats sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Success,
    Failure,
}

impl RequestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Point-in-time snapshot of process-wide proxy counters. Individual fields
/// are each consistent; cross-field consistency is not guaranteed (`total`
/// may briefly exceed `successful + failed` by one mid-request).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProxyStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_latency_ms: u64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
}

/// Lock-free aggregate counters shared by every request through an engine.
///
/// `total_requests` is bumped exactly once at pipeline entry, before any
/// other work; success/failure is recorded exactly once on the way out.
#[derive(Debug, Default)]
pub struct ProxyStatsCore {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_latency_ms: AtomicU64,
    /// 0 means unset; first recorded latency claims it via CAS.
    min_latency_ms: AtomicU64,
    max_latency_ms: AtomicU64,
}

impl ProxyStatsCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request_start(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, latency_ms: u64) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);

        let mut min = self.min_latency_ms.load(Ordering::Relaxed);
        while min == 0 || latency_ms < min {
            match self.min_latency_ms.compare_exchange_weak(
                min,
                latency_ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => min = observed,
            }
        }

        let mut max = self.max_latency_ms.load(Ordering::Relaxed);
        while latency_ms > max {
            match self.max_latency_ms.compare_exchange_weak(
                max,
                latency_ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => max = observed,
            }
        }
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProxyStats {
        let successful = self.successful_requests.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);
        ProxyStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: successful,
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            average_latency_ms: total_latency / successful.max(1),
            min_latency_ms: self.min_latency_ms.load(Ordering::Relaxed),
            max_latency_ms: self.max_latency_ms.load(Ordering::Relaxed),
        }
    }
}

/// Per-request mutable record. Allocated per request, populated as the
/// pipeline progresses, surfaced to the caller on return.
#[derive(Debug, Clone)]
pub struct RequestStats {
    pub request_id: String,
    pub start: Instant,
    pub endpoint_name: String,
    pub target_url: String,
    pub total_bytes: u64,
    pub selection: Duration,
    pub header_processing: Duration,
    pub request_processing: Duration,
    pub backend_response: Duration,
    /// Delay until the first non-empty body chunk, when any data arrived.
    pub first_data: Option<Duration>,
    pub streaming: Duration,
    pub total: Duration,
}

impl RequestStats {
    pub fn new() -> Self {
        Self {
            request_id: String::new(),
            start: Instant::now(),
            endpoint_name: String::new(),
            target_url: String::new(),
            total_bytes: 0,
            selection: Duration::ZERO,
            header_processing: Duration::ZERO,
            request_processing: Duration::ZERO,
            backend_response: Duration::ZERO,
            first_data: None,
            streaming: Duration::ZERO,
            total: Duration::ZERO,
        }
    }
}

impl Default for RequestStats {
    fn default() -> Self {
        Self::new()
    }
}

/// External stats sink. The proxy reports per-request outcomes and
/// connection-count deltas; aggregation and exposition are the sink's
/// concern.
pub trait StatsCollector: Send + Sync {
    fn record_request(
        &self,
        endpoint: &Endpoint,
        outcome: RequestOutcome,
        duration: Duration,
        bytes: u64,
    );

    fn record_connection(&self, endpoint: &Endpoint, delta: i64);
}

/// No-op sink for embedders that do their own accounting elsewhere.
#[derive(Debug, Default)]
pub struct NullStatsCollector;

impl StatsCollector for NullStatsCollector {
    fn record_request(&self, _: &Endpoint, _: RequestOutcome, _: Duration, _: u64) {}

    fn record_connection(&self, _: &Endpoint, _: i64) {}
}

/// In-memory sink keyed by endpoint name. Used by the integration tests and
/// handy for embedders that only need process-local numbers.
#[derive(Debug, Default)]
pub struct InMemoryStatsCollector {
    requests: DashMap<String, EndpointCounters>,
}

#[derive(Debug, Default)]
struct EndpointCounters {
    successes: AtomicU64,
    failures: AtomicU64,
    bytes: AtomicU64,
    active_connections: AtomicI64,
}

impl InMemoryStatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn successes(&self, endpoint_name: &str) -> u64 {
        self.requests
            .get(endpoint_name)
            .map(|c| c.successes.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn failures(&self, endpoint_name: &str) -> u64 {
        self.requests
            .get(endpoint_name)
            .map(|c| c.failures.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn bytes(&self, endpoint_name: &str) -> u64 {
        self.requests
            .get(endpoint_name)
            .map(|c| c.bytes.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Net connection delta for an endpoint. Zero once all requests finish.
    pub fn active_connections(&self, endpoint_name: &str) -> i64 {
        self.requests
            .get(endpoint_name)
            .map(|c| c.active_connections.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl StatsCollector for InMemoryStatsCollector {
    fn record_request(
        &self,
        endpoint: &Endpoint,
        outcome: RequestOutcome,
        _duration: Duration,
        bytes: u64,
    ) {
        let counters = self
            .requests
            .entry(endpoint.name().to_string())
            .or_default();
        match outcome {
            RequestOutcome::Success => counters.successes.fetch_add(1, Ordering::Relaxed),
            RequestOutcome::Failure => counters.failures.fetch_add(1, Ordering::Relaxed),
        };
        counters.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn record_connection(&self, endpoint: &Endpoint, delta: i64) {
        let counters = self
            .requests
            .entry(endpoint.name().to_string())
            .or_default();
        counters.active_connections.fetch_add(delta, Ordering::Relaxed);
    }
}
