use crate::config::CircuitBreakerConfig;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Per-endpoint circuit breakers, created lazily on first reference and
/// kept for the process lifetime. Endpoint name is the key so all requests
/// to one backend share a single breaker.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

/// Breaker state derived on demand from `(failures, last_failure, now)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Connection-failure tracker for one endpoint.
///
/// No stored state enum: the state is a pure function of the consecutive
/// failure count and the age of the last failure. All mutation is atomic,
/// so concurrent requests observe transitions in a consistent order.
pub struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    /// Milliseconds since `epoch`; only meaningful once failures > 0.
    last_failure_ms: AtomicU64,
    epoch: Instant,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    pub fn state(&self, config: &CircuitBreakerConfig) -> BreakerState {
        let failures = self.consecutive_failures.load(Ordering::Acquire);
        if failures < config.failure_threshold {
            return BreakerState::Closed;
        }
        let last = self.last_failure_ms.load(Ordering::Acquire);
        let since_failure = (self.epoch.elapsed().as_millis() as u64).saturating_sub(last);
        if since_failure >= config.open_timeout().as_millis() as u64 {
            BreakerState::HalfOpen
        } else {
            BreakerState::Open
        }
    }

    /// Whether dispatch must be rejected. Half-open admits callers; their
    /// outcome decides whether the breaker closes or re-opens.
    pub fn is_open(&self, config: &CircuitBreakerConfig) -> bool {
        self.state(config) == BreakerState::Open
    }

    /// One success closes the breaker from any state.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    /// Count a connection-level failure. Upstream 5xx responses must not be
    /// reported here.
    pub fn record_failure(&self) -> u32 {
        self.last_failure_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Release);
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self {
            breakers: DashMap::new(),
        }
    }
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, endpoint_name: &str) -> Arc<CircuitBreaker> {
        // Fast path: existing entry, no allocation.
        if let Some(entry) = self.breakers.get(endpoint_name) {
            return entry.value().clone();
        }
        self.breakers
            .entry(endpoint_name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new()))
            .clone()
    }

    pub fn is_open(&self, endpoint_name: &str, config: &CircuitBreakerConfig) -> bool {
        self.get(endpoint_name).is_open(config)
    }

    pub fn record_success(&self, endpoint_name: &str) {
        self.get(endpoint_name).record_success();
    }

    pub fn record_failure(&self, endpoint_name: &str) -> u32 {
        let count = self.get(endpoint_name).record_failure();
        tracing::debug!(
            endpoint = endpoint_name,
            consecutive_failures = count,
            "circuit_breaker: connection failure recorded"
        );
        count
    }
}
