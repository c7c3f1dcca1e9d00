use serde::{Deserialize, Serialize};
use std::time::Duration;


/// Flush policy profile for response streaming.
///
/// - `auto`: decide per response from the upstream `Content-Type` (and the
///   request's stream hint, when present).
/// - `streaming`: flush after every chunk unconditionally.
/// - `standard`: never flush; chunks coalesce into full buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamProfile {
    #[default]
    Auto,
    Streaming,
    Standard,
}

/// Proxy configuration snapshot.
///
/// Consumers hold this behind an `arc_swap::ArcSwap`: `update_config` swaps
/// the whole snapshot atomically and in-flight requests keep the `Arc` they
/// loaded at entry. Timeouts are float seconds; `0` disables where noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Total upstream timeout in seconds. 0 = unlimited.
    #[serde(default)]
    pub response_timeout: f64,

    /// Maximum gap between successive body chunks, in seconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout: f64,

    /// I/O buffer size per streaming read, in bytes.
    #[serde(default = "default_stream_buffer_size")]
    pub stream_buffer_size: usize,

    /// Path prefix removed before dispatch (literal match, no normalization).
    #[serde(default)]
    pub proxy_prefix: String,

    #[serde(default)]
    pub profile: StreamProfile,

    /// Idle connection timeout in seconds (performance engine pools).
    #[serde(default = "default_idle_conn_timeout")]
    pub idle_conn_timeout: f64,

    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: usize,

    /// Upper bound on concurrent connections per upstream host. 0 = unlimited.
    #[serde(default = "default_max_conns_per_host")]
    pub max_conns_per_host: usize,

    /// Idle pool size per upstream host. Distinct from `max_conns_per_host`;
    /// the two must never be collapsed into one field.
    #[serde(default = "default_max_idle_conns_per_host")]
    pub max_idle_conns_per_host: usize,

    /// TCP dial timeout in seconds.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: f64,

    /// TCP keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: f64,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            response_timeout: 0.0,
            read_timeout: default_read_timeout(),
            stream_buffer_size: default_stream_buffer_size(),
            proxy_prefix: String::new(),
            profile: StreamProfile::default(),
            idle_conn_timeout: default_idle_conn_timeout(),
            max_idle_conns: default_max_idle_conns(),
            max_conns_per_host: default_max_conns_per_host(),
            max_idle_conns_per_host: default_max_idle_conns_per_host(),
            connection_timeout: default_connection_timeout(),
            keep_alive: default_keep_alive(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Total upstream timeout. `None` when unlimited.
    pub fn response_timeout(&self) -> Option<Duration> {
        duration_opt(self.response_timeout)
    }

    /// Per-chunk read timeout. `None` disables stall detection.
    pub fn read_timeout(&self) -> Option<Duration> {
        duration_opt(self.read_timeout)
    }

    pub fn idle_conn_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.idle_conn_timeout)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connection_timeout)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs_f64(self.keep_alive)
    }
}

/// Per-endpoint circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive connection-level failures before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds to hold the breaker open before admitting a half-open probe.
    #[serde(default = "default_open_timeout")]
    pub open_timeout: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout: default_open_timeout(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.open_timeout)
    }
}

fn duration_opt(secs: f64) -> Option<Duration> {
    if secs > 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

fn default_read_timeout() -> f64 {
    60.0
}

fn default_stream_buffer_size() -> usize {
    8 * 1024
}

fn default_idle_conn_timeout() -> f64 {
    90.0
}

fn default_max_idle_conns() -> usize {
    100
}

fn default_max_conns_per_host() -> usize {
    0
}

fn default_max_idle_conns_per_host() -> usize {
    10
}

fn default_connection_timeout() -> f64 {
    10.0
}

fn default_keep_alive() -> f64 {
    30.0
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_timeout() -> f64 {
    30.0
}
