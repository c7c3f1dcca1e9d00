//! Streaming reverse-proxy core for LLM inference gateways.
//!
//! Accepts a client request, picks one healthy backend, forwards the
//! request, and streams the response back token by token, distinguishing
//! client disconnects from backend stalls along the way. Two engines share
//! one pipeline contract: [`proxy::SimpleEngine`] (shared transport) and
//! [`proxy::PerformanceEngine`] (per-endpoint pools and circuit breakers).
//!
//! Discovery, endpoint selection, and stats sinks are consumed through the
//! traits in [`upstream`] and [`stats`]; in-tree defaults cover embedding
//! and tests.

pub mod buffer;
pub mod config;
pub mod error;
pub mod proxy;
pub mod stats;
pub mod upstream;

pub use config::{CircuitBreakerConfig, ProxyConfig, StreamProfile};
pub use error::{ErrorCategory, ProxyError};
pub use proxy::{
    response_channel, BoxBody, ChannelSink, PerformanceEngine, ProxyEngine, RequestContext,
    ResponseSink, SimpleEngine,
};
pub use stats::{ProxyStats, RequestStats, StatsCollector};
pub use upstream::{
    DiscoveryService, Endpoint, EndpointSelector, RandomSelector, RoundRobinSelector,
    StaticDiscovery,
};
