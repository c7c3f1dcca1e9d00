pub mod context;
pub mod flush;
pub mod headers;
pub mod path;
mod performance;
mod pipeline;
pub mod sink;
mod simple;
pub mod stream;

pub use context::{BoxBody, RequestContext};
pub use flush::{flush_decision, FlushDecision};
pub use performance::PerformanceEngine;
pub use simple::SimpleEngine;
pub use sink::{response_channel, ChannelSink, ResponseReceiver, ResponseSink};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::stats::{ProxyStats, RequestStats};
use crate::upstream::Endpoint;
use async_trait::async_trait;
use http::Request;

/// Common contract of the two proxy engines.
///
/// A request flows in with its context and per-request stats record; the
/// response streams out through the sink. Errors carry the structured
/// request fields and a category the caller can map to an HTTP status when
/// the head has not been written yet.
#[async_trait]
pub trait ProxyEngine: Send + Sync {
    /// Proxy one request against the engine's discovery service.
    async fn proxy_request(
        &self,
        ctx: &RequestContext,
        sink: &mut dyn ResponseSink,
        request: Request<BoxBody>,
        stats: &mut RequestStats,
    ) -> Result<(), ProxyError>;

    /// Proxy one request against a pre-filtered endpoint set.
    async fn proxy_request_to_endpoints(
        &self,
        ctx: &RequestContext,
        sink: &mut dyn ResponseSink,
        request: Request<BoxBody>,
        endpoints: &[Endpoint],
        stats: &mut RequestStats,
    ) -> Result<(), ProxyError>;

    /// Process-wide counter snapshot.
    fn stats(&self) -> ProxyStats;

    /// Atomically replace the configuration. In-flight requests keep the
    /// snapshot they started with.
    fn update_config(&self, config: ProxyConfig);
}
