use crate::buffer::BufferPool;
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::proxy::context::{BoxBody, RequestContext};
use crate::proxy::pipeline::{self, ProxyCore, Transports};
use crate::proxy::sink::ResponseSink;
use crate::proxy::ProxyEngine;
use crate::stats::{ProxyStats, ProxyStatsCore, RequestStats, StatsCollector};
use crate::upstream::pool::build_transport;
use crate::upstream::{DiscoveryService, Endpoint, EndpointSelector, TransportOptions};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use http::Request;
use std::sync::Arc;

/// Clarity-first proxy engine: one shared transport for every endpoint, a
/// single buffer pool, and no circuit breaker. The pipeline, header and
/// stats machinery are identical to the performance engine's.
pub struct SimpleEngine {
    core: ProxyCore,
}

impl SimpleEngine {
    pub fn new(
        config: ProxyConfig,
        discovery: Arc<dyn DiscoveryService>,
        selector: Arc<dyn EndpointSelector>,
        collector: Arc<dyn StatsCollector>,
    ) -> Self {
        let client = build_transport(&TransportOptions::from_config(&config));
        let buffers = BufferPool::new(config.stream_buffer_size);
        Self {
            core: ProxyCore {
                config: Arc::new(ArcSwap::new(Arc::new(config))),
                stats: ProxyStatsCore::new(),
                buffers,
                discovery,
                selector,
                collector,
                transports: Transports::Shared(ArcSwap::new(Arc::new(client))),
                breakers: None,
                proxy_id: ProxyCore::default_proxy_id(),
            },
        }
    }

    /// Override the identity used in `Via` headers.
    pub fn with_proxy_id(mut self, proxy_id: impl AsRef<str>) -> Self {
        self.core.proxy_id = Arc::from(proxy_id.as_ref());
        self
    }
}

#[async_trait]
impl ProxyEngine for SimpleEngine {
    async fn proxy_request(
        &self,
        ctx: &RequestContext,
        sink: &mut dyn ResponseSink,
        request: Request<BoxBody>,
        stats: &mut RequestStats,
    ) -> Result<(), ProxyError> {
        pipeline::run(&self.core, ctx, sink, request, None, stats).await
    }

    async fn proxy_request_to_endpoints(
        &self,
        ctx: &RequestContext,
        sink: &mut dyn ResponseSink,
        request: Request<BoxBody>,
        endpoints: &[Endpoint],
        stats: &mut RequestStats,
    ) -> Result<(), ProxyError> {
        pipeline::run(&self.core, ctx, sink, request, Some(endpoints.to_vec()), stats).await
    }

    fn stats(&self) -> ProxyStats {
        self.core.stats.snapshot()
    }

    fn update_config(&self, config: ProxyConfig) {
        self.core.update_config(config);
    }
}
