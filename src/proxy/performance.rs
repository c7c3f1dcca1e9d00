use crate::buffer::BufferPool;
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::proxy::context::{BoxBody, RequestContext};
use crate::proxy::pipeline::{self, ProxyCore, Transports};
use crate::proxy::sink::ResponseSink;
use crate::proxy::ProxyEngine;
use crate::stats::{ProxyStats, ProxyStatsCore, RequestStats, StatsCollector};
use crate::upstream::{
    CircuitBreakerRegistry, ConnectionPoolManager, DiscoveryService, Endpoint, EndpointSelector,
};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use http::Request;
use std::sync::Arc;

/// Throughput-first proxy engine: a dedicated transport per endpoint with
/// idle reaping, per-endpoint circuit breakers, and pooled buffers. Shares
/// the request pipeline with [`crate::proxy::SimpleEngine`].
pub struct PerformanceEngine {
    core: ProxyCore,
    pools: Arc<ConnectionPoolManager>,
    breakers: Arc<CircuitBreakerRegistry>,
    reaper: tokio::task::JoinHandle<()>,
}

impl PerformanceEngine {
    pub fn new(
        config: ProxyConfig,
        discovery: Arc<dyn DiscoveryService>,
        selector: Arc<dyn EndpointSelector>,
        collector: Arc<dyn StatsCollector>,
    ) -> Self {
        let buffers = BufferPool::new(config.stream_buffer_size);
        let shared_config = Arc::new(ArcSwap::new(Arc::new(config)));
        let pools = Arc::new(ConnectionPoolManager::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let reaper = pools.spawn_reaper(shared_config.clone());
        Self {
            core: ProxyCore {
                config: shared_config,
                stats: ProxyStatsCore::new(),
                buffers,
                discovery,
                selector,
                collector,
                transports: Transports::PerEndpoint(pools.clone()),
                breakers: Some(breakers.clone()),
                proxy_id: ProxyCore::default_proxy_id(),
            },
            pools,
            breakers,
            reaper,
        }
    }

    /// Override the identity used in `Via` headers.
    pub fn with_proxy_id(mut self, proxy_id: impl AsRef<str>) -> Self {
        self.core.proxy_id = Arc::from(proxy_id.as_ref());
        self
    }

    /// Number of live per-endpoint transports.
    pub fn pooled_transports(&self) -> usize {
        self.pools.len()
    }

    /// Breaker registry, exposed so embedders can inspect per-endpoint state.
    pub fn circuit_breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }
}

impl Drop for PerformanceEngine {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}

#[async_trait]
impl ProxyEngine for PerformanceEngine {
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
