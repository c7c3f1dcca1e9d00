use crate::error::ProxyError;
use crate::upstream::Endpoint;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::sync::Arc;

/// Source of healthy endpoints for a logical service. Health checking and
/// registration live behind this seam; the proxy only ever asks for the
/// current healthy set.
#[async_trait]
pub trait DiscoveryService: Send + Sync {
    async fn healthy_endpoints(&self) -> Result<Vec<Endpoint>, ProxyError>;
}

/// Fixed endpoint list with atomic hot-replacement. Suitable for embedders
/// with externally managed health state and for tests.
pub struct StaticDiscovery {
    endpoints: ArcSwap<Vec<Endpoint>>,
}

impl StaticDiscovery {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints: ArcSwap::new(Arc::new(endpoints)),
        }
    }

    /// Replace the endpoint set. In-flight requests keep the list they
    /// already loaded.
    pub fn replace(&self, endpoints: Vec<Endpoint>) {
        self.endpoints.store(Arc::new(endpoints));
    }
}

#[async_trait]
impl DiscoveryService for StaticDiscovery {
    async fn healthy_endpoints(&self) -> Result<Vec<Endpoint>, ProxyError> {
        Ok(self.endpoints.load().as_ref().clone())
    }
}
