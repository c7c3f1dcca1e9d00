use crate::error::{ErrorCategory, ProxyError};
use crate::upstream::Endpoint;
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Endpoint-selection policy. The pipeline hands the selector the healthy
/// set and forwards connection-count hooks; the pipeline is the only caller
/// of `increment_connections`/`decrement_connections`.
#[async_trait]
pub trait EndpointSelector: Send + Sync {
    async fn select(&self, endpoints: &[Endpoint]) -> Result<Endpoint, ProxyError>;

    fn increment_connections(&self, endpoint: &Endpoint) {
        endpoint.inc_active();
    }

    fn decrement_connections(&self, endpoint: &Endpoint) {
        endpoint.dec_active();
    }
}

fn empty_set_error() -> ProxyError {
    ProxyError::new(
        ErrorCategory::SelectionFailed,
        "selection failed: no endpoints to select from",
    )
}

/// Rotating cursor over whatever set it is handed. The cursor survives
/// changes in set size; an atomic fetch-add keeps picks contention-free.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    cursor: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EndpointSelector for RoundRobinSelector {
    async fn select(&self, endpoints: &[Endpoint]) -> Result<Endpoint, ProxyError> {
        if endpoints.is_empty() {
            return Err(empty_set_error());
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % endpoints.len();
        Ok(endpoints[idx].clone())
    }
}

/// Uniform random pick.
#[derive(Debug, Default)]
pub struct RandomSelector;

impl RandomSelector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EndpointSelector for RandomSelector {
    async fn select(&self, endpoints: &[Endpoint]) -> Result<Endpoint, ProxyError> {
        if endpoints.is_empty() {
            return Err(empty_set_error());
        }
        let idx = rand::thread_rng().gen_range(0..endpoints.len());
        Ok(endpoints[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(n: usize) -> Vec<Endpoint> {
        (0..n)
            .map(|i| {
                Endpoint::parse(
                    format!("ep-{i}"),
                    &format!("http://127.0.0.1:{}", 9000 + i),
                    "ollama",
                )
                .unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_round_robin_rotates() {
        let selector = RoundRobinSelector::new();
        let eps = endpoints(3);
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(selector.select(&eps).await.unwrap().name().to_string());
        }
        assert_eq!(seen[0], seen[3]);
        assert_eq!(seen[1], seen[4]);
        assert_ne!(seen[0], seen[1]);
    }

    #[tokio::test]
    async fn test_empty_set_fails() {
        let selector = RoundRobinSelector::new();
        let err = selector.select(&[]).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::SelectionFailed);
    }

    #[tokio::test]
    async fn test_random_stays_in_bounds() {
        let selector = RandomSelector::new();
        let eps = endpoints(2);
        for _ in 0..20 {
            let picked = selector.select(&eps).await.unwrap();
            assert!(picked.name() == "ep-0" || picked.name() == "ep-1");
        }
    }
}
