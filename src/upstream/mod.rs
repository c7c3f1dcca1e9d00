pub mod circuit_breaker;
pub mod discovery;
pub mod endpoint;
pub mod pool;
pub mod selector;

pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerRegistry};
pub use discovery::{DiscoveryService, StaticDiscovery};
pub use endpoint::Endpoint;
pub use pool::{ConnectionPoolManager, HttpClient, PooledTransport, TransportOptions};
pub use selector::{EndpointSelector, RandomSelector, RoundRobinSelector};
