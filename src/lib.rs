//! # reqwest-proxy-rotation
//!
//! A rotating proxy pool for reqwest.
//!
//! The pool loads HTTP, HTTPS and SOCKS proxies from list files or URLs,
//! rotates through them round-robin or at random, probes their health,
//! evicts dead proxies and cools down rate-limited ones. The
//! [`RequestExecutor`] sends requests through the pool and fails over to a
//! fresh proxy when one breaks, while [`ProxyPoolMiddleware`] plugs the same
//! logic into a `reqwest_middleware` client.

pub mod config;
pub mod error;
pub mod executor;
pub mod health;
pub mod middleware;
pub mod pool;
pub mod proxy;
pub mod rate_limit;
pub mod source;
pub mod transport;

pub use config::{ProxyPoolConfig, ProxyPoolConfigBuilder, ProxySelectionStrategy, Timeouts};
pub use error::{Error, NoProxyAvailable, ParseError};
pub use executor::{ExecutionOutcome, FailureReason, RequestExecutor};
pub use health::{HealthProber, HealthReport, ProbeResult};
pub use middleware::ProxyPoolMiddleware;
pub use pool::{LoadReport, Outcome, PoolSnapshot, ProxyPool, ProxyState};
pub use proxy::{FailureCause, ProxyCategory, ProxyId, ProxyRecord, ProxyRoute, ProxyScheme, ProxyStats};
pub use rate_limit::is_rate_limited;
pub use transport::{ReqwestTransport, RequestTemplate, Transport, TransportError, TransportResponse};
