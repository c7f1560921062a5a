//! An API gateway built on [hyper] and [tokio].
//!
//! This crate provides the request-plane pipeline of a reverse proxy that
//! fronts a fleet of backend HTTP services: longest-prefix path routing,
//! round-robin selection over healthy upstreams, circuit breaking, rate
//! limiting, response caching, per-prefix authentication, a background
//! health checker, and Prometheus metrics.
//!
//! All cross-request state — the service registry, round-robin cursors,
//! circuit state, rate-limit windows, cached responses — lives in a shared
//! key-value store behind the [`store::Store`] trait, so multiple gateway
//! replicas observe one routing view and coordinate without in-process
//! locks. [`store::RedisStore`] is the production backend;
//! [`store::MemoryStore`] serves single-replica deployments and tests.
//!
//! [hyper]: https://hyper.rs/
//! [tokio]: https://tokio.rs/

pub mod auth;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod error;
pub mod headers;
pub mod health;
pub mod limiter;
pub mod metrics;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod server;
pub mod store;

pub use auth::{AuthConfig, AuthGate};
pub use breaker::{CircuitBreaker, CircuitState};
pub use cache::{CachedResponse, ResponseCache};
pub use config::{Config, RuntimeConfig};
pub use error::GatewayError;
pub use health::HealthChecker;
pub use limiter::RateLimiter;
pub use metrics::Metrics;
pub use proxy::{BoxBody, HttpClient, ProxyEngine, build_client};
pub use registry::{Registry, Upstream};
pub use router::{RouteMatch, Router};
pub use server::{ServerState, handle_request, serve, shutdown_signal};
pub use store::{BatchOp, MemoryStore, RedisStore, Store};

pub type Result<T> = std::result::Result<T, GatewayError>;
