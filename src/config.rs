//! Configuration loading, validation, and environment overrides.
//!
//! The gateway reads its YAML configuration once at startup, applies the
//! `REDIS_HOST` / `PORT` / `ENVIRONMENT` environment overrides, and
//! validates everything into a [`RuntimeConfig`] with parsed durations so
//! the hot path never touches the filesystem or re-parses values.

use crate::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Raw configuration as deserialized from the YAML file.
///
/// Every section is optional in the file; omitted sections take the
/// defaults below. After loading, the config is transformed into a
/// [`RuntimeConfig`] shared across all request handlers via `Arc`.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// TCP port the gateway listens on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Deployment environment, `development` or `production`.
    #[serde(default = "default_environment")]
    pub environment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
    /// Connection pool size shared by all request handlers.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckConfig {
    /// Seconds between probe rounds.
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    /// Path appended to each upstream URL when probing.
    #[serde(default = "default_health_path")]
    pub path: String,
    /// Total per-probe timeout in seconds.
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `closed` before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Successes in `half-open` before the breaker closes.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Seconds an open breaker waits before admitting a probe request.
    #[serde(default = "default_open_timeout")]
    pub open_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Request ceiling per client IP and path in one calendar minute.
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,
    /// Accepted for forward compatibility; the fixed-window decision
    /// ignores it.
    #[serde(default = "default_burst")]
    pub burst_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Seconds a cached upstream response stays servable.
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutsConfig {
    /// Store connection establishment timeout in seconds.
    #[serde(default = "default_kvs_connect")]
    pub kvs_connect_secs: u64,
    /// Per-operation store read/write timeout in seconds.
    #[serde(default = "default_kvs_op")]
    pub kvs_op_secs: u64,
    /// Seconds to drain in-flight requests on shutdown before force-closing.
    #[serde(default = "default_shutdown_drain")]
    pub shutdown_drain_secs: u64,
}

fn default_port() -> u16 {
    8080
}
fn default_environment() -> String {
    "development".into()
}
fn default_redis_host() -> String {
    "127.0.0.1".into()
}
fn default_redis_port() -> u16 {
    6379
}
fn default_pool_size() -> usize {
    16
}
fn default_health_interval() -> u64 {
    30
}
fn default_health_path() -> String {
    "/health".into()
}
fn default_health_timeout() -> u64 {
    5
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_open_timeout() -> u64 {
    60
}
fn default_rpm() -> u32 {
    100
}
fn default_burst() -> u32 {
    10
}
fn default_cache_ttl() -> u64 {
    300
}
fn default_kvs_connect() -> u64 {
    5
}
fn default_kvs_op() -> u64 {
    3
}
fn default_shutdown_drain() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            environment: default_environment(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            db: 0,
            pool_size: default_pool_size(),
        }
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            path: default_health_path(),
            timeout_secs: default_health_timeout(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_timeout_secs: default_open_timeout(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_rpm(),
            burst_size: default_burst(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            kvs_connect_secs: default_kvs_connect(),
            kvs_op_secs: default_kvs_op(),
            shutdown_drain_secs: default_shutdown_drain(),
        }
    }
}

/// Fully validated, ready-to-use configuration.
///
/// Created once at startup and shared across all components via `Arc`.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub port: u16,
    pub environment: String,
    pub redis_url: String,
    pub redis_pool_size: usize,
    pub health_interval: Duration,
    pub health_path: String,
    pub health_timeout: Duration,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
    pub requests_per_minute: u32,
    pub burst_size: u32,
    pub cache_ttl: Duration,
    pub kvs_connect_timeout: Duration,
    pub kvs_op_timeout: Duration,
    pub shutdown_drain: Duration,
}

impl Config {
    /// Loads configuration from a YAML file at the given path.
    ///
    /// Returns a [`GatewayError::Config`] if the file cannot be opened or
    /// its contents fail YAML deserialization.
    pub fn load_from_file(file_path: &(impl AsRef<Path> + ?Sized)) -> Result<Self> {
        let file = std::fs::File::open(file_path).map_err(|e| {
            GatewayError::Config(format!(
                "failed to open {}: {e}",
                file_path.as_ref().display()
            ))
        })?;

        serde_yaml::from_reader(file)
            .map_err(|e| GatewayError::Config(format!("failed to parse config: {e}")))
    }

    /// Applies the environment overrides from the deployment contract:
    /// `REDIS_HOST`, `PORT`, and `ENVIRONMENT`.
    pub fn apply_env(mut self) -> Self {
        if let Ok(host) = std::env::var("REDIS_HOST") {
            if !host.is_empty() {
                self.redis.host = host;
            }
        }
        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Ok(env) = std::env::var("ENVIRONMENT") {
            if !env.is_empty() {
                self.server.environment = env;
            }
        }
        self
    }

    /// Validates all fields and produces a [`RuntimeConfig`].
    ///
    /// Fails if any threshold or interval that must be non-zero is zero.
    pub fn into_runtime(self) -> Result<RuntimeConfig> {
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(GatewayError::Config(
                "circuit_breaker.failure_threshold must be non-zero".into(),
            ));
        }
        if self.circuit_breaker.success_threshold == 0 {
            return Err(GatewayError::Config(
                "circuit_breaker.success_threshold must be non-zero".into(),
            ));
        }
        if self.rate_limit.requests_per_minute == 0 {
            return Err(GatewayError::Config(
                "rate_limit.requests_per_minute must be non-zero".into(),
            ));
        }
        if self.health_check.interval_secs == 0 {
            return Err(GatewayError::Config(
                "health_check.interval_secs must be non-zero".into(),
            ));
        }
        if !self.health_check.path.starts_with('/') {
            return Err(GatewayError::Config(
                "health_check.path must start with '/'".into(),
            ));
        }

        let auth_part = match &self.redis.password {
            Some(password) => format!(":{password}@"),
            None => String::new(),
        };
        let redis_url = format!(
            "redis://{auth_part}{}:{}/{}",
            self.redis.host, self.redis.port, self.redis.db
        );

        Ok(RuntimeConfig {
            port: self.server.port,
            environment: self.server.environment,
            redis_url,
            redis_pool_size: self.redis.pool_size,
            health_interval: Duration::from_secs(self.health_check.interval_secs),
            health_path: self.health_check.path,
            health_timeout: Duration::from_secs(self.health_check.timeout_secs),
            failure_threshold: self.circuit_breaker.failure_threshold,
            success_threshold: self.circuit_breaker.success_threshold,
            open_timeout: Duration::from_secs(self.circuit_breaker.open_timeout_secs),
            requests_per_minute: self.rate_limit.requests_per_minute,
            burst_size: self.rate_limit.burst_size,
            cache_ttl: Duration::from_secs(self.cache.ttl_secs),
            kvs_connect_timeout: Duration::from_secs(self.timeouts.kvs_connect_secs),
            kvs_op_timeout: Duration::from_secs(self.timeouts.kvs_op_secs),
            shutdown_drain: Duration::from_secs(self.timeouts.shutdown_drain_secs),
        })
    }
}
