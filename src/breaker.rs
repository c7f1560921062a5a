//! Distributed circuit breaker, one per registered upstream.
//!
//! State lives in the coordination store so all gateway replicas share one
//! view of an upstream's health at the request path. The breaker is not
//! strictly serializable across replicas: two replicas may both record the
//! threshold failure and both transition to open. The terminal state is
//! the same, so no distributed lock is taken — a lock would serialize the
//! request path.
//!
//! Counters carry short TTLs, so a quiet period drains stale failures and
//! the breaker settles back to a clean closed state on its own.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::store::Store;

const STATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const LAST_FAILURE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const FAILURE_COUNT_TTL: Duration = Duration::from_secs(10 * 60);
const SUCCESS_COUNT_TTL: Duration = Duration::from_secs(5 * 60);

/// Breaker position for one upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests pass through.
    Closed,
    /// Upstream assumed down, requests fail fast.
    Open,
    /// Probationary: requests are admitted to test recovery.
    HalfOpen,
}

impl CircuitState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "open" => Self::Open,
            "half-open" => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

pub struct CircuitBreaker {
    store: Arc<dyn Store>,
    failure_threshold: u32,
    success_threshold: u32,
    open_timeout: Duration,
}

fn state_key(prefix: &str, name: &str) -> String {
    format!("circuit:{prefix}:{name}:state")
}

fn failures_key(prefix: &str, name: &str) -> String {
    format!("circuit:{prefix}:{name}:failures")
}

fn successes_key(prefix: &str, name: &str) -> String {
    format!("circuit:{prefix}:{name}:successes")
}

fn last_failure_key(prefix: &str, name: &str) -> String {
    format!("circuit:{prefix}:{name}:last_failure")
}

impl CircuitBreaker {
    pub fn new(
        store: Arc<dyn Store>,
        failure_threshold: u32,
        success_threshold: u32,
        open_timeout: Duration,
    ) -> Self {
        Self {
            store,
            failure_threshold,
            success_threshold,
            open_timeout,
        }
    }

    /// Whether a request may be forwarded to the upstream right now.
    ///
    /// An open breaker transitions to half-open here once the open timeout
    /// has elapsed since the last recorded failure. Store failures read as
    /// closed: breaker availability must not couple the data plane to the
    /// coordination store.
    pub async fn allow_request(&self, prefix: &str, name: &str) -> bool {
        match self.state(prefix, name).await {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = self.last_failure_ts(prefix, name).await;
                let elapsed = Utc::now().timestamp() - opened_at;
                if elapsed >= self.open_timeout.as_secs() as i64 {
                    self.set_state(prefix, name, CircuitState::HalfOpen).await;
                    info!(%prefix, upstream = %name, "circuit breaker half-open");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a successful upstream response.
    pub async fn record_success(&self, prefix: &str, name: &str) {
        match self.state(prefix, name).await {
            CircuitState::HalfOpen => {
                let successes = self.bump(&successes_key(prefix, name), SUCCESS_COUNT_TTL).await;
                if successes >= self.success_threshold as i64 {
                    self.set_state(prefix, name, CircuitState::Closed).await;
                    self.reset_counters(prefix, name).await;
                    info!(%prefix, upstream = %name, "circuit breaker closed");
                }
            }
            CircuitState::Closed => {
                self.reset_counters(prefix, name).await;
            }
            CircuitState::Open => {}
        }
    }

    /// Records a failed upstream response or transport error.
    pub async fn record_failure(&self, prefix: &str, name: &str) {
        match self.state(prefix, name).await {
            CircuitState::HalfOpen => {
                self.trip(prefix, name).await;
                warn!(%prefix, upstream = %name, "circuit breaker reopened");
            }
            CircuitState::Closed => {
                let failures = self.bump(&failures_key(prefix, name), FAILURE_COUNT_TTL).await;
                if failures >= self.failure_threshold as i64 {
                    self.trip(prefix, name).await;
                    warn!(%prefix, upstream = %name, failures, "circuit breaker opened");
                }
            }
            CircuitState::Open => {}
        }
    }

    async fn state(&self, prefix: &str, name: &str) -> CircuitState {
        match self.store.get(&state_key(prefix, name)).await {
            Ok(Some(value)) => CircuitState::parse(&value),
            Ok(None) => CircuitState::Closed,
            Err(e) => {
                warn!(%prefix, upstream = %name, error = %e, "breaker state read failed, treating as closed");
                CircuitState::Closed
            }
        }
    }

    async fn set_state(&self, prefix: &str, name: &str, state: CircuitState) {
        if let Err(e) = self
            .store
            .set(&state_key(prefix, name), state.as_str(), Some(STATE_TTL))
            .await
        {
            warn!(%prefix, upstream = %name, error = %e, "failed to write breaker state");
        }
    }

    /// Transitions to open and stamps the failure time the open timeout
    /// counts from.
    async fn trip(&self, prefix: &str, name: &str) {
        self.set_state(prefix, name, CircuitState::Open).await;
        if let Err(e) = self
            .store
            .set(
                &last_failure_key(prefix, name),
                &Utc::now().timestamp().to_string(),
                Some(LAST_FAILURE_TTL),
            )
            .await
        {
            warn!(%prefix, upstream = %name, error = %e, "failed to stamp breaker failure time");
        }
    }

    /// Increments a TTL-bounded counter; zero on store failure so a flaky
    /// store cannot trip or close a breaker by itself.
    async fn bump(&self, key: &str, ttl: Duration) -> i64 {
        match self.store.increment(key).await {
            Ok(count) => {
                if let Err(e) = self.store.expire(key, ttl).await {
                    warn!(%key, error = %e, "failed to bound breaker counter");
                }
                count
            }
            Err(e) => {
                warn!(%key, error = %e, "breaker counter increment failed");
                0
            }
        }
    }

    async fn reset_counters(&self, prefix: &str, name: &str) {
        if let Err(e) = self
            .store
            .delete(&[failures_key(prefix, name), successes_key(prefix, name)])
            .await
        {
            warn!(%prefix, upstream = %name, error = %e, "failed to reset breaker counters");
        }
    }

    async fn last_failure_ts(&self, prefix: &str, name: &str) -> i64 {
        match self.store.get(&last_failure_key(prefix, name)).await {
            Ok(Some(value)) => value.parse().unwrap_or(0),
            _ => 0,
        }
    }
}
