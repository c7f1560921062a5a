//! Fixed-window rate limiting over the coordination store.
//!
//! Each `(client IP, path, calendar minute)` gets its own counter that
//! expires one minute after creation. Because the counter lives in the
//! shared store, the ceiling holds across every gateway replica. A store
//! failure admits the request: rate limiting is a guard rail, not a
//! dependency the data plane may die on.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::store::Store;

const WINDOW: Duration = Duration::from_secs(60);

pub struct RateLimiter {
    store: Arc<dyn Store>,
    requests_per_minute: u32,
}

impl RateLimiter {
    /// `burst_size` is accepted for forward compatibility; the
    /// fixed-window decision does not use it.
    pub fn new(store: Arc<dyn Store>, requests_per_minute: u32, burst_size: u32) -> Self {
        info!(rpm = requests_per_minute, burst = burst_size, "rate limiter configured");
        Self {
            store,
            requests_per_minute,
        }
    }

    /// Counts the request against its window and returns whether it is
    /// within the per-minute budget.
    pub async fn allow(&self, client_ip: IpAddr, path: &str) -> bool {
        let minute = Utc::now().timestamp() / 60;
        let key = format!("ratelimit:{client_ip}:{path}:{minute}");

        let count = match self.store.increment(&key).await {
            Ok(count) => count,
            Err(e) => {
                warn!(%client_ip, %path, error = %e, "rate limit counter unavailable, failing open");
                return true;
            }
        };

        // First hit creates the window; bound its lifetime.
        if count == 1 {
            if let Err(e) = self.store.expire(&key, WINDOW).await {
                warn!(%key, error = %e, "failed to bound rate limit window");
            }
        }

        count <= i64::from(self.requests_per_minute)
    }
}
