//! Background health checker.
//!
//! Probes every registered upstream on a fixed interval and writes the
//! verdict through the registry, flipping `healthy` on a single failed or
//! successful probe. There is no flap damping here on purpose:
//! request-path stabilization is the circuit breaker's job.
//!
//! The checker owns its own HTTP client so a stuck probe can never starve
//! the forwarding pool.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use http_body_util::Empty;
use hyper::Uri;
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::registry::Registry;

type ProbeClient = Client<HttpConnector, Empty<Bytes>>;

pub struct HealthChecker {
    registry: Arc<Registry>,
    client: ProbeClient,
    interval: Duration,
    path: String,
    probe_timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<Registry>,
        interval: Duration,
        path: String,
        probe_timeout: Duration,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            registry,
            client,
            interval,
            path,
            probe_timeout,
        }
    }

    /// Runs probe rounds until `shutdown` resolves.
    ///
    /// Shutdown is observed between rounds, so a round already underway
    /// finishes its in-flight probes before the task exits.
    pub fn spawn(self, shutdown: impl Future<Output = ()> + Send + 'static) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tokio::pin!(shutdown);

            info!(interval = ?self.interval, path = %self.path, "health checker started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = &mut shutdown => {
                        info!("health checker stopped");
                        break;
                    }
                }
                self.run_once().await;
            }
        })
    }

    /// One full probe round over every registered upstream.
    ///
    /// Probes run concurrently; a slow upstream delays only its own
    /// verdict. Registry read or write failures are logged and skipped —
    /// upstreams keep their last known health rather than flapping on
    /// store trouble.
    pub async fn run_once(&self) {
        let prefixes = match self.registry.list_prefixes().await {
            Ok(prefixes) => prefixes,
            Err(e) => {
                warn!(error = %e, "health round skipped, failed to list prefixes");
                return;
            }
        };

        let mut probes = JoinSet::new();
        for prefix in prefixes {
            let upstreams = match self.registry.list_upstreams(&prefix).await {
                Ok(upstreams) => upstreams,
                Err(e) => {
                    warn!(%prefix, error = %e, "health round skipped for prefix");
                    continue;
                }
            };

            for upstream in upstreams {
                let client = self.client.clone();
                let path = self.path.clone();
                let timeout = self.probe_timeout;
                let prefix = prefix.clone();
                probes.spawn(async move {
                    let healthy = probe(&client, &upstream.url, &path, timeout).await;
                    (prefix, upstream.name, healthy)
                });
            }
        }

        while let Some(result) = probes.join_next().await {
            let Ok((prefix, name, healthy)) = result else {
                continue;
            };
            if !healthy {
                warn!(%prefix, upstream = %name, "upstream failed health probe");
            }
            if let Err(e) = self
                .registry
                .update_health(&prefix, &name, healthy, Utc::now())
                .await
            {
                warn!(%prefix, upstream = %name, error = %e, "failed to record health verdict");
            }
        }
    }
}

/// Probes `<upstream>/health`; healthy means a response arrived within the
/// timeout with a 2xx status.
async fn probe(client: &ProbeClient, upstream: &Uri, path: &str, timeout: Duration) -> bool {
    let uri_str = format!(
        "{}://{}{}",
        upstream.scheme_str().unwrap_or("http"),
        upstream.authority().map(|a| a.as_str()).unwrap_or("localhost"),
        path,
    );

    let uri = match uri_str.parse::<Uri>() {
        Ok(uri) => uri,
        Err(e) => {
            warn!(upstream = %upstream, error = %e, "failed to build health probe URI");
            return false;
        }
    };

    match tokio::time::timeout(timeout, client.get(uri)).await {
        Ok(Ok(resp)) => {
            let healthy = resp.status().is_success();
            debug!(upstream = %upstream, status = resp.status().as_u16(), healthy, "health probe completed");
            healthy
        }
        Ok(Err(e)) => {
            debug!(upstream = %upstream, error = %e, "health probe failed");
            false
        }
        Err(_) => {
            debug!(upstream = %upstream, timeout = ?timeout, "health probe timed out");
            false
        }
    }
}
