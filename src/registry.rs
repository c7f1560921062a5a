//! Service registry over the shared coordination store.
//!
//! Source of truth for which path prefixes exist, which upstreams serve
//! each, their last observed health, and the round-robin cursor. Every
//! gateway replica reads and writes the same keys, so the registry holds
//! no in-process state beyond its store handle.
//!
//! Key schema:
//!
//! | key | type |
//! |---|---|
//! | `registry:paths` | set of all prefixes |
//! | `registry:path:<P>:services` | set of upstream names for `P` |
//! | `registry:path:<P>:service:<N>` | upstream record hash |
//! | `registry:path:<P>:index` | round-robin cursor |

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hyper::Uri;
use tracing::{info, warn};

use crate::store::{BatchOp, Store};
use crate::{GatewayError, Result};

const PATHS_KEY: &str = "registry:paths";

/// A backend HTTP service registered under a path prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct Upstream {
    pub name: String,
    pub url: Uri,
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
}

pub struct Registry {
    store: Arc<dyn Store>,
}

fn services_key(prefix: &str) -> String {
    format!("registry:path:{prefix}:services")
}

fn service_key(prefix: &str, name: &str) -> String {
    format!("registry:path:{prefix}:service:{name}")
}

fn cursor_key(prefix: &str) -> String {
    format!("registry:path:{prefix}:index")
}

impl Registry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Registers an upstream under a prefix, creating the prefix and its
    /// round-robin cursor on first registration.
    ///
    /// The prefix-set insert, name-set insert, record write, and cursor
    /// initialization land in one atomic batch so concurrent readers never
    /// observe a prefix without a record or vice versa. The record is
    /// written `healthy=true`; the health checker takes over from there.
    pub async fn add_upstream(&self, prefix: &str, name: &str, url: &str) -> Result<()> {
        if !prefix.starts_with('/') {
            return Err(GatewayError::InvalidInput(format!(
                "prefix {prefix:?} must start with '/'"
            )));
        }
        if name.is_empty() {
            return Err(GatewayError::InvalidInput("upstream name is empty".into()));
        }
        let parsed: Uri = url
            .parse()
            .map_err(|e| GatewayError::InvalidInput(format!("invalid upstream url {url:?}: {e}")))?;
        if parsed.scheme().is_none() || parsed.host().is_none() {
            return Err(GatewayError::InvalidInput(format!(
                "upstream url {url:?} must have a scheme and host"
            )));
        }

        self.store
            .batch(vec![
                BatchOp::SetAdd {
                    key: PATHS_KEY.into(),
                    member: prefix.into(),
                },
                BatchOp::SetAdd {
                    key: services_key(prefix),
                    member: name.into(),
                },
                BatchOp::HashSet {
                    key: service_key(prefix, name),
                    fields: vec![
                        ("name".into(), name.into()),
                        ("url".into(), url.into()),
                        ("healthy".into(), "true".into()),
                        ("last_check".into(), Utc::now().to_rfc3339()),
                    ],
                },
                BatchOp::SetIfAbsent {
                    key: cursor_key(prefix),
                    value: "0".into(),
                },
            ])
            .await?;

        info!(%prefix, upstream = %name, %url, "upstream registered");
        Ok(())
    }

    /// Deregisters an upstream. When the last upstream of a prefix goes,
    /// the prefix itself and its cursor go with it, keeping the invariant
    /// that a listed prefix always has at least one upstream.
    pub async fn remove_upstream(&self, prefix: &str, name: &str) -> Result<()> {
        self.store
            .batch(vec![
                BatchOp::SetRemove {
                    key: services_key(prefix),
                    member: name.into(),
                },
                BatchOp::Delete {
                    key: service_key(prefix, name),
                },
            ])
            .await?;

        if self.store.set_size(&services_key(prefix)).await? == 0 {
            self.store
                .batch(vec![
                    BatchOp::SetRemove {
                        key: PATHS_KEY.into(),
                        member: prefix.into(),
                    },
                    BatchOp::Delete {
                        key: cursor_key(prefix),
                    },
                ])
                .await?;
            info!(%prefix, "prefix removed, no upstreams left");
        }

        info!(%prefix, upstream = %name, "upstream deregistered");
        Ok(())
    }

    /// Returns all registered prefixes in lexicographic order.
    pub async fn list_prefixes(&self) -> Result<Vec<String>> {
        let mut prefixes = self.store.set_members(PATHS_KEY).await?;
        prefixes.sort();
        Ok(prefixes)
    }

    /// Returns all upstream records for a prefix.
    ///
    /// Records that fail to parse are skipped with a warning rather than
    /// failing the whole listing; one corrupt record must not blind the
    /// health checker to its siblings.
    pub async fn list_upstreams(&self, prefix: &str) -> Result<Vec<Upstream>> {
        let names = self.store.set_members(&services_key(prefix)).await?;
        let mut upstreams = Vec::with_capacity(names.len());

        for name in &names {
            let fields = match self.store.hash_get_all(&service_key(prefix, name)).await {
                Ok(fields) => fields,
                Err(e) => {
                    warn!(%prefix, upstream = %name, error = %e, "failed to load upstream record");
                    continue;
                }
            };
            match parse_record(&fields) {
                Some(upstream) => upstreams.push(upstream),
                None => {
                    warn!(%prefix, upstream = %name, "skipping unparseable upstream record");
                }
            }
        }

        Ok(upstreams)
    }

    /// Writes the health verdict of a probe into the upstream record.
    pub async fn update_health(
        &self,
        prefix: &str,
        name: &str,
        healthy: bool,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        let key = service_key(prefix, name);
        if !self.store.exists(&key).await? {
            return Err(GatewayError::ServiceNotFound {
                prefix: prefix.into(),
                name: name.into(),
            });
        }

        self.store
            .hash_set(
                &key,
                &[
                    ("healthy", healthy.to_string()),
                    ("last_check", checked_at.to_rfc3339()),
                ],
            )
            .await
    }

    /// Selects the next healthy upstream for a prefix, round-robin.
    ///
    /// The cursor increment is atomic at the store, so concurrent callers
    /// in this or any other replica observe interleaved values and share
    /// load evenly. Up to `N + 1` attempts are made, skipping unhealthy
    /// and unparseable records; the name-set ordering may shift between
    /// calls, which is tolerated — the only guarantee is forward progress
    /// past unhealthy upstreams.
    pub async fn next_healthy_upstream(&self, prefix: &str) -> Result<Upstream> {
        let names = self.store.set_members(&services_key(prefix)).await?;
        if names.is_empty() {
            return Err(GatewayError::NoUpstreamsForPath(prefix.into()));
        }

        let cursor = cursor_key(prefix);
        for _ in 0..=names.len() {
            let index = self.store.increment(&cursor).await?;
            let position = (index - 1).rem_euclid(names.len() as i64) as usize;
            let name = &names[position];

            let fields = match self.store.hash_get_all(&service_key(prefix, name)).await {
                Ok(fields) => fields,
                Err(e) => {
                    warn!(%prefix, upstream = %name, error = %e, "failed to load upstream record");
                    continue;
                }
            };
            let Some(upstream) = parse_record(&fields) else {
                warn!(%prefix, upstream = %name, "skipping unparseable upstream record");
                continue;
            };
            if upstream.healthy {
                return Ok(upstream);
            }
        }

        Err(GatewayError::AllUpstreamsUnhealthy(prefix.into()))
    }
}

fn parse_record(fields: &HashMap<String, String>) -> Option<Upstream> {
    let name = fields.get("name")?.clone();
    let url: Uri = fields.get("url")?.parse().ok()?;
    if url.scheme().is_none() || url.host().is_none() {
        return None;
    }
    let healthy = fields
        .get("healthy")
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);
    let last_check = fields
        .get("last_check")
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH);

    Some(Upstream {
        name,
        url,
        healthy,
        last_check,
    })
}
