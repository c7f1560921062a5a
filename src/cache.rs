//! Response caching for idempotent upstream reads.
//!
//! Successful GET responses are stored as JSON blobs in the coordination
//! store, keyed by a SHA-256 fingerprint of method, path, and query.
//! Only `GET` + `200` pairs are ever persisted; everything else streams
//! through untouched. Served hits carry `X-Cache: HIT` so clients and
//! tests can tell them apart from live responses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hyper::header::HeaderMap;
use hyper::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::store::Store;

/// A stored upstream response, replayed verbatim on a hit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: HashMap<String, Vec<String>>,
    pub body: Vec<u8>,
    pub cached_at: DateTime<Utc>,
}

pub struct ResponseCache {
    store: Arc<dyn Store>,
    ttl: Duration,
}

fn fingerprint(method: &Method, path: &str, query: &str) -> String {
    let digest = Sha256::digest(format!("{method}:{path}:{query}").as_bytes());
    format!("cache:response:{}", hex::encode(digest))
}

impl ResponseCache {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Probes the cache; non-GET methods and any cache trouble miss.
    pub async fn get(&self, method: &Method, path: &str, query: &str) -> Option<CachedResponse> {
        if method != Method::GET {
            return None;
        }

        let key = fingerprint(method, path, query);
        let raw = match self.store.get(&key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(%path, error = %e, "cache lookup failed");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(cached) => Some(cached),
            Err(e) => {
                warn!(%path, error = %e, "discarding unparseable cached response");
                None
            }
        }
    }

    /// Persists a response if it is a successful GET; no-op otherwise.
    pub async fn set(
        &self,
        method: &Method,
        path: &str,
        query: &str,
        status: StatusCode,
        headers: &HeaderMap,
        body: &[u8],
    ) {
        if method != Method::GET || status != StatusCode::OK {
            return;
        }

        let mut stored_headers: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in headers {
            if let Ok(value) = value.to_str() {
                stored_headers
                    .entry(name.as_str().to_owned())
                    .or_default()
                    .push(value.to_owned());
            }
        }

        let cached = CachedResponse {
            status: status.as_u16(),
            headers: stored_headers,
            body: body.to_vec(),
            cached_at: Utc::now(),
        };

        let raw = match serde_json::to_string(&cached) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(%path, error = %e, "failed to serialize response for caching");
                return;
            }
        };

        let key = fingerprint(method, path, query);
        if let Err(e) = self.store.set(&key, &raw, Some(self.ttl)).await {
            warn!(%path, error = %e, "failed to store cached response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn cache() -> ResponseCache {
        ResponseCache::new(Arc::new(MemoryStore::new()), Duration::from_secs(300))
    }

    fn ok_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/plain".parse().unwrap());
        headers.insert("etag", "\"abc\"".parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn stores_and_replays_successful_gets() {
        let cache = cache();
        cache
            .set(&Method::GET, "/p/a", "q=1", StatusCode::OK, &ok_headers(), b"hello")
            .await;

        let hit = cache.get(&Method::GET, "/p/a", "q=1").await.expect("hit");
        assert_eq!(hit.status, 200);
        assert_eq!(hit.body, b"hello");
        assert_eq!(hit.headers["content-type"], vec!["text/plain"]);
        assert_eq!(hit.headers["etag"], vec!["\"abc\""]);
    }

    #[tokio::test]
    async fn query_string_is_part_of_the_key() {
        let cache = cache();
        cache
            .set(&Method::GET, "/p/a", "q=1", StatusCode::OK, &ok_headers(), b"one")
            .await;

        assert!(cache.get(&Method::GET, "/p/a", "q=2").await.is_none());
        assert!(cache.get(&Method::GET, "/p/a", "").await.is_none());
    }

    #[tokio::test]
    async fn non_get_is_never_cached_or_served() {
        let cache = cache();
        cache
            .set(&Method::POST, "/p/a", "", StatusCode::OK, &ok_headers(), b"x")
            .await;
        assert!(cache.get(&Method::POST, "/p/a", "").await.is_none());
        assert!(cache.get(&Method::GET, "/p/a", "").await.is_none());
    }

    #[tokio::test]
    async fn non_200_is_never_cached() {
        let cache = cache();
        cache
            .set(
                &Method::GET,
                "/p/a",
                "",
                StatusCode::NOT_FOUND,
                &ok_headers(),
                b"missing",
            )
            .await;
        assert!(cache.get(&Method::GET, "/p/a", "").await.is_none());
    }

    #[tokio::test]
    async fn entries_expire_with_the_ttl() {
        let cache = ResponseCache::new(Arc::new(MemoryStore::new()), Duration::from_millis(10));
        cache
            .set(&Method::GET, "/p/a", "", StatusCode::OK, &ok_headers(), b"x")
            .await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get(&Method::GET, "/p/a", "").await.is_none());
    }
}
