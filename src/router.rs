//! Longest-prefix request routing.
//!
//! Matches a request path against the registered prefixes and computes the
//! suffix forwarded upstream. A prefix only matches at a path-segment
//! boundary: `/users` matches `/users` and `/users/42` but never
//! `/usersX`.

use std::sync::Arc;

use crate::registry::Registry;
use crate::{GatewayError, Result};

/// The outcome of a successful route lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteMatch {
    /// The registered prefix that won the longest match.
    pub prefix: String,
    /// The path forwarded upstream: the request path with the prefix
    /// stripped, `/` when the path equals the prefix exactly.
    pub suffix: String,
}

pub struct Router {
    registry: Arc<Registry>,
}

/// Returns whether `path` falls under `prefix` at a segment boundary.
pub(crate) fn path_matches_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Resolves the longest registered prefix covering `path`.
    ///
    /// Fails with [`GatewayError::PathNotFound`] when no prefix matches.
    pub async fn match_path(&self, path: &str) -> Result<RouteMatch> {
        let prefixes = self.registry.list_prefixes().await?;

        let best = prefixes
            .iter()
            .filter(|p| path_matches_prefix(path, p))
            .max_by_key(|p| p.len())
            .ok_or(GatewayError::PathNotFound)?;

        let suffix = if path.len() > best.len() {
            path[best.len()..].to_owned()
        } else {
            "/".to_owned()
        };

        Ok(RouteMatch {
            prefix: best.clone(),
            suffix,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn router_with(prefixes: &[&str]) -> Router {
        let registry = Arc::new(Registry::new(Arc::new(MemoryStore::new())));
        for (i, prefix) in prefixes.iter().enumerate() {
            registry
                .add_upstream(prefix, &format!("u{i}"), "http://backend:1")
                .await
                .unwrap();
        }
        Router::new(registry)
    }

    #[tokio::test]
    async fn strips_matched_prefix() {
        let router = router_with(&["/users"]).await;
        let m = router.match_path("/users/42").await.unwrap();
        assert_eq!(m.prefix, "/users");
        assert_eq!(m.suffix, "/42");
    }

    #[tokio::test]
    async fn exact_match_forwards_root() {
        let router = router_with(&["/users"]).await;
        let m = router.match_path("/users").await.unwrap();
        assert_eq!(m.suffix, "/");
    }

    #[tokio::test]
    async fn longest_prefix_wins() {
        let router = router_with(&["/api", "/api/v2"]).await;
        let m = router.match_path("/api/v2/items").await.unwrap();
        assert_eq!(m.prefix, "/api/v2");
        assert_eq!(m.suffix, "/items");

        let m = router.match_path("/api/v1/items").await.unwrap();
        assert_eq!(m.prefix, "/api");
        assert_eq!(m.suffix, "/v1/items");
    }

    #[tokio::test]
    async fn requires_segment_boundary() {
        let router = router_with(&["/users"]).await;
        let err = router.match_path("/usersX").await.unwrap_err();
        assert!(matches!(err, GatewayError::PathNotFound));
    }

    #[tokio::test]
    async fn unmatched_path_is_not_found() {
        let router = router_with(&["/users"]).await;
        let err = router.match_path("/orders/1").await.unwrap_err();
        assert!(matches!(err, GatewayError::PathNotFound));
    }

    #[test]
    fn boundary_rules() {
        assert!(path_matches_prefix("/users", "/users"));
        assert!(path_matches_prefix("/users/42", "/users"));
        assert!(!path_matches_prefix("/usersX", "/users"));
        assert!(!path_matches_prefix("/use", "/users"));
    }
}
