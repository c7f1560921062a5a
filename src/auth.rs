//! Per-prefix authentication gate.
//!
//! Auth configurations hang off `auth:path:<P>` hashes, independent from
//! the routing registry: a protected prefix need not be a routed prefix.
//! The request path is resolved to a config by longest-prefix match with
//! the same segment-boundary rule the router uses.
//!
//! Successful validations are cached for a short TTL under a fingerprint
//! of the credential and path, so hot clients skip the config lookup.
//! Failures are never cached.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hyper::Uri;
use hyper::header::HeaderMap;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::Result;
use crate::router::path_matches_prefix;
use crate::store::Store;

const TICKET_TTL: Duration = Duration::from_secs(5 * 60);

/// Authentication policy for one path prefix.
///
/// `headers` and `api_keys` are stored JSON-encoded inside the hash so the
/// management plane can write them without a schema migration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthConfig {
    pub service_name: String,
    pub path: String,
    pub auth_type: String,
    pub enabled: bool,
    pub headers: HashMap<String, String>,
    pub api_keys: Vec<String>,
}

pub struct AuthGate {
    store: Arc<dyn Store>,
}

fn config_key(prefix: &str) -> String {
    format!("auth:path:{prefix}")
}

fn ticket_key(api_key: &str, path: &str) -> String {
    let digest = Sha256::digest(format!("{api_key}{path}").as_bytes());
    format!("auth:cache:{}", hex::encode(digest))
}

impl AuthGate {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Decides whether the request may proceed.
    ///
    /// No matching config or a disabled one admits the request. Store
    /// failures admit too: authentication availability must not depend on
    /// the coordination store being reachable.
    pub async fn authorize(&self, headers: &HeaderMap, uri: &Uri) -> bool {
        let path = uri.path();

        let config = match self.find_config_for_path(path).await {
            Ok(config) => config,
            Err(e) => {
                warn!(%path, error = %e, "auth config lookup failed, failing open");
                return true;
            }
        };
        let Some(config) = config else {
            return true;
        };
        if !config.enabled {
            return true;
        }

        let api_key = header_value(headers, "x-api-key").unwrap_or_default();
        let ticket = ticket_key(&api_key, path);
        match self.store.exists(&ticket).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => {
                warn!(%path, error = %e, "auth ticket lookup failed, failing open");
                return true;
            }
        }

        let valid = match config.auth_type.as_str() {
            "api_key" => self.validate_api_key(headers, uri, &config),
            "custom_header" => validate_custom_headers(headers, &config),
            _ => true,
        };

        if !valid {
            warn!(%path, auth_type = %config.auth_type, "authentication failed");
            return false;
        }

        if let Err(e) = self.store.set(&ticket, "1", Some(TICKET_TTL)).await {
            warn!(%path, error = %e, "failed to cache auth validation");
        }
        true
    }

    fn validate_api_key(&self, headers: &HeaderMap, uri: &Uri, config: &AuthConfig) -> bool {
        let presented = header_value(headers, "x-api-key")
            .or_else(|| query_param(uri, "api_key"))
            .unwrap_or_default();
        config.api_keys.iter().any(|key| *key == presented)
    }

    /// Resolves the auth config governing `request_path` by longest-prefix
    /// match over all configured prefixes.
    pub async fn find_config_for_path(&self, request_path: &str) -> Result<Option<AuthConfig>> {
        let keys = self.store.keys_matching("auth:path:*").await?;

        let best = keys
            .iter()
            .filter_map(|key| key.strip_prefix("auth:path:"))
            .filter(|prefix| path_matches_prefix(request_path, prefix))
            .max_by_key(|prefix| prefix.len());

        match best {
            Some(prefix) => self.load_config(prefix).await,
            None => Ok(None),
        }
    }

    /// Loads the config stored for an exact prefix, `None` if absent.
    pub async fn load_config(&self, prefix: &str) -> Result<Option<AuthConfig>> {
        let fields = self.store.hash_get_all(&config_key(prefix)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let mut config = AuthConfig {
            service_name: fields.get("service_name").cloned().unwrap_or_default(),
            path: fields.get("path").cloned().unwrap_or_else(|| prefix.into()),
            auth_type: fields.get("type").cloned().unwrap_or_default(),
            enabled: fields.get("enabled").map(String::as_str) == Some("true"),
            ..Default::default()
        };

        if let Some(raw) = fields.get("headers").filter(|v| !v.is_empty()) {
            match serde_json::from_str(raw) {
                Ok(headers) => config.headers = headers,
                Err(e) => warn!(%prefix, error = %e, "unparseable auth headers field"),
            }
        }
        if let Some(raw) = fields.get("api_keys").filter(|v| !v.is_empty()) {
            match serde_json::from_str(raw) {
                Ok(api_keys) => config.api_keys = api_keys,
                Err(e) => warn!(%prefix, error = %e, "unparseable auth api_keys field"),
            }
        }

        Ok(Some(config))
    }

    /// Persists an auth config in the schema the management plane writes.
    pub async fn save_config(&self, config: &AuthConfig) -> Result<()> {
        let headers_json = serde_json::to_string(&config.headers)
            .map_err(|e| crate::GatewayError::Internal(e.to_string()))?;
        let api_keys_json = serde_json::to_string(&config.api_keys)
            .map_err(|e| crate::GatewayError::Internal(e.to_string()))?;

        self.store
            .hash_set(
                &config_key(&config.path),
                &[
                    ("service_name", config.service_name.clone()),
                    ("path", config.path.clone()),
                    ("type", config.auth_type.clone()),
                    ("enabled", config.enabled.to_string()),
                    ("headers", headers_json),
                    ("api_keys", api_keys_json),
                ],
            )
            .await
    }
}

fn validate_custom_headers(headers: &HeaderMap, config: &AuthConfig) -> bool {
    config.headers.iter().all(|(name, expected)| {
        header_value(headers, name).as_deref() == Some(expected.as_str())
    })
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn query_param(uri: &Uri, name: &str) -> Option<String> {
    uri.query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_owned())
}
