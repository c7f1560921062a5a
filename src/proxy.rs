//! The per-request proxy pipeline.
//!
//! Orchestrates route lookup, cache probe, upstream selection, circuit
//! breaker gating, request rewriting, forwarding, and outcome recording.
//! The pipeline executes strictly in that order for each request; there is
//! no shared mutable state between requests inside the process — all
//! coordination flows through the store.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::HeaderValue;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use tracing::{debug, info, warn};

use crate::cache::{CachedResponse, ResponseCache};
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::router::Router;
use crate::{CircuitBreaker, GatewayError, headers};

/// The body type used for all gateway responses and forwarded requests.
pub type BoxBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// The HTTP client type used for upstream connections. The connector
/// speaks both `http://` and `https://`, verifying TLS upstreams against
/// the Mozilla root store.
pub type HttpClient = Client<HttpsConnector<HttpConnector>, BoxBody>;

pub(crate) fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// Builds the shared forwarding client with per-target connection pooling;
/// idle connections are reused across requests.
pub fn build_client() -> HttpClient {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .build();

    Client::builder(TokioExecutor::new()).build(connector)
}

pub struct ProxyEngine {
    router: Router,
    registry: Arc<Registry>,
    breaker: CircuitBreaker,
    cache: ResponseCache,
    metrics: Arc<Metrics>,
    client: HttpClient,
}

impl ProxyEngine {
    pub fn new(
        registry: Arc<Registry>,
        breaker: CircuitBreaker,
        cache: ResponseCache,
        metrics: Arc<Metrics>,
        client: HttpClient,
    ) -> Self {
        Self {
            router: Router::new(Arc::clone(&registry)),
            registry,
            breaker,
            cache,
            metrics,
            client,
        }
    }

    /// Runs one request through the pipeline and always produces a
    /// response; failures map to the gateway's status contract.
    pub async fn handle<B>(
        &self,
        req: Request<B>,
        client_addr: std::net::SocketAddr,
    ) -> Response<BoxBody>
    where
        B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let started = Instant::now();
        let method = req.method().clone();
        let original_path = req.uri().path().to_owned();
        let query = req.uri().query().unwrap_or("").to_owned();

        let route = match self.router.match_path(&original_path).await {
            Ok(route) => route,
            Err(e @ GatewayError::PathNotFound) => {
                debug!(path = %original_path, "no route for path");
                return e.into_response();
            }
            Err(e) => {
                warn!(path = %original_path, error = %e, "route lookup failed");
                return e.into_response();
            }
        };

        let _active = self.metrics.track_active(&route.prefix);

        if method == Method::GET {
            if let Some(hit) = self.cache.get(&method, &original_path, &query).await {
                self.metrics.record_cache_hit(&route.prefix);
                debug!(path = %original_path, "serving cached response");
                return cached_response(hit);
            }
        }

        let upstream = match self.registry.next_healthy_upstream(&route.prefix).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(prefix = %route.prefix, error = %e, "upstream selection failed");
                self.metrics.record_error(&route.prefix, e.kind());
                // Selection failure of any kind, store trouble included,
                // means the prefix is unavailable right now.
                let mut resp = e.into_response();
                *resp.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                return resp;
            }
        };

        if !self.breaker.allow_request(&route.prefix, &upstream.name).await {
            debug!(upstream = %upstream.name, "circuit open, rejecting without contact");
            self.metrics.record_error(&upstream.name, "breaker_open");
            return GatewayError::BreakerOpen(upstream.name).into_response();
        }

        let target = match build_upstream_uri(&upstream.url, &route.suffix, &query) {
            Ok(target) => target,
            Err(e) => {
                warn!(upstream = %upstream.name, error = %e, "failed to build upstream URI");
                self.metrics.record_error(&upstream.name, e.kind());
                return e.into_response();
            }
        };

        let (mut parts, body) = req.into_parts();
        headers::strip_hop_by_hop(&mut parts.headers);
        if let Some(authority) = target.authority() {
            headers::apply_forwarding(&mut parts.headers, client_addr, authority);
        }
        parts.uri = target;

        debug!(
            upstream = %upstream.name,
            target = %parts.uri,
            "forwarding request"
        );

        let proxy_req = Request::from_parts(parts, body.map_err(Into::into).boxed());

        match self.client.request(proxy_req).await {
            Ok(resp) => {
                self.finish_forwarded(resp, &route.prefix, &upstream.name, &method, &original_path, &query, started)
                    .await
            }
            Err(e) => {
                warn!(
                    upstream = %upstream.name,
                    error = %e,
                    latency_ms = started.elapsed().as_millis() as u64,
                    "forwarding failed"
                );
                self.metrics.record_error(&upstream.name, "forwarding_error");
                self.breaker.record_failure(&route.prefix, &upstream.name).await;
                GatewayError::Forwarding(e.to_string()).into_response()
            }
        }
    }

    /// Post-forward bookkeeping: cache fill, metrics, breaker outcome.
    #[allow(clippy::too_many_arguments)]
    async fn finish_forwarded(
        &self,
        resp: Response<hyper::body::Incoming>,
        prefix: &str,
        upstream_name: &str,
        method: &Method,
        path: &str,
        query: &str,
        started: Instant,
    ) -> Response<BoxBody> {
        let status = resp.status();
        info!(
            upstream = %upstream_name,
            status = status.as_u16(),
            latency_ms = started.elapsed().as_millis() as u64,
            "upstream responded"
        );

        self.metrics
            .record_request(upstream_name, method.as_str(), status.as_u16(), started.elapsed());
        if status.is_server_error() {
            self.breaker.record_failure(prefix, upstream_name).await;
        } else {
            self.breaker.record_success(prefix, upstream_name).await;
        }

        let (mut parts, body) = resp.into_parts();
        headers::strip_hop_by_hop(&mut parts.headers);

        // Cacheable responses are buffered so the body can be both stored
        // and returned; everything else streams through.
        if *method == Method::GET && status == StatusCode::OK {
            match body.collect().await {
                Ok(collected) => {
                    let bytes = collected.to_bytes();
                    self.cache
                        .set(method, path, query, status, &parts.headers, &bytes)
                        .await;
                    Response::from_parts(parts, full_body(bytes))
                }
                Err(e) => {
                    warn!(upstream = %upstream_name, error = %e, "failed to read upstream body");
                    self.metrics.record_error(upstream_name, "forwarding_error");
                    GatewayError::Forwarding(e.to_string()).into_response()
                }
            }
        } else {
            Response::from_parts(parts, body.map_err(Into::into).boxed())
        }
    }
}

/// Rewrites the request target to the upstream, replacing the matched
/// prefix with the suffix and preserving the query string.
fn build_upstream_uri(upstream: &Uri, suffix: &str, query: &str) -> crate::Result<Uri> {
    let scheme = upstream
        .scheme()
        .ok_or_else(|| GatewayError::Internal("upstream URL has no scheme".into()))?;
    let authority = upstream
        .authority()
        .ok_or_else(|| GatewayError::Internal("upstream URL has no authority".into()))?;

    let path_and_query = if query.is_empty() {
        suffix.to_owned()
    } else {
        format!("{suffix}?{query}")
    };

    Uri::builder()
        .scheme(scheme.clone())
        .authority(authority.clone())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| GatewayError::Internal(format!("failed to build upstream URI: {e}")))
}

/// Replays a stored response, reemitting its headers verbatim and marking
/// it with `X-Cache: HIT`.
fn cached_response(cached: CachedResponse) -> Response<BoxBody> {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK));

    for (name, values) in &cached.headers {
        for value in values {
            builder = builder.header(name, value);
        }
    }

    builder
        .header("x-cache", HeaderValue::from_static("HIT"))
        .body(full_body(cached.body))
        .unwrap_or_else(|e| {
            warn!(error = %e, "stored response failed to rebuild");
            GatewayError::Internal("corrupt cached response".into()).into_response()
        })
}
