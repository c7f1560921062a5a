//! Shared test infrastructure for integration tests.
//!
//! Provides throwaway HTTP backends, a gateway builder over the embedded
//! store, request helpers, and a fault-injecting store double used to
//! verify fail-open behavior.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use portcullis::store::BatchOp;
use portcullis::{
    AuthGate, BoxBody, CircuitBreaker, GatewayError, MemoryStore, Metrics, ProxyEngine,
    RateLimiter, Registry, ResponseCache, ServerState, Store, build_client, handle_request,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// A synthetic client address used in all test invocations.
const TEST_CLIENT_ADDR: &str = "192.168.1.100:54321";

/// Initializes a tracing subscriber for test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

pub fn test_addr() -> SocketAddr {
    TEST_CLIENT_ADDR.parse().unwrap()
}

/// Tunables for the gateway under test.
pub struct GatewayOptions {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
    pub requests_per_minute: u32,
    pub cache_ttl: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
            requests_per_minute: 10_000,
            cache_ttl: Duration::from_secs(300),
        }
    }
}

/// A fully wired gateway over a fresh embedded store.
pub struct TestGateway {
    pub registry: Arc<Registry>,
    pub state: ServerState,
}

pub fn gateway() -> TestGateway {
    gateway_with(GatewayOptions::default())
}

pub fn gateway_with(options: GatewayOptions) -> TestGateway {
    gateway_on(Arc::new(MemoryStore::new()), options)
}

pub fn gateway_on(store: Arc<dyn Store>, options: GatewayOptions) -> TestGateway {
    let registry = Arc::new(Registry::new(Arc::clone(&store)));
    let metrics = Arc::new(Metrics::disabled());

    let engine = Arc::new(ProxyEngine::new(
        Arc::clone(&registry),
        CircuitBreaker::new(
            Arc::clone(&store),
            options.failure_threshold,
            options.success_threshold,
            options.open_timeout,
        ),
        ResponseCache::new(Arc::clone(&store), options.cache_ttl),
        Arc::clone(&metrics),
        build_client(),
    ));

    let state = ServerState {
        engine,
        auth: Arc::new(AuthGate::new(Arc::clone(&store))),
        limiter: Arc::new(RateLimiter::new(
            Arc::clone(&store),
            options.requests_per_minute,
            10,
        )),
        metrics,
    };

    TestGateway { registry, state }
}

/// Sends a request through the full middleware chain and pipeline.
pub async fn send(state: &ServerState, req: Request<Empty<Bytes>>) -> Response<BoxBody> {
    handle_request(state, req, test_addr()).await
}

pub fn get(uri: &str) -> Request<Empty<Bytes>> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Empty::new())
        .unwrap()
}

pub fn get_with_headers(uri: &str, headers: &[(&str, &str)]) -> Request<Empty<Bytes>> {
    let mut builder = Request::builder().method(Method::GET).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Empty::new()).unwrap()
}

pub fn request(method: Method, uri: &str) -> Request<Empty<Bytes>> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Empty::new())
        .unwrap()
}

/// Collects a [`BoxBody`] into [`Bytes`], mapping any body error to a
/// descriptive panic so test assertions remain concise.
pub async fn collect_body(body: BoxBody) -> Bytes {
    body.collect()
        .await
        .expect("failed to collect response body")
        .to_bytes()
}

pub async fn body_string(resp: Response<BoxBody>) -> String {
    String::from_utf8_lossy(&collect_body(resp.into_body()).await).into_owned()
}

/// Starts a local HTTP server that responds to every request with the
/// given status, content-type, and body. Returns the server address and a
/// handle to shut it down.
pub async fn start_backend(
    status: StatusCode,
    content_type: &'static str,
    body: &'static str,
) -> (SocketAddr, oneshot::Sender<()>) {
    let (addr, _hits, shutdown) = start_counting_backend(status, content_type, body).await;
    (addr, shutdown)
}

/// Starts a backend that additionally counts how many requests reached it,
/// so tests can assert the upstream was (or was not) contacted.
pub async fn start_counting_backend(
    status: StatusCode,
    content_type: &'static str,
    body: &'static str,
) -> (SocketAddr, Arc<AtomicUsize>, oneshot::Sender<()>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_inner = Arc::clone(&hits);

    let (addr, shutdown) = serve_backend(move |_req| {
        hits_inner.fetch_add(1, Ordering::SeqCst);
        Response::builder()
            .status(status)
            .header("content-type", content_type)
            .body(Full::new(Bytes::from(body)))
            .expect("test response must build")
    })
    .await;

    (addr, hits, shutdown)
}

/// Starts a backend that answers 500 for the first `failures` requests
/// and 200 afterwards, for exercising breaker recovery.
pub async fn start_flaky_backend(failures: usize) -> (SocketAddr, oneshot::Sender<()>) {
    let remaining = Arc::new(AtomicUsize::new(failures));

    serve_backend(move |_req| {
        let failing = remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let status = if failing {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::OK
        };
        Response::builder()
            .status(status)
            .header("content-type", "text/plain")
            .body(Full::new(Bytes::from(if failing { "boom" } else { "ok" })))
            .expect("test response must build")
    })
    .await
}

/// Starts a backend that echoes the request path-and-query as its body.
/// Used to verify prefix stripping and query preservation.
pub async fn start_echo_path_backend() -> (SocketAddr, oneshot::Sender<()>) {
    serve_backend(|req| {
        let echoed = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_default();
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain")
            .body(Full::new(Bytes::from(echoed)))
            .expect("test response must build")
    })
    .await
}

async fn serve_backend<F>(respond: F) -> (SocketAddr, oneshot::Sender<()>)
where
    F: Fn(Request<Incoming>) -> Response<Full<Bytes>> + Clone + Send + Sync + 'static,
{
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let respond = respond.clone();
                    let service = service_fn(move |req: Request<Incoming>| {
                        let respond = respond.clone();
                        async move { Ok::<_, std::convert::Infallible>(respond(req)) }
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}

/// A store double whose every operation fails, for exercising the
/// fail-open paths.
pub struct FailingStore;

fn injected<T>() -> portcullis::Result<T> {
    Err(GatewayError::Storage("injected store failure".into()))
}

#[async_trait]
impl Store for FailingStore {
    async fn get(&self, _key: &str) -> portcullis::Result<Option<String>> {
        injected()
    }
    async fn set(
        &self,
        _key: &str,
        _value: &str,
        _ttl: Option<Duration>,
    ) -> portcullis::Result<()> {
        injected()
    }
    async fn delete(&self, _keys: &[String]) -> portcullis::Result<()> {
        injected()
    }
    async fn exists(&self, _key: &str) -> portcullis::Result<bool> {
        injected()
    }
    async fn increment(&self, _key: &str) -> portcullis::Result<i64> {
        injected()
    }
    async fn expire(&self, _key: &str, _ttl: Duration) -> portcullis::Result<()> {
        injected()
    }
    async fn set_members(&self, _key: &str) -> portcullis::Result<Vec<String>> {
        injected()
    }
    async fn set_size(&self, _key: &str) -> portcullis::Result<u64> {
        injected()
    }
    async fn hash_get_all(&self, _key: &str) -> portcullis::Result<HashMap<String, String>> {
        injected()
    }
    async fn hash_set(&self, _key: &str, _fields: &[(&str, String)]) -> portcullis::Result<()> {
        injected()
    }
    async fn keys_matching(&self, _pattern: &str) -> portcullis::Result<Vec<String>> {
        injected()
    }
    async fn batch(&self, _ops: Vec<BatchOp>) -> portcullis::Result<()> {
        injected()
    }
}
