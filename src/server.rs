//! Server accept loop, middleware chain, and graceful shutdown.
//!
//! Contains the runtime infrastructure that sits between the TCP listener
//! and the per-request pipeline. The gateway's own endpoints
//! (`/gateway/health`, `/metrics`) are answered here; everything else
//! flows through the middleware chain — authentication first, then rate
//! limiting, then the proxy pipeline. A panic anywhere in the chain is
//! caught and answered with a 500; nothing in the request path is fatal
//! to the process.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tracing::{Instrument, error, info, warn};

use crate::auth::AuthGate;
use crate::limiter::RateLimiter;
use crate::metrics::Metrics;
use crate::proxy::{BoxBody, ProxyEngine, full_body};
use crate::{GatewayError, headers};

/// Global monotonic counter for assigning unique request IDs.
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Runtime state shared across the accept loop.
#[derive(Clone)]
pub struct ServerState {
    pub engine: Arc<ProxyEngine>,
    pub auth: Arc<AuthGate>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<Metrics>,
}

/// Processes a single inbound request: gateway endpoints first, then the
/// middleware chain around the proxy pipeline.
///
/// Every request is assigned a monotonic request ID and wrapped in a
/// [`tracing::Span`] carrying the method, URI, and client address, so all
/// failure logs downstream identify their request.
pub async fn handle_request<B>(
    state: &ServerState,
    req: Request<B>,
    client_addr: SocketAddr,
) -> Response<BoxBody>
where
    B: hyper::body::Body<Data = bytes::Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let request_id = REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    let span = tracing::info_span!(
        "request",
        id = request_id,
        method = %req.method(),
        uri = %req.uri(),
        client = %client_addr,
    );

    route_request(state, req, client_addr).instrument(span).await
}

async fn route_request<B>(
    state: &ServerState,
    req: Request<B>,
    client_addr: SocketAddr,
) -> Response<BoxBody>
where
    B: hyper::body::Body<Data = bytes::Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if req.method() == Method::GET {
        match req.uri().path() {
            "/gateway/health" => return text_response(StatusCode::OK, "OK"),
            "/metrics" => return metrics_response(&state.metrics),
            _ => {}
        }
    }

    if !state.auth.authorize(req.headers(), req.uri()).await {
        return GatewayError::Unauthorized.into_response();
    }

    let client_ip = headers::client_ip(req.headers(), client_addr);
    if !state.limiter.allow(client_ip, req.uri().path()).await {
        warn!(%client_ip, path = %req.uri().path(), "rate limit exceeded");
        return GatewayError::RateLimited.into_response();
    }

    state.engine.handle(req, client_addr).await
}

fn text_response(status: StatusCode, body: &'static str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(full_body(body))
        .expect("static response must build")
}

fn metrics_response(metrics: &Metrics) -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4")
        .body(full_body(metrics.render()))
        .expect("metrics response must build")
}

/// Accepts connections on `listener` and dispatches them through the
/// gateway until `shutdown` resolves, then drains in-flight connections
/// for up to `drain` before returning.
pub async fn serve(
    listener: TcpListener,
    state: ServerState,
    drain: Duration,
    shutdown: impl Future<Output = ()>,
) {
    let graceful = GracefulShutdown::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, client_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(%e, "failed to accept connection");
                        continue;
                    }
                };

                let state = state.clone();
                let svc = service_fn(move |req: Request<Incoming>| {
                    let state = state.clone();
                    async move {
                        // Convert panics to 500 so one bad request cannot
                        // take down the connection task uncleanly.
                        let resp = std::panic::AssertUnwindSafe(handle_request(
                            &state,
                            req,
                            client_addr,
                        ))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            error!("request handler panicked");
                            GatewayError::Internal("request handler panicked".into())
                                .into_response()
                        });
                        Ok::<Response<BoxBody>, Infallible>(resp)
                    }
                });

                let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), svc);
                let watched = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = watched.await {
                        warn!(%e, "connection error");
                    }
                });
            }
            () = &mut shutdown => {
                info!("shutting down, no longer accepting connections");
                break;
            }
        }
    }

    tokio::select! {
        () = graceful.shutdown() => info!("in-flight requests drained"),
        () = tokio::time::sleep(drain) => {
            warn!(timeout = ?drain, "drain timed out, closing remaining connections");
        }
    }
}

/// Resolves when the process is told to stop: SIGINT or SIGTERM on Unix,
/// Ctrl+C elsewhere.
///
/// Handed to [`serve`] as its shutdown future, so the first signal stops
/// the accept loop and starts the in-flight drain; the health checker is
/// stopped by `main` once the drain completes.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut interrupt =
            signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");

        let received = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        };
        info!(signal = received, "stop requested, draining in-flight requests");
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl+C");
        info!("stop requested, draining in-flight requests");
    }
}
