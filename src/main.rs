use std::net::SocketAddr;
use std::sync::Arc;

use portcullis::{
    AuthGate, CircuitBreaker, Config, HealthChecker, Metrics, ProxyEngine, RateLimiter,
    Registry, ResponseCache, RuntimeConfig, ServerState, build_client, serve, shutdown_signal,
    store::RedisStore,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const CONFIG_FILE_PATH: &str = "./Gateway.yml";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = load_config().unwrap_or_else(|e| {
        error!(%e, "failed to load configuration");
        std::process::exit(1);
    });

    info!(
        port = config.port,
        environment = %config.environment,
        redis = %config.redis_url,
        health_interval = ?config.health_interval,
        failure_threshold = config.failure_threshold,
        requests_per_minute = config.requests_per_minute,
        cache_ttl = ?config.cache_ttl,
        "configuration loaded"
    );

    let metrics = Arc::new(Metrics::new().unwrap_or_else(|e| {
        error!(%e, "failed to install metrics recorder");
        std::process::exit(1);
    }));

    let store = RedisStore::connect(
        &config.redis_url,
        config.redis_pool_size,
        config.kvs_connect_timeout,
        config.kvs_op_timeout,
    )
    .await
    .unwrap_or_else(|e| {
        error!(%e, "cannot start without a reachable coordination store");
        std::process::exit(1);
    });
    let store: Arc<dyn portcullis::Store> = Arc::new(store);

    let registry = Arc::new(Registry::new(Arc::clone(&store)));

    let breaker = CircuitBreaker::new(
        Arc::clone(&store),
        config.failure_threshold,
        config.success_threshold,
        config.open_timeout,
    );
    let cache = ResponseCache::new(Arc::clone(&store), config.cache_ttl);
    let engine = Arc::new(ProxyEngine::new(
        Arc::clone(&registry),
        breaker,
        cache,
        Arc::clone(&metrics),
        build_client(),
    ));

    let state = ServerState {
        engine,
        auth: Arc::new(AuthGate::new(Arc::clone(&store))),
        limiter: Arc::new(RateLimiter::new(
            Arc::clone(&store),
            config.requests_per_minute,
            config.burst_size,
        )),
        metrics,
    };

    let (stop_health, health_stopped) = oneshot::channel::<()>();
    let checker = HealthChecker::new(
        Arc::clone(&registry),
        config.health_interval,
        config.health_path.clone(),
        config.health_timeout,
    );
    let checker_handle = checker.spawn(async move {
        let _ = health_stopped.await;
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await.unwrap_or_else(|e| {
        error!(%e, %addr, "failed to bind");
        std::process::exit(1);
    });

    info!(%addr, "listening");

    serve(listener, state, config.shutdown_drain, shutdown_signal()).await;

    let _ = stop_health.send(());
    let _ = checker_handle.await;

    info!("shutdown complete");
}

/// Loads `Gateway.yml` when present, falls back to defaults otherwise,
/// then applies the environment overrides.
fn load_config() -> portcullis::Result<RuntimeConfig> {
    let config = if std::path::Path::new(CONFIG_FILE_PATH).exists() {
        Config::load_from_file(CONFIG_FILE_PATH)?
    } else {
        info!(path = CONFIG_FILE_PATH, "no config file, using defaults");
        Config::default()
    };

    config.apply_env().into_runtime()
}
