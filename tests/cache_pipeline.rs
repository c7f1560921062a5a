//! Integration tests for response caching through the pipeline.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use hyper::{Method, StatusCode};

#[tokio::test]
async fn second_identical_get_is_served_from_cache() {
    init_tracing();
    let (addr, hits, _shutdown) =
        start_counting_backend(StatusCode::OK, "text/plain", "hello").await;

    let gw = gateway();
    gw.registry
        .add_upstream("/p", "p1", &format!("http://{addr}"))
        .await
        .unwrap();

    let first = send(&gw.state, get("/p/a?q=1")).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert!(first.headers().get("x-cache").is_none());
    assert_eq!(body_string(first).await, "hello");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let second = send(&gw.state, get("/p/a?q=1")).await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers().get("x-cache").unwrap(), "HIT");
    assert_eq!(
        second.headers().get("content-type").unwrap(),
        "text/plain",
        "stored headers are reemitted"
    );
    assert_eq!(body_string(second).await, "hello");
    assert_eq!(hits.load(Ordering::SeqCst), 1, "upstream must not be contacted");
}

#[tokio::test]
async fn different_query_is_a_different_cache_entry() {
    init_tracing();
    let (addr, hits, _shutdown) =
        start_counting_backend(StatusCode::OK, "text/plain", "hello").await;

    let gw = gateway();
    gw.registry
        .add_upstream("/p", "p1", &format!("http://{addr}"))
        .await
        .unwrap();

    send(&gw.state, get("/p/a?q=1")).await;
    send(&gw.state, get("/p/a?q=2")).await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn non_get_requests_bypass_the_cache() {
    init_tracing();
    let (addr, hits, _shutdown) =
        start_counting_backend(StatusCode::OK, "text/plain", "created").await;

    let gw = gateway();
    gw.registry
        .add_upstream("/p", "p1", &format!("http://{addr}"))
        .await
        .unwrap();

    for _ in 0..2 {
        let resp = send(&gw.state, request(Method::POST, "/p/items")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get("x-cache").is_none());
    }
    assert_eq!(hits.load(Ordering::SeqCst), 2, "every POST reaches the upstream");
}

#[tokio::test]
async fn non_200_responses_are_not_cached() {
    init_tracing();
    let (addr, hits, _shutdown) =
        start_counting_backend(StatusCode::NOT_FOUND, "text/plain", "nope").await;

    let gw = gateway();
    gw.registry
        .add_upstream("/p", "p1", &format!("http://{addr}"))
        .await
        .unwrap();

    for _ in 0..2 {
        let resp = send(&gw.state, get("/p/miss")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(resp.headers().get("x-cache").is_none());
    }
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn expired_entry_goes_back_to_the_upstream() {
    init_tracing();
    let (addr, hits, _shutdown) =
        start_counting_backend(StatusCode::OK, "text/plain", "hello").await;

    let gw = gateway_with(GatewayOptions {
        cache_ttl: Duration::from_millis(50),
        ..Default::default()
    });
    gw.registry
        .add_upstream("/p", "p1", &format!("http://{addr}"))
        .await
        .unwrap();

    send(&gw.state, get("/p/a")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let resp = send(&gw.state, get("/p/a")).await;
    assert!(resp.headers().get("x-cache").is_none(), "entry expired");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}
