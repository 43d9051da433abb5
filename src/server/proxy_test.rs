//! Tests for the /healthz reverse proxy handler

use super::*;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::routing::any;
use axum::Router;
use reqwest::Url;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Wait for a server to answer with retry logic
///
/// Retries the connection with backoff; more reliable than a fixed sleep in
/// test environments.
async fn wait_for_server(addr: SocketAddr, max_retries: u32) -> reqwest::Client {
    let client = reqwest::Client::new();
    let mut delay = Duration::from_millis(10);

    for attempt in 1..=max_retries {
        match client
            .get(format!("http://{}/healthz", addr))
            .timeout(Duration::from_millis(200))
            .send()
            .await
        {
            Ok(_) => return client,
            Err(_) if attempt < max_retries => {
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_millis(200));
            }
            Err(e) => panic!("Server not ready after {} attempts: {}", max_retries, e),
        }
    }
    client
}

/// Upstream stub that counts hits and echoes the forwarded host and query
async fn spawn_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let handler_hits = hits.clone();

    let app = Router::new().route(
        "/healthz",
        any(move |req: Request| {
            let hits = handler_hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                let forwarded = req
                    .headers()
                    .get("x-forwarded-host")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let query = req.uri().query().unwrap_or("").to_string();
                (
                    StatusCode::OK,
                    [("x-upstream-marker", "healthz-stub")],
                    format!("ok forwarded-host={forwarded} query={query}"),
                )
            }
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("upstream serve");
    });
    (addr, hits)
}

async fn spawn_proxy(state: ProxyState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
    let addr = listener.local_addr().expect("proxy addr");
    let app = build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("proxy serve");
    });
    addr
}

fn upstream_url(addr: SocketAddr) -> Url {
    Url::parse(&format!("http://{}/healthz", addr)).expect("upstream url")
}

/// An address nothing listens on anymore
async fn dead_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    addr
}

/// Healthy: status, headers and body come back from the upstream, and the
/// outbound leg carries the original host in X-Forwarded-Host
#[tokio::test]
async fn test_healthy_forwards_upstream_response() {
    let (upstream_addr, hits) = spawn_upstream().await;
    let health = HealthState::new();
    let proxy_addr = spawn_proxy(ProxyState::new(health, upstream_url(upstream_addr))).await;

    let client = wait_for_server(proxy_addr, 10).await;
    let response = client
        .get(format!("http://{}/healthz", proxy_addr))
        .send()
        .await
        .expect("proxy request");

    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("x-upstream-marker")
            .and_then(|v| v.to_str().ok()),
        Some("healthz-stub"),
        "upstream headers should pass through"
    );

    let body = response.text().await.expect("body");
    assert!(body.contains("ok"), "upstream body should pass through");
    assert!(
        body.contains(&format!("forwarded-host=127.0.0.1:{}", proxy_addr.port())),
        "upstream should see the proxy's host in X-Forwarded-Host, got: {body}"
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

/// The inbound query string survives the path rewrite
#[tokio::test]
async fn test_query_string_preserved() {
    let (upstream_addr, _hits) = spawn_upstream().await;
    let health = HealthState::new();
    let proxy_addr = spawn_proxy(ProxyState::new(health, upstream_url(upstream_addr))).await;

    let client = wait_for_server(proxy_addr, 10).await;
    let body = client
        .get(format!("http://{}/healthz?verbose=1", proxy_addr))
        .send()
        .await
        .expect("proxy request")
        .text()
        .await
        .expect("body");

    assert!(body.contains("query=verbose=1"), "got: {body}");
}

/// /healthz is not restricted by method
#[tokio::test]
async fn test_method_agnostic_forwarding() {
    let (upstream_addr, hits) = spawn_upstream().await;
    let health = HealthState::new();
    let proxy_addr = spawn_proxy(ProxyState::new(health, upstream_url(upstream_addr))).await;

    let client = wait_for_server(proxy_addr, 10).await;
    let response = client
        .post(format!("http://{}/healthz", proxy_addr))
        .body("probe")
        .send()
        .await
        .expect("proxy request");

    assert_eq!(response.status(), 200);
    assert!(hits.load(Ordering::SeqCst) >= 1);
}

/// Unhealthy: 503 with an empty body, upstream never contacted
#[tokio::test]
async fn test_unhealthy_returns_503_without_upstream_contact() {
    let (upstream_addr, hits) = spawn_upstream().await;
    let health = HealthState::new();
    let proxy_addr =
        spawn_proxy(ProxyState::new(health.clone(), upstream_url(upstream_addr))).await;

    let client = wait_for_server(proxy_addr, 10).await;
    let before = hits.load(Ordering::SeqCst);
    health.set_unhealthy();

    let response = client
        .get(format!("http://{}/healthz", proxy_addr))
        .send()
        .await
        .expect("proxy request");

    assert_eq!(response.status(), 503);
    let body = response.bytes().await.expect("body");
    assert!(body.is_empty(), "503 response must have no body");
    assert_eq!(
        hits.load(Ordering::SeqCst),
        before,
        "upstream must not be contacted while unhealthy"
    );
}

/// An unreachable upstream is a per-request fault: generic failure status,
/// health flag untouched
#[tokio::test]
async fn test_unreachable_upstream_returns_502() {
    let health = HealthState::new();
    let upstream = upstream_url(dead_upstream().await);
    let proxy_addr = spawn_proxy(ProxyState::new(health.clone(), upstream)).await;

    let client = wait_for_server(proxy_addr, 10).await;
    let response = client
        .get(format!("http://{}/healthz", proxy_addr))
        .send()
        .await
        .expect("proxy request");

    assert_eq!(response.status(), 502);
    assert!(health.is_healthy(), "upstream faults must not flip health");
}

/// Once unhealthy, upstream reachability is irrelevant: still 503
#[tokio::test]
async fn test_unhealthy_wins_over_unreachable_upstream() {
    let health = HealthState::new();
    let upstream = upstream_url(dead_upstream().await);
    let proxy_addr = spawn_proxy(ProxyState::new(health.clone(), upstream)).await;

    let client = wait_for_server(proxy_addr, 10).await;
    health.set_unhealthy();

    let response = client
        .get(format!("http://{}/healthz", proxy_addr))
        .send()
        .await
        .expect("proxy request");

    assert_eq!(response.status(), 503);
}

/// Only /healthz is routed
#[tokio::test]
async fn test_unknown_path_returns_404() {
    let (upstream_addr, _hits) = spawn_upstream().await;
    let health = HealthState::new();
    let proxy_addr = spawn_proxy(ProxyState::new(health, upstream_url(upstream_addr))).await;

    let client = wait_for_server(proxy_addr, 10).await;
    let response = client
        .get(format!("http://{}/metrics", proxy_addr))
        .send()
        .await
        .expect("proxy request");

    assert_eq!(response.status(), 404);
}
