//! `/healthz` reverse proxy
//!
//! While healthy, requests are forwarded to the configured upstream: the
//! outbound request takes the upstream URL's scheme, host and path (the
//! inbound path is replaced, not appended), keeps the inbound query string,
//! method, headers and body, and records the inbound host in
//! `X-Forwarded-Host`. The upstream's status, headers and body are relayed
//! back verbatim.
//!
//! Once the shutdown coordinator flips the health flag, the handler answers
//! 503 with an empty body without contacting the upstream.

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use reqwest::Url;
use tracing::warn;

use crate::server::health::HealthState;

const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Inbound request bodies are buffered before forwarding; health probes are
/// tiny, so cap them well below anything a proxy hop should relay.
const MAX_REQUEST_BODY: usize = 1024 * 1024;

/// Shared state for the proxy handler
///
/// One reqwest client is built at startup and reused for every forwarded
/// request so upstream connections are pooled.
#[derive(Debug, Clone)]
pub struct ProxyState {
    health: HealthState,
    upstream: Url,
    client: reqwest::Client,
}

impl ProxyState {
    /// Create proxy state for the given upstream URL
    pub fn new(health: HealthState, upstream: Url) -> Self {
        Self {
            health,
            upstream,
            client: reqwest::Client::new(),
        }
    }
}

/// Connection-level headers that must not cross a proxy hop (RFC 9110 §7.6.1)
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Health proxy handler
///
/// Healthy: relay the upstream's response. Unhealthy: 503 with an empty
/// body, upstream never contacted.
async fn healthz(State(state): State<ProxyState>, req: Request) -> Response {
    if state.health.is_healthy() {
        forward(&state, req).await
    } else {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

/// Forward one request to the upstream and relay its response
///
/// An unreachable or failing upstream surfaces as a plain 502; it is a
/// per-request fault and never touches the health flag.
async fn forward(state: &ProxyState, req: Request) -> Response {
    let (parts, body) = req.into_parts();

    let body = match to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to read request body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let mut url = state.upstream.clone();
    url.set_query(parts.uri.query());

    // The inbound host, for HTTP/1 in the Host header and for HTTP/2 in the
    // URI authority.
    let inbound_host = parts.headers.get(HOST).cloned().or_else(|| {
        parts
            .uri
            .authority()
            .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
    });

    let mut headers = HeaderMap::with_capacity(parts.headers.len() + 1);
    for (name, value) in parts.headers.iter() {
        if name != HOST && !is_hop_by_hop(name) {
            headers.append(name, value.clone());
        }
    }
    if let Some(host) = inbound_host {
        headers.append(X_FORWARDED_HOST, host);
    }

    let result = state
        .client
        .request(parts.method, url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    match result {
        Ok(upstream) => {
            let status = upstream.status();
            let mut forwarded = HeaderMap::with_capacity(upstream.headers().len());
            for (name, value) in upstream.headers().iter() {
                if !is_hop_by_hop(name) {
                    forwarded.append(name, value.clone());
                }
            }

            let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
            *response.status_mut() = status;
            *response.headers_mut() = forwarded;
            response
        }
        Err(e) => {
            warn!(upstream = %state.upstream, error = %e, "upstream request failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

/// Build the proxy router
///
/// `/healthz` is served for any method (the upstream decides what it
/// accepts); every other path falls through to the 404 fallback.
pub fn build_router(state: ProxyState) -> Router {
    Router::new()
        .route("/healthz", any(healthz))
        .with_state(state)
}
