//! Proxy HTTP server: accept loop, connection timeouts, graceful drain
//!
//! Connections are accepted manually and handed to hyper with a
//! graceful-shutdown watcher (one task per connection) because plain
//! `axum::serve` exposes neither a bounded drain deadline nor header-read
//! timeouts, and both are part of the server's contract here.

use std::io;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::Service;
use tracing::{debug, info, warn};

use crate::server::shutdown::{ShutdownController, ShutdownSignal};

/// Timeout for reading a request's header section. hyper re-arms this timer
/// while waiting for the next request on a keep-alive connection, so it also
/// reaps idle connections.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Hard deadline for producing and writing a response, upstream time
/// included. Bounds how long a request can occupy a connection.
const REQUEST_DEADLINE: Duration = Duration::from_secs(10);

/// Failure of the graceful-drain phase of shutdown
///
/// Both variants leave the server in an ambiguous half-stopped state;
/// callers must treat them as fatal.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("in-flight connections did not drain within {0:?}")]
    DrainTimeout(Duration),
    #[error("server exited before draining completed")]
    ServerExited,
}

/// Handle for driving the proxy server through graceful shutdown
///
/// Held by the shutdown coordinator; the accept loop owns the other end of
/// both channels.
pub struct ServerHandle {
    trigger: ShutdownController,
    drained: watch::Receiver<bool>,
}

impl ServerHandle {
    pub fn new(trigger: ShutdownController, drained: watch::Receiver<bool>) -> Self {
        Self { trigger, drained }
    }

    /// Stop the server, waiting up to `deadline` for in-flight connections
    ///
    /// Triggers the accept loop to stop taking new connections (watched
    /// connections get keep-alive disabled by hyper) and waits for the
    /// drain notification.
    pub async fn shutdown(mut self, deadline: Duration) -> Result<(), ShutdownError> {
        self.trigger.shutdown();
        match tokio::time::timeout(deadline, self.drained.wait_for(|drained| *drained)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(ShutdownError::ServerExited),
            Err(_) => Err(ShutdownError::DrainTimeout(deadline)),
        }
    }
}

/// Answer 504 when a request exceeds the deadline instead of letting a slow
/// upstream or client hold the connection open indefinitely
async fn request_deadline(req: Request, next: Next) -> Response {
    match tokio::time::timeout(REQUEST_DEADLINE, next.run(req)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(deadline = ?REQUEST_DEADLINE, "request exceeded deadline");
            StatusCode::GATEWAY_TIMEOUT.into_response()
        }
    }
}

/// Run the proxy accept loop until `shutdown` fires or the listener fails
///
/// Stopping via the shutdown signal is the benign path: the loop stops
/// accepting, waits for watched connections to finish, fires `drained` and
/// returns Ok. Any accept error is a listener fault and is returned as-is
/// without draining.
pub async fn run_proxy_server(
    listener: TcpListener,
    router: Router,
    mut shutdown: ShutdownSignal,
    drained: watch::Sender<bool>,
) -> Result<(), io::Error> {
    let app = router.layer(middleware::from_fn(request_deadline));

    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT);
    let graceful = GracefulShutdown::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, _remote_addr) = result?;

                // Match axum default: set TCP_NODELAY for low-latency
                if let Err(e) = socket.set_nodelay(true) {
                    warn!(error = %e, "failed to set TCP_NODELAY");
                }

                let app = app.clone();
                let service = hyper::service::service_fn(
                    move |req: hyper::Request<hyper::body::Incoming>| {
                        let mut app = app.clone();
                        let req = req.map(Body::new);
                        async move { app.call(req).await }
                    },
                );

                let conn = builder.serve_connection_with_upgrades(TokioIo::new(socket), service);
                let conn = graceful.watch(conn.into_owned());

                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!("connection closed: {}", e);
                    }
                });
            }
            _ = shutdown.wait() => {
                info!("shutdown requested, no longer accepting connections");
                break;
            }
        }
    }

    // Closes the listener before draining so new connection attempts are
    // refused while in-flight requests finish.
    drop(listener);
    graceful.shutdown().await;
    info!("in-flight connections drained");
    let _ = drained.send(true);

    Ok(())
}
