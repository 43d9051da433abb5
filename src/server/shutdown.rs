//! Shutdown coordination for the proxy
//!
//! Handles SIGTERM and SIGINT for a two-phase stop:
//! - Fail health checks immediately so load balancers drain traffic
//! - Keep serving for the configured fail period
//! - Then drain in-flight connections under a hard deadline
//!
//! At most one shutdown sequence runs per process lifetime; additional
//! signals during the fail period have no effect.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::{error, info};

use crate::server::health::HealthState;
use crate::server::serve::{ServerHandle, ShutdownError};

/// Shutdown signal receiver
///
/// Cloned and handed to every task that must stop when shutdown is
/// triggered; the accept loop selects on [`ShutdownSignal::wait`].
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Wait for shutdown to be triggered
    pub async fn wait(&mut self) {
        // Wait until the value becomes true
        while !*self.receiver.borrow() {
            if self.receiver.changed().await.is_err() {
                // Sender dropped, treat as shutdown
                break;
            }
        }
    }

    /// Check if shutdown was triggered (non-blocking)
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Controller for triggering shutdown
pub struct ShutdownController {
    sender: watch::Sender<bool>,
}

impl ShutdownController {
    /// Trigger shutdown
    pub fn shutdown(&self) {
        let _ = self.sender.send(true);
    }
}

/// Create a new shutdown signal pair
///
/// Returns (controller, signal) where:
/// - controller: Used to trigger shutdown
/// - signal: Cloned and passed to components that need to listen
pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownController { sender }, ShutdownSignal { receiver })
}

/// Wait for SIGTERM or SIGINT
///
/// Blocks until a termination signal is received and returns the signal
/// name. Repeated signals coalesce: callers await this once, so a second
/// signal delivered during the fail period changes nothing.
///
/// # Panics
/// Panics if signal handlers cannot be registered (OS resource exhaustion).
#[cfg(unix)]
pub async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to register SIGTERM handler");
            panic!("Cannot register SIGTERM handler: {}", e);
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to register SIGINT handler");
            panic!("Cannot register SIGINT handler: {}", e);
        }
    };

    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}

/// Wait for Ctrl+C (Windows)
///
/// # Panics
/// Panics if the Ctrl+C handler cannot be registered.
#[cfg(not(unix))]
pub async fn wait_for_signal() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to wait for Ctrl+C");
        panic!("Cannot wait for Ctrl+C: {}", e);
    }
    "CTRL_C"
}

/// Drive the shutdown sequence once a termination request arrives
///
/// Awaits `quit`, flips the health flag (completed before the fail-period
/// timer is armed, so every probe arriving afterwards sees unhealthy),
/// sleeps out the fail period while the server keeps answering, then asks
/// the server to drain within `shutdown_timeout`.
///
/// The quit future is awaited exactly once, so at most one sequence runs
/// and the fail period cannot be cancelled or restarted.
pub async fn shutdown_sequence<F>(
    quit: F,
    health: HealthState,
    server: ServerHandle,
    fail_period: Duration,
    shutdown_timeout: Duration,
) -> Result<(), ShutdownError>
where
    F: Future<Output = ()>,
{
    quit.await;

    health.set_unhealthy();
    info!(fail_period = ?fail_period, "termination requested, failing health checks");
    tokio::time::sleep(fail_period).await;

    info!(shutdown_timeout = ?shutdown_timeout, "fail period elapsed, draining server");
    server.shutdown(shutdown_timeout).await
}

/// Run the shutdown coordinator to completion
///
/// Dormant until SIGTERM/SIGINT arrives. On a clean drain the completion
/// sender fires; it is consumed here and nowhere else, so it cannot fire
/// twice. A drain failure is unrecoverable: a server stuck mid-shutdown
/// cannot safely coexist with process exit, so the process halts
/// immediately and the completion sender is dropped unfired.
pub async fn run_shutdown_coordinator(
    health: HealthState,
    server: ServerHandle,
    fail_period: Duration,
    shutdown_timeout: Duration,
    done: oneshot::Sender<()>,
) {
    let quit = async {
        let signal = wait_for_signal().await;
        info!(signal = signal, "received termination signal");
    };

    match shutdown_sequence(quit, health, server, fail_period, shutdown_timeout).await {
        Ok(()) => {
            info!("shutdown completed");
            let _ = done.send(());
        }
        Err(e) => {
            error!(error = %e, "could not gracefully shut down the server");
            std::process::exit(1);
        }
    }
}
