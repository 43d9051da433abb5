//! Process-wide health flag read by the `/healthz` proxy handler
//!
//! The flag starts healthy and flips to unhealthy exactly once, when the
//! shutdown coordinator receives a termination signal. Flipping it makes the
//! proxy answer 503 so load balancers route traffic elsewhere while the
//! server itself keeps running out the fail period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared health state for the proxy
///
/// Cloning shares the underlying flag. Reads are lock-free and safe from any
/// number of concurrent request handlers; the shutdown coordinator is the
/// only writer.
#[derive(Debug, Clone)]
pub struct HealthState {
    healthy: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a new health state (initially healthy)
    pub fn new() -> Self {
        Self {
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the process as unhealthy
    ///
    /// This causes the `/healthz` proxy to return 503, signaling to load
    /// balancers that the process should no longer receive traffic. The
    /// transition is one-directional: there is no way back to healthy.
    /// Idempotent.
    pub fn set_unhealthy(&self) {
        self.healthy.store(false, Ordering::SeqCst);
    }

    /// Check whether the process is still reporting healthy
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}
