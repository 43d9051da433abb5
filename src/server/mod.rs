//! HTTP proxy server and shutdown coordination
//!
//! Serves a single route:
//! - `/healthz` - forwarded to the configured upstream while healthy,
//!   answered with 503 (empty body) once a termination signal has arrived
//!
//! Shutdown is two-phase: fail health checks for the configured period so
//! load balancers drain traffic, then stop the server gracefully under a
//! hard deadline.

mod health;
mod proxy;
mod serve;
pub mod shutdown;

pub use health::HealthState;
pub use proxy::{build_router, ProxyState};
pub use serve::{run_proxy_server, ServerHandle, ShutdownError};
pub use shutdown::{
    run_shutdown_coordinator, shutdown_channel, shutdown_sequence, wait_for_signal,
    ShutdownController, ShutdownSignal,
};

#[cfg(test)]
#[path = "health_test.rs"]
mod health_tests;

#[cfg(test)]
#[path = "proxy_test.rs"]
mod proxy_tests;

#[cfg(test)]
#[path = "serve_test.rs"]
mod serve_tests;

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;
