use clap::Parser;
use silta::config::Config;
use silta::server::{
    build_router, run_proxy_server, run_shutdown_coordinator, shutdown_channel, HealthState,
    ProxyState, ServerHandle,
};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    if let Err(e) = config.validate() {
        error!(url = %config.proxy_url, error = %e, "invalid upstream URL");
        return Err(e.into());
    }

    // Healthy from the first request onwards; only the shutdown coordinator
    // ever flips this.
    let health = HealthState::new();
    let state = ProxyState::new(health.clone(), config.proxy_url.clone());
    let router = build_router(state);

    let listener = match TcpListener::bind(config.listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %config.listen_addr, error = %e, "could not bind listener");
            return Err(e.into());
        }
    };

    let (controller, shutdown_signal) = shutdown_channel();
    let (drained_tx, drained_rx) = watch::channel(false);
    let (done_tx, done_rx) = oneshot::channel();

    let server = ServerHandle::new(controller, drained_rx);
    tokio::spawn(run_shutdown_coordinator(
        health,
        server,
        config.fail_period,
        config.shutdown_timeout,
        done_tx,
    ));

    info!(addr = %config.listen_addr, upstream = %config.proxy_url, "proxy starting");
    if let Err(e) = run_proxy_server(listener, router, shutdown_signal, drained_tx).await {
        error!(error = %e, "server failed");
        return Err(e.into());
    }

    // The accept loop has stopped; wait until the coordinator confirms the
    // drain finished before exiting.
    if done_rx.await.is_err() {
        anyhow::bail!("shutdown coordinator stopped before completing");
    }
    info!("server stopped");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
