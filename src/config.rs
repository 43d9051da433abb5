//! Startup configuration
//!
//! All options are fixed for the lifetime of the process; there is no
//! runtime reconfiguration.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use reqwest::Url;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported upstream scheme {0:?}, expected http or https")]
    UnsupportedScheme(String),
}

/// Command line options
#[derive(Debug, Parser)]
#[command(
    name = "silta",
    version,
    about = "health check proxy that fails probes before shutting down"
)]
pub struct Config {
    /// Address the proxy listens on
    #[arg(long = "listen-addr", default_value = "0.0.0.0:8080", value_name = "ADDR")]
    pub listen_addr: SocketAddr,

    /// Upstream URL that healthy /healthz requests are forwarded to
    #[arg(
        long = "proxy-url",
        default_value = "http://127.0.0.1:8081/healthz",
        value_name = "URL"
    )]
    pub proxy_url: Url,

    /// How long to wait for in-flight connections to drain during shutdown
    #[arg(
        long = "shutdown-timeout",
        default_value = "5s",
        value_parser = humantime::parse_duration,
        value_name = "DURATION"
    )]
    pub shutdown_timeout: Duration,

    /// How long to fail health checks before stopping the server
    #[arg(
        long = "fail-period",
        default_value = "30s",
        value_parser = humantime::parse_duration,
        value_name = "DURATION"
    )]
    pub fail_period: Duration,
}

impl Config {
    /// Reject upstream URLs the forwarder cannot dial
    ///
    /// Checked before the server starts; a bad upstream URL is a fatal
    /// configuration fault, not a per-request one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // http(s) URLs always carry a host (hostless ones fail to parse),
        // so the scheme check is the only gap left after clap's Url parse.
        match self.proxy_url.scheme() {
            "http" | "https" => Ok(()),
            other => Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_tests;
