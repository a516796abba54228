// src/observability/mod.rs
//! Tracing and metrics bootstrap
//!
//! Logs go to stderr so that a worker's redirected output file captures them
//! alongside whatever the executed items print.

use crate::utils::errors::{QueueError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
///
/// `json` switches to one JSON object per line for log shippers.
pub fn init_tracing(verbose: bool, json: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| QueueError::Observability(format!("Failed to install subscriber: {}", e)))?;

    Ok(())
}

/// Install the Prometheus exporter when an address is configured
///
/// Must be called from inside a tokio runtime.
pub fn init_metrics(addr: Option<&str>) -> Result<()> {
    let Some(addr) = addr else {
        return Ok(());
    };

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| QueueError::Observability(format!("Invalid metrics address {}: {}", addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| QueueError::Observability(format!("Failed to install metrics exporter: {}", e)))?;

    info!("Metrics exporter listening on {}", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_disabled_without_address() {
        assert!(init_metrics(None).is_ok());
    }

    #[test]
    fn test_invalid_metrics_address() {
        let result = init_metrics(Some("not an address"));
        assert!(matches!(result, Err(QueueError::Observability(_))));
    }
}
