//! vSphere Machine Controller
//!
//! Provisions virtual machines on vCenter or standalone ESXi hosts for
//! VSphereMachine resources:
//! - Clones from a template (vCenter) or copies the template disk over SSH
//!   and creates the VM (standalone host)
//! - Leases static addresses from the IPAM agent when none are configured
//! - Delivers cloud-init metadata and bootstrap user data through guestinfo
//! - Reports power state, adapters and addresses back into status
//! - Tears the VM down and releases its addresses on deletion

mod backoff;
mod config;
mod controller;
mod error;
mod events;
mod ipam;
mod metrics;
mod reconcile_helpers;
mod reconciler;
mod remote_shell;
mod server;
mod session;
mod store;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting vSphere Machine Controller");

    let config = ControllerConfig::from_env()?;
    info!("Configuration:");
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Metrics address: {}", config.metrics_addr);
    info!("  Concurrency: {}", config.concurrency);
    info!("  vSphere HTTP timeout: {:?}", config.http_timeout);

    metrics::init_metrics().map_err(|e| ControllerError::InvalidConfig(e.to_string()))?;

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
