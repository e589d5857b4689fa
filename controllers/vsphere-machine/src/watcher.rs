//! Kubernetes resource watcher.
//!
//! Drives reconciliation of VSphereMachine resources through
//! `kube_runtime::Controller`, which handles reconnection, queueing and
//! deduplication of events.

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crds::VSphereMachine;
use futures::StreamExt;
use kube::Api;
use kube_runtime::{
    controller::{Action, Config as RuntimeConfig},
    watcher, Controller,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Quiet period after the last event before a machine is reconciled
const DEBOUNCE: Duration = Duration::from_secs(5);

async fn reconcile(machine: Arc<VSphereMachine>, reconciler: Arc<Reconciler>) -> Result<Action, ControllerError> {
    debug!(
        "Reconciling VSphereMachine {}/{}",
        machine.metadata.namespace.as_deref().unwrap_or_default(),
        machine.metadata.name.as_deref().unwrap_or_default()
    );
    reconciler.reconcile(&machine).await.map(|outcome| outcome.into_action())
}

fn error_policy(machine: Arc<VSphereMachine>, error: &ControllerError, reconciler: Arc<Reconciler>) -> Action {
    reconciler.error_action(&machine, error)
}

/// Watches VSphereMachine resources
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    machines: Api<VSphereMachine>,
    concurrency: u16,
}

impl Watcher {
    pub fn new(reconciler: Arc<Reconciler>, machines: Api<VSphereMachine>, concurrency: u16) -> Self {
        Self {
            reconciler,
            machines,
            concurrency,
        }
    }

    /// Run until the watch stream ends
    pub async fn watch_machines(&self) -> Result<(), ControllerError> {
        info!(
            "Starting VSphereMachine watcher (concurrency {})",
            self.concurrency
        );

        let config = RuntimeConfig::default()
            .debounce(DEBOUNCE)
            .concurrency(self.concurrency);

        Controller::new(self.machines.clone(), watcher::Config::default())
            .with_config(config)
            .shutdown_on_signal()
            .run(reconcile, error_policy, Arc::clone(&self.reconciler))
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => debug!("Reconciled {}", obj),
                    Err(e) => error!("VSphereMachine controller error: {}", e),
                }
            })
            .await;

        info!("VSphereMachine watcher stopped");
        Ok(())
    }
}
