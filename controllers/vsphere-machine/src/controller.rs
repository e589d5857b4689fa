//! Main controller implementation.
//!
//! Wires the Kubernetes client, the vSphere session cache, the IPAM agent
//! factory and the remote shell into a [`Reconciler`], then runs the
//! VSphereMachine watcher next to the health server.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::events::KubeEventPublisher;
use crate::reconciler::Reconciler;
use crate::remote_shell::SshShellFactory;
use crate::server::{self, Readiness};
use crate::session::SessionCache;
use crate::store::KubeMachineStore;
use crate::watcher::Watcher;
use crds::VSphereMachine;
use ipam_client::HttpAgentFactory;
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;
use vsphere_client::RestConnector;

const CONTROLLER_NAME: &str = "vsphere-machine-controller";

/// Running controller: the machine watcher and the health server
pub struct Controller {
    machine_watcher: JoinHandle<Result<(), ControllerError>>,
    health_server: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Connect to the cluster and start all background tasks
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing vSphere machine controller");

        let kube_client = Client::try_default().await?;

        let connector = RestConnector::new(config.http_timeout);
        let reconciler = Reconciler::new(
            Arc::new(KubeMachineStore::new(kube_client.clone())),
            Arc::new(SessionCache::new(Arc::new(connector))),
            Arc::new(HttpAgentFactory),
            Arc::new(SshShellFactory::default()),
            Arc::new(KubeEventPublisher::new(kube_client.clone(), CONTROLLER_NAME)),
            config.username.clone(),
            config.password.clone(),
        );

        let machines: Api<VSphereMachine> = match config.namespace.as_deref() {
            Some(ns) => Api::namespaced(kube_client, ns),
            None => Api::all(kube_client),
        };
        let watcher = Watcher::new(Arc::new(reconciler), machines, config.concurrency);

        let readiness = Readiness::default();
        let health_server = tokio::spawn(server::serve(config.metrics_addr, readiness.clone()));
        let machine_watcher = tokio::spawn(async move { watcher.watch_machines().await });
        readiness.set_ready();

        Ok(Self {
            machine_watcher,
            health_server,
        })
    }

    /// Run until either task stops
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("vSphere machine controller running");

        tokio::select! {
            result = &mut self.machine_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("VSphereMachine watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("VSphereMachine watcher error: {}", e)))?;
                self.health_server.abort();
            }
            result = &mut self.health_server => {
                result.map_err(|e| ControllerError::Watch(format!("Health server panicked: {}", e)))??;
            }
        }
        Ok(())
    }
}
