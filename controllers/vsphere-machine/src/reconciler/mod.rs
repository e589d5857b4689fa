//! VSphereMachine reconciliation
//!
//! Kubernetes-facing half of a reconcile: finalizer handling, dependency
//! lookup (cluster, credentials, bootstrap data), IPAM, session acquisition
//! and status persistence. The hypervisor-facing state machine lives in
//! [`vm`].

pub mod vm;

mod reconciler_test;

use crate::backoff::BackoffTracker;
use crate::error::{ControllerError, ErrorKind};
use crate::events::{actions, reasons, EventPublisher};
use crate::ipam::IpamService;
use crate::metrics;
use crate::reconcile_helpers::{
    clear_failure, resource_key, status_needs_update, status_patch, touch_last_reconciled,
    ReconcileOutcome, TRANSIENT_ERROR_INTERVAL, WAIT_FOR_DEPENDENCY_INTERVAL,
};
use crate::remote_shell::{server_host, RemoteShellFactory, ShellParams};
use crate::session::{Session, SessionCache, SessionParams};
use crate::store::MachineStore;
use crds::{
    MachineState, VSphereCluster, VSphereMachine, VSphereMachineStatus, BOOTSTRAP_DATA_KEY,
    VSPHERE_MACHINE_FINALIZER,
};
use ipam_client::IpamAgentFactory;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use kube_runtime::controller::Action;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use vm::{MachineRequest, VmReconciler};

const CREDENTIALS_USERNAME_KEY: &str = "username";
const CREDENTIALS_PASSWORD_KEY: &str = "password";

/// Where a deletion pass left the machine
enum Deletion {
    /// Hypervisor work is still in flight
    Pending(ReconcileOutcome),
    /// Finalizer removed; the object may already be gone
    Finished,
}

/// Hypervisor access resolved from a machine and its cluster
struct Connection {
    session: Arc<Session>,
    shell: ShellParams,
}

/// Reconciles VSphereMachine resources
pub struct Reconciler {
    store: Arc<dyn MachineStore>,
    sessions: Arc<SessionCache>,
    ipam: IpamService,
    shells: Arc<dyn RemoteShellFactory>,
    events: Arc<dyn EventPublisher>,
    /// Credentials for clusters without a credentials Secret
    username: String,
    password: String,
    backoff: BackoffTracker,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn MachineStore>,
        sessions: Arc<SessionCache>,
        ipam_agents: Arc<dyn IpamAgentFactory>,
        shells: Arc<dyn RemoteShellFactory>,
        events: Arc<dyn EventPublisher>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            ipam: IpamService::new(ipam_agents, Arc::clone(&store)),
            store,
            sessions,
            shells,
            events,
            username: username.into(),
            password: password.into(),
            backoff: BackoffTracker::default(),
        }
    }

    /// Reconcile one machine and persist the resulting status
    pub async fn reconcile(&self, machine: &VSphereMachine) -> Result<ReconcileOutcome, ControllerError> {
        let key = resource_key(machine);
        let span = info_span!("reconcile", machine = %key);
        self.reconcile_machine(machine, &key).instrument(span).await
    }

    /// Requeue decision for a failed reconcile
    pub fn error_action(&self, machine: &VSphereMachine, error: &ControllerError) -> Action {
        let key = resource_key(machine);
        match error.kind() {
            ErrorKind::Validation => {
                warn!("{} needs a spec change: {}", key, error);
                Action::await_change()
            }
            ErrorKind::Fatal => {
                error!("Fatal error reconciling {}: {}", key, error);
                Action::await_change()
            }
            ErrorKind::External => {
                let (delay, failures) = self.backoff.record_failure(&key);
                warn!(
                    "Reconciling {} failed ({} consecutive), retrying in {}s: {}",
                    key,
                    failures,
                    delay.as_secs(),
                    error
                );
                Action::requeue(delay)
            }
        }
    }

    async fn reconcile_machine(
        &self,
        machine: &VSphereMachine,
        key: &str,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let current = machine.status.as_ref();
        let mut status = current.cloned().unwrap_or_default();

        let result = if machine.meta().deletion_timestamp.is_some() {
            match self.delete(machine, &mut status).await {
                Ok(Deletion::Finished) => {
                    info!("Deletion of {} complete", key);
                    self.backoff.forget(key);
                    metrics::record_reconcile("deleted");
                    return Ok(ReconcileOutcome::Done);
                }
                Ok(Deletion::Pending(outcome)) => Ok(outcome),
                Err(e) => Err(e),
            }
        } else {
            self.apply(machine, &mut status).await
        };

        let result = match result {
            Ok(outcome) => {
                if outcome.is_done() {
                    clear_failure(&mut status);
                }
                self.backoff.record_success(key);
                Ok(outcome)
            }
            Err(e) if e.is_transient() => {
                warn!("Transient error reconciling {}, retrying: {}", key, e);
                Ok(ReconcileOutcome::RetryAfter(TRANSIENT_ERROR_INTERVAL))
            }
            Err(e) => {
                let e = e.for_machine(key);
                self.record_failure(machine, &mut status, &e).await;
                Err(e)
            }
        };

        if let Err(write_error) = self.write_status(machine, current, &mut status).await {
            return match result {
                Ok(_) => Err(write_error.for_machine(key)),
                Err(e) => {
                    warn!("Failed to record status of {}: {}", key, write_error);
                    Err(e)
                }
            };
        }

        metrics::record_reconcile(match &result {
            Ok(ReconcileOutcome::Done) => "done",
            Ok(ReconcileOutcome::RetryAfter(_)) => "requeue",
            Ok(ReconcileOutcome::AwaitChange) => "held",
            Err(_) => "error",
        });
        result
    }

    async fn apply(
        &self,
        machine: &VSphereMachine,
        status: &mut VSphereMachineStatus,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let namespace = machine.namespace().unwrap_or_default();
        let name = machine.name_any();

        self.ensure_finalizer(machine).await?;

        let Some(cluster) = self.store.get_cluster(&namespace, &machine.spec.cluster_name).await? else {
            info!(
                "Cluster {} of {}/{} does not exist yet",
                machine.spec.cluster_name, namespace, name
            );
            return Ok(ReconcileOutcome::RetryAfter(WAIT_FOR_DEPENDENCY_INTERVAL));
        };

        let mut spec = machine.spec.clone();
        if let Some(devices) = self.ipam.reconcile(machine, &cluster, self.events.as_ref()).await? {
            spec.network.devices = devices;
        }
        let devices_before = spec.network.devices.clone();

        let connection = self.connect(machine, &cluster).await?;
        let bootstrap = self.bootstrap_data(&namespace, machine).await?;
        let req = machine_request(machine, bootstrap)?;

        let outcome = VmReconciler::new(&connection.session, self.events.as_ref(), self.shells.as_ref())
            .with_shell_params(connection.shell)
            .reconcile(&req, &mut spec, status)
            .await?;

        if spec.network.devices != devices_before {
            debug!("Recording adapter MAC addresses of {}/{}", namespace, name);
            let patch = json!({ "spec": { "network": { "devices": &spec.network.devices } } });
            self.store.patch_machine(&namespace, &name, &patch).await?;
        }
        Ok(outcome)
    }

    async fn delete(
        &self,
        machine: &VSphereMachine,
        status: &mut VSphereMachineStatus,
    ) -> Result<Deletion, ControllerError> {
        if !has_finalizer(machine) {
            return Ok(Deletion::Finished);
        }
        let namespace = machine.namespace().unwrap_or_default();
        let cluster = self.store.get_cluster(&namespace, &machine.spec.cluster_name).await?;

        if status.machine_ref.is_some() || status.task_ref.is_some() {
            let Some(cluster) = &cluster else {
                warn!(
                    "Cluster {} is gone but VM {} of {}/{} remains",
                    machine.spec.cluster_name,
                    status.machine_ref.as_deref().unwrap_or("<pending>"),
                    namespace,
                    machine.name_any()
                );
                return Ok(Deletion::Pending(ReconcileOutcome::RetryAfter(
                    WAIT_FOR_DEPENDENCY_INTERVAL,
                )));
            };
            let connection = self.connect(machine, cluster).await?;
            let req = machine_request(machine, None)?;
            let outcome = VmReconciler::new(&connection.session, self.events.as_ref(), self.shells.as_ref())
                .delete(&req, status)
                .await?;
            if !outcome.is_done() {
                return Ok(Deletion::Pending(outcome));
            }
        } else {
            debug!("No VM recorded for {}/{}", namespace, machine.name_any());
            status.ready = false;
            status.state = MachineState::NotFound;
        }

        match &cluster {
            Some(cluster) => self.ipam.release(machine, cluster, self.events.as_ref()).await?,
            None => warn!(
                "Cluster {} of {}/{} is gone, leaving any address leases in place",
                machine.spec.cluster_name,
                namespace,
                machine.name_any()
            ),
        }

        self.remove_finalizer(machine).await?;
        Ok(Deletion::Finished)
    }

    async fn connect(
        &self,
        machine: &VSphereMachine,
        cluster: &VSphereCluster,
    ) -> Result<Connection, ControllerError> {
        let namespace = machine.namespace().unwrap_or_default();
        let (username, password) = self.credentials(&namespace, cluster).await?;

        let mut params = SessionParams::new(cluster.spec.server.as_str())
            .with_user_info(username.as_str(), password.as_str())
            .with_insecure(cluster.spec.insecure);
        if let Some(thumbprint) = cluster.spec.thumbprint.as_deref() {
            params = params.with_thumbprint(thumbprint);
        }
        if let Some(datacenter) = machine
            .spec
            .datacenter
            .as_deref()
            .or(cluster.spec.datacenter.as_deref())
        {
            params = params.with_datacenter(datacenter);
        }
        let session = self.sessions.get_or_create(&params).await?;

        Ok(Connection {
            session,
            shell: ShellParams {
                host: server_host(&cluster.spec.server),
                port: cluster.spec.ssh_port,
                username,
                password,
            },
        })
    }

    /// Cluster credentials Secret, or the controller defaults
    async fn credentials(
        &self,
        namespace: &str,
        cluster: &VSphereCluster,
    ) -> Result<(String, String), ControllerError> {
        let Some(secret) = cluster.spec.credentials_secret.as_deref() else {
            return Ok((self.username.clone(), self.password.clone()));
        };
        let data = self.store.get_secret_data(namespace, secret).await?.ok_or_else(|| {
            ControllerError::InvalidConfig(format!(
                "credentials Secret {}/{} not found",
                namespace, secret
            ))
        })?;

        let field = |key: &str| {
            data.get(key)
                .and_then(|value| String::from_utf8(value.clone()).ok())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| {
                    ControllerError::InvalidConfig(format!(
                        "credentials Secret {}/{} has no {}",
                        namespace, secret, key
                    ))
                })
        };
        Ok((field(CREDENTIALS_USERNAME_KEY)?, field(CREDENTIALS_PASSWORD_KEY)?))
    }

    /// `None` until the bootstrap Secret exists
    async fn bootstrap_data(
        &self,
        namespace: &str,
        machine: &VSphereMachine,
    ) -> Result<Option<Vec<u8>>, ControllerError> {
        let Some(secret) = machine.spec.bootstrap_data_secret.as_deref() else {
            return Ok(None);
        };
        Ok(self
            .store
            .get_secret_data(namespace, secret)
            .await?
            .and_then(|mut data| data.remove(BOOTSTRAP_DATA_KEY)))
    }

    async fn ensure_finalizer(&self, machine: &VSphereMachine) -> Result<(), ControllerError> {
        if has_finalizer(machine) {
            return Ok(());
        }
        let mut finalizers = machine.finalizers().to_vec();
        finalizers.push(VSPHERE_MACHINE_FINALIZER.to_string());
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        self.store
            .patch_machine(&machine.namespace().unwrap_or_default(), &machine.name_any(), &patch)
            .await?;
        debug!("Added finalizer to {}", resource_key(machine));
        Ok(())
    }

    async fn remove_finalizer(&self, machine: &VSphereMachine) -> Result<(), ControllerError> {
        let finalizers: Vec<&String> = machine
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != VSPHERE_MACHINE_FINALIZER)
            .collect();
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        self.store
            .patch_machine(&machine.namespace().unwrap_or_default(), &machine.name_any(), &patch)
            .await
    }

    async fn record_failure(
        &self,
        machine: &VSphereMachine,
        status: &mut VSphereMachineStatus,
        error: &ControllerError,
    ) {
        status.failure_reason = Some(error.reason().to_string());
        status.failure_message = Some(error.to_string());
        if error.kind() == ErrorKind::Validation {
            status.ready = false;
            status.state = MachineState::Failed;
        }
        if error.kind() != ErrorKind::Fatal {
            self.events
                .publish(
                    &machine.object_ref(&()),
                    EventType::Warning,
                    reasons::RECONCILE_FAILED,
                    actions::RECONCILE,
                    Some(error.to_string()),
                )
                .await;
        }
    }

    async fn write_status(
        &self,
        machine: &VSphereMachine,
        current: Option<&VSphereMachineStatus>,
        status: &mut VSphereMachineStatus,
    ) -> Result<(), ControllerError> {
        touch_last_reconciled(current, status);
        if !status_needs_update(current, status) {
            return Ok(());
        }
        self.store
            .patch_machine_status(
                &machine.namespace().unwrap_or_default(),
                &machine.name_any(),
                &status_patch(status),
            )
            .await
    }
}

fn has_finalizer(machine: &VSphereMachine) -> bool {
    machine
        .finalizers()
        .iter()
        .any(|f| f == VSPHERE_MACHINE_FINALIZER)
}

fn machine_request(
    machine: &VSphereMachine,
    bootstrap_data: Option<Vec<u8>>,
) -> Result<MachineRequest, ControllerError> {
    let uid = machine
        .uid()
        .ok_or_else(|| ControllerError::Validation("machine has no UID".to_string()))?;
    Ok(MachineRequest {
        key: resource_key(machine),
        name: machine.name_any(),
        uid,
        generation: machine.meta().generation.unwrap_or_default(),
        object_ref: machine.object_ref(&()),
        bootstrap_data,
    })
}
