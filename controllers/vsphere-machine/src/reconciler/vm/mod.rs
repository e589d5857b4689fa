//! VM lifecycle state machine
//!
//! Each call maps one reconcile to one step: discover, create, track the
//! pending task, converge an existing VM, or delete. Long-running hypervisor
//! operations are submitted, their task recorded in status, and control
//! returns with a requeue delay; nothing here waits for a task to finish.
//!
//! Submodules:
//! - `task`: polling of the recorded task
//! - `builder`: clone spec for vCenter
//! - `clone`: disk copy and create spec for standalone hosts
//! - `network`: adapter status, MAC back-propagation and IP readiness
//! - `metadata`: cloud-init metadata rendering and drift correction

mod builder;
mod clone;
mod metadata;
mod network;
mod task;


use crate::error::ControllerError;
use crate::events::EventPublisher;
use crate::reconcile_helpers::{
    ReconcileOutcome, OPERATION_INTERVAL, PROVISION_INTERVAL, TASK_POLL_INTERVAL,
    WAIT_FOR_DEPENDENCY_INTERVAL,
};
use crate::remote_shell::{RemoteShellFactory, ShellParams};
use crate::session::Session;
use crds::{MachineState, OperationKind, PowerState, VSphereMachineSpec, VSphereMachineStatus};
use k8s_openapi::api::core::v1::ObjectReference;
use tracing::{debug, info, warn};
use vsphere_client::{
    ManagedObjectReference, VSphereError, VirtualMachinePowerState, VirtualMachineProperties,
};

/// Identity of the machine being reconciled and its bootstrap payload
#[derive(Debug, Clone)]
pub struct MachineRequest {
    /// `namespace/name`
    pub key: String,
    /// VM name
    pub name: String,
    /// Stable UID, stamped on the VM as its instance UUID
    pub uid: String,
    /// `metadata.generation` of the resource
    pub generation: i64,
    pub object_ref: ObjectReference,
    /// cloud-init user-data, once the bootstrap Secret exists
    pub bootstrap_data: Option<Vec<u8>>,
}

/// Drives one machine against one hypervisor session
pub struct VmReconciler<'a> {
    session: &'a Session,
    events: &'a dyn EventPublisher,
    shells: &'a dyn RemoteShellFactory,
    shell_params: Option<ShellParams>,
}

impl<'a> VmReconciler<'a> {
    pub fn new(
        session: &'a Session,
        events: &'a dyn EventPublisher,
        shells: &'a dyn RemoteShellFactory,
    ) -> Self {
        Self {
            session,
            events,
            shells,
            shell_params: None,
        }
    }

    /// Shell access to standalone hosts for the create path
    #[must_use]
    pub fn with_shell_params(mut self, params: ShellParams) -> Self {
        self.shell_params = Some(params);
        self
    }

    /// Bring the VM towards `spec`
    ///
    /// MACs assigned by the hypervisor are written back into `spec`.
    pub async fn reconcile(
        &self,
        req: &MachineRequest,
        spec: &mut VSphereMachineSpec,
        status: &mut VSphereMachineStatus,
    ) -> Result<ReconcileOutcome, ControllerError> {
        if held_after_failure(req, status) {
            return Ok(ReconcileOutcome::AwaitChange);
        }
        if let Some(outcome) = task::check_task(self, req, status).await? {
            return Ok(outcome);
        }

        let vm = match status.machine_ref.as_deref() {
            Some(value) => ManagedObjectReference::virtual_machine(value),
            None => match self.session.finder().vm_by_instance_uuid(&req.uid).await? {
                Some(found) => {
                    info!("Found existing VM {} for {} by instance UUID", found.value, req.key);
                    status.machine_ref = Some(found.value.clone());
                    found
                }
                None => return self.create(req, spec, status).await,
            },
        };

        let props = match self.session.client().vm_properties(&vm).await {
            Ok(props) => props,
            Err(VSphereError::NotFound(_)) => {
                warn!("VM {} of {} no longer exists", vm.value, req.key);
                status.machine_ref = None;
                status.power_state = None;
                status.ready = false;
                status.state = MachineState::Pending;
                return Ok(ReconcileOutcome::RetryAfter(TASK_POLL_INTERVAL));
            }
            Err(e) => return Err(e.into()),
        };
        status.power_state = props.power_state.map(power_state);

        let outcome = network::reconcile_network(spec, status, &props)?;
        if !outcome.is_done() {
            return Ok(outcome);
        }

        let outcome = metadata::reconcile_metadata(self, req, spec, status, &vm, &props).await?;
        if !outcome.is_done() {
            return Ok(outcome);
        }

        let outcome = self.reconcile_power_state(req, status, &vm, &props).await?;
        if !outcome.is_done() {
            return Ok(outcome);
        }

        status.bios_uuid = props.uuid.clone();
        status.instance_uuid = props.instance_uuid.clone();
        status.state = MachineState::Ready;
        status.ready = true;
        Ok(ReconcileOutcome::Done)
    }

    /// Tear the VM down; `Done` once it is gone
    pub async fn delete(
        &self,
        req: &MachineRequest,
        status: &mut VSphereMachineStatus,
    ) -> Result<ReconcileOutcome, ControllerError> {
        status.ready = false;
        status.state = MachineState::Deleting;

        if held_after_failure(req, status) {
            return Ok(ReconcileOutcome::AwaitChange);
        }
        if let Some(outcome) = task::check_task(self, req, status).await? {
            return Ok(outcome);
        }

        let Some(value) = status.machine_ref.clone() else {
            debug!("No VM recorded for {}, nothing to delete", req.key);
            status.state = MachineState::NotFound;
            status.power_state = None;
            return Ok(ReconcileOutcome::Done);
        };
        let vm = ManagedObjectReference::virtual_machine(value);

        let props = match self.session.client().vm_properties(&vm).await {
            Ok(props) => props,
            Err(VSphereError::NotFound(_)) => {
                info!("VM {} of {} is gone", vm.value, req.key);
                status.machine_ref = None;
                status.power_state = None;
                status.state = MachineState::NotFound;
                return Ok(ReconcileOutcome::Done);
            }
            Err(e) => return Err(e.into()),
        };
        status.power_state = props.power_state.map(power_state);

        let client = self.session.client();
        if props.power_state == Some(VirtualMachinePowerState::PoweredOn) {
            let task = client.power_off_vm(&vm).await?;
            task::record_submission(self, req, status, &task, OperationKind::PowerOff).await;
        } else {
            let task = client.destroy_vm(&vm).await?;
            task::record_submission(self, req, status, &task, OperationKind::Destroy).await;
        }
        Ok(ReconcileOutcome::RetryAfter(OPERATION_INTERVAL))
    }

    async fn create(
        &self,
        req: &MachineRequest,
        spec: &VSphereMachineSpec,
        status: &mut VSphereMachineStatus,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let Some(bootstrap) = req.bootstrap_data.as_deref().filter(|data| !data.is_empty()) else {
            info!("Bootstrap data for {} is not available yet", req.key);
            return Ok(ReconcileOutcome::RetryAfter(WAIT_FOR_DEPENDENCY_INTERVAL));
        };

        status.ready = false;
        status.state = MachineState::Pending;

        if self.session.is_vcenter() {
            let plan = builder::build_clone(self.session, req, spec, bootstrap).await?;
            let task = self
                .session
                .client()
                .clone_vm(&plan.template, &plan.folder, &req.name, &plan.spec)
                .await?;
            status.clone_mode = Some(plan.mode);
            status.snapshot = plan.spec.snapshot.as_ref().map(|s| s.value.clone());
            task::record_submission(self, req, status, &task, OperationKind::Clone).await;
        } else {
            let params = self.shell_params.as_ref().ok_or_else(|| {
                ControllerError::InvalidConfig(format!(
                    "{} is a standalone host and no remote shell is configured",
                    self.session.client().server()
                ))
            })?;
            let task =
                clone::create_from_template(self.session, self.shells, params, req, spec, bootstrap)
                    .await?;
            task::record_submission(self, req, status, &task, OperationKind::Create).await;
        }
        Ok(ReconcileOutcome::RetryAfter(PROVISION_INTERVAL))
    }

    async fn reconcile_power_state(
        &self,
        req: &MachineRequest,
        status: &mut VSphereMachineStatus,
        vm: &ManagedObjectReference,
        props: &VirtualMachineProperties,
    ) -> Result<ReconcileOutcome, ControllerError> {
        match props.power_state {
            Some(VirtualMachinePowerState::PoweredOn) => Ok(ReconcileOutcome::Done),
            Some(_) => {
                let task = self.session.client().power_on_vm(vm).await?;
                task::record_submission(self, req, status, &task, OperationKind::PowerOn).await;
                Ok(ReconcileOutcome::RetryAfter(OPERATION_INTERVAL))
            }
            None => Err(ControllerError::UnexpectedPowerState(format!(
                "VM {} reported no power state",
                vm.value
            ))),
        }
    }
}

/// A task of this generation failed; hold until the resource is edited
fn held_after_failure(req: &MachineRequest, status: &mut VSphereMachineStatus) -> bool {
    match status.failed_generation {
        Some(generation) if generation == req.generation => {
            debug!(
                "{} failed at generation {}, waiting for a spec change",
                req.key, generation
            );
            true
        }
        Some(generation) => {
            info!(
                "{} changed since the failure at generation {}, retrying",
                req.key, generation
            );
            status.failed_generation = None;
            false
        }
        None => false,
    }
}

fn power_state(state: VirtualMachinePowerState) -> PowerState {
    match state {
        VirtualMachinePowerState::PoweredOn => PowerState::PoweredOn,
        VirtualMachinePowerState::PoweredOff => PowerState::PoweredOff,
        VirtualMachinePowerState::Suspended => PowerState::Suspended,
    }
}
