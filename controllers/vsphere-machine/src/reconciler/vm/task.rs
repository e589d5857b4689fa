//! Tracking of the single in-flight hypervisor task
//!
//! The task reference and the operation it was submitted for are stored
//! together in status. The follow-up on success is decided by that recorded
//! kind, never by the platform's task description.

use super::{MachineRequest, VmReconciler};
use crate::error::ControllerError;
use crate::events::{actions, reasons};
use crate::metrics;
use crate::reconcile_helpers::{ReconcileOutcome, OPERATION_INTERVAL, TASK_POLL_INTERVAL};
use crds::{OperationKind, VSphereMachineStatus};
use kube::runtime::events::EventType;
use tracing::{debug, error, info, warn};
use vsphere_client::{ManagedObjectReference, TaskInfo, TaskState, VSphereError};

/// Poll the recorded task
///
/// `None` means there is no task in flight and the caller may continue.
pub(super) async fn check_task(
    vm: &VmReconciler<'_>,
    req: &MachineRequest,
    status: &mut VSphereMachineStatus,
) -> Result<Option<ReconcileOutcome>, ControllerError> {
    let Some(task_ref) = status.task_ref.clone() else {
        return Ok(None);
    };
    let task = ManagedObjectReference::task(task_ref.as_str());

    let Some(info) = vm.session.client().task_info(&task).await? else {
        warn!("Task {} of {} no longer exists on the server", task_ref, req.key);
        status.clear_task();
        return Ok(Some(ReconcileOutcome::RetryAfter(TASK_POLL_INTERVAL)));
    };

    match info.state {
        TaskState::Queued | TaskState::Running => {
            debug!("Task {} of {} is {}", task_ref, req.key, info.state);
            Ok(Some(ReconcileOutcome::RetryAfter(TASK_POLL_INTERVAL)))
        }
        TaskState::Success => task_succeeded(vm, req, status, &info).await,
        TaskState::Error => {
            let message = info.error_message();
            let kind = status.task_kind;
            let operation = kind.map_or("unknown", |k| k.as_str());
            warn!("Task {} ({}) of {} failed: {}", task_ref, operation, req.key, message);
            status.clear_task();
            status.failed_generation = Some(req.generation);
            vm.events
                .publish(
                    &req.object_ref,
                    EventType::Warning,
                    reasons::TASK_FAILED,
                    action_for(kind),
                    Some(format!("task {} failed: {}", task_ref, message)),
                )
                .await;
            Err(ControllerError::TaskFailed {
                task: task_ref,
                operation: operation.to_string(),
                message,
            })
        }
        TaskState::Unknown => {
            error!("Task {} of {} is in an unknown state", task_ref, req.key);
            Err(ControllerError::UnknownTaskState(task_ref))
        }
    }
}

async fn task_succeeded(
    vm: &VmReconciler<'_>,
    req: &MachineRequest,
    status: &mut VSphereMachineStatus,
    info: &TaskInfo,
) -> Result<Option<ReconcileOutcome>, ControllerError> {
    let kind = status.task_kind;
    info!(
        "Task {} ({}) of {} succeeded",
        info.key,
        kind.map_or("unknown", |k| k.as_str()),
        req.key
    );
    status.clear_task();
    vm.events
        .publish(
            &req.object_ref,
            EventType::Normal,
            reasons::TASK_SUCCEEDED,
            action_for(kind),
            Some(format!(
                "task {} ({}) succeeded",
                info.key,
                kind.map_or("unknown", |k| k.as_str())
            )),
        )
        .await;

    match kind {
        Some(OperationKind::Clone) => {
            status.machine_ref = Some(created_vm(info)?.value);
            Ok(None)
        }
        Some(OperationKind::Create) => {
            let created = created_vm(info)?;
            status.machine_ref = Some(created.value.clone());
            let task = vm.session.client().power_on_vm(&created).await?;
            record_submission(vm, req, status, &task, OperationKind::PowerOn).await;
            Ok(Some(ReconcileOutcome::RetryAfter(OPERATION_INTERVAL)))
        }
        Some(OperationKind::Destroy) => {
            status.machine_ref = None;
            status.power_state = None;
            Ok(None)
        }
        Some(OperationKind::Reconfigure | OperationKind::PowerOn | OperationKind::PowerOff) | None => {
            Ok(None)
        }
    }
}

fn created_vm(info: &TaskInfo) -> Result<ManagedObjectReference, ControllerError> {
    info.result.clone().ok_or_else(|| {
        VSphereError::InvalidRequest(format!("task {} succeeded without a result", info.key)).into()
    })
}

/// Record a submitted task as the machine's in-flight task
pub(super) async fn record_submission(
    vm: &VmReconciler<'_>,
    req: &MachineRequest,
    status: &mut VSphereMachineStatus,
    task: &ManagedObjectReference,
    kind: OperationKind,
) {
    info!("Submitted {} task {} for {}", kind, task.value, req.key);
    status.set_task(task.value.as_str(), kind);
    metrics::record_task_submitted(kind.as_str());

    let reason = match kind {
        OperationKind::Clone => reasons::CLONE_SUBMITTED,
        OperationKind::Create => reasons::CREATE_SUBMITTED,
        OperationKind::Reconfigure => reasons::RECONFIGURE_SUBMITTED,
        OperationKind::PowerOn => reasons::POWER_ON_SUBMITTED,
        OperationKind::PowerOff => reasons::POWER_OFF_SUBMITTED,
        OperationKind::Destroy => reasons::DESTROY_SUBMITTED,
    };
    vm.events
        .publish(
            &req.object_ref,
            EventType::Normal,
            reason,
            action_for(Some(kind)),
            Some(format!("{} task {}", kind, task.value)),
        )
        .await;
}

fn action_for(kind: Option<OperationKind>) -> &'static str {
    match kind {
        Some(OperationKind::Clone | OperationKind::Create) => actions::PROVISION,
        Some(OperationKind::PowerOff | OperationKind::Destroy) => actions::DELETE,
        Some(OperationKind::Reconfigure | OperationKind::PowerOn) | None => actions::RECONCILE,
    }
}
