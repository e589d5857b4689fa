//! Helper functions shared by the machine reconcilers
//!
//! Step results, requeue intervals and status patch construction.

use crds::{MachineState, VSphereMachineStatus};
use kube::ResourceExt;
use kube_runtime::controller::Action;
use std::time::Duration;

/// Task polling interval
pub const TASK_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// After a clone or create was submitted
pub const PROVISION_INTERVAL: Duration = Duration::from_secs(20);
/// After a power, reconfigure or destroy task was submitted
pub const OPERATION_INTERVAL: Duration = Duration::from_secs(10);
/// Waiting for the guest to report addresses
pub const WAIT_FOR_IP_INTERVAL: Duration = Duration::from_secs(15);
/// Waiting for the bootstrap Secret or the owning cluster
pub const WAIT_FOR_DEPENDENCY_INTERVAL: Duration = Duration::from_secs(30);
/// Quiet retry of transient endpoint errors
pub const TRANSIENT_ERROR_INTERVAL: Duration = Duration::from_secs(30);
/// Periodic resync of a ready machine
pub const STEADY_STATE_INTERVAL: Duration = Duration::from_secs(300);

/// Result of one reconcile step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing left to do
    Done,
    /// Work is in flight; look again after the given delay
    RetryAfter(Duration),
    /// Nothing will change until the resource is edited
    AwaitChange,
}

impl ReconcileOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, ReconcileOutcome::Done)
    }

    pub fn into_action(self) -> Action {
        match self {
            ReconcileOutcome::Done => Action::requeue(STEADY_STATE_INTERVAL),
            ReconcileOutcome::RetryAfter(delay) => Action::requeue(delay),
            ReconcileOutcome::AwaitChange => Action::await_change(),
        }
    }
}

/// `namespace/name` of a resource, used in logs and as the backoff key
pub fn resource_key<K: ResourceExt>(resource: &K) -> String {
    format!(
        "{}/{}",
        resource.namespace().unwrap_or_default(),
        resource.name_any()
    )
}

/// Whether the status needs to be written back
///
/// `last_reconciled` is ignored so that an unchanged machine does not
/// produce a write, and with it a watch event, on every pass.
pub fn status_needs_update(
    current: Option<&VSphereMachineStatus>,
    desired: &VSphereMachineStatus,
) -> bool {
    match current {
        None => true,
        Some(current) => {
            let mut current = current.clone();
            current.last_reconciled = desired.last_reconciled;
            current != *desired
        }
    }
}

/// Stamp `last_reconciled` when the lifecycle state changed
pub fn touch_last_reconciled(
    current: Option<&VSphereMachineStatus>,
    desired: &mut VSphereMachineStatus,
) {
    let previous_state = current.map(|s| s.state);
    if previous_state != Some(desired.state) || desired.last_reconciled.is_none() {
        desired.last_reconciled = Some(chrono::Utc::now());
    }
}

/// Merge patch replacing the whole status
///
/// Optional fields are serialized only when set, so cleared fields are written
/// as explicit nulls; otherwise a merge patch would keep their old values.
pub fn status_patch(status: &VSphereMachineStatus) -> serde_json::Value {
    let mut body = serde_json::to_value(status).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(fields) = body.as_object_mut() {
        for key in [
            "machineRef",
            "taskRef",
            "taskKind",
            "powerState",
            "biosUuid",
            "instanceUuid",
            "failureReason",
            "failureMessage",
            "failedGeneration",
        ] {
            fields.entry(key).or_insert(serde_json::Value::Null);
        }
        for key in ["network", "addresses"] {
            fields.entry(key).or_insert_with(|| serde_json::json!([]));
        }
    }
    serde_json::json!({ "status": body })
}

/// Status of a machine whose previous attempt failed, minus the failure
pub fn clear_failure(status: &mut VSphereMachineStatus) {
    status.failure_reason = None;
    status.failure_message = None;
    status.failed_generation = None;
    if status.state == MachineState::Failed {
        status.state = MachineState::Pending;
    }
}
