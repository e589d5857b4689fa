//! Kubernetes Event recording.
//!
//! Events are fire-and-forget: a failed publish is logged and never fails the
//! reconcile that emitted it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Events about a resource
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// `Recorder`-backed publisher
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl std::fmt::Debug for KubeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventPublisher").finish_non_exhaustive()
    }
}

impl KubeEventPublisher {
    /// `controller_name` becomes the reporting component of every Event
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Event reasons (the REASON column of `kubectl get events`)
pub mod reasons {
    pub const CLONE_SUBMITTED: &str = "CloneSubmitted";
    pub const CREATE_SUBMITTED: &str = "CreateSubmitted";
    pub const POWER_ON_SUBMITTED: &str = "PowerOnSubmitted";
    pub const POWER_OFF_SUBMITTED: &str = "PowerOffSubmitted";
    pub const DESTROY_SUBMITTED: &str = "DestroySubmitted";
    pub const RECONFIGURE_SUBMITTED: &str = "ReconfigureSubmitted";
    pub const TASK_SUCCEEDED: &str = "TaskSucceeded";
    pub const TASK_FAILED: &str = "TaskFailed";
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
    pub const IP_ADDRESSES_RESERVED: &str = "IPAddressesReserved";
    pub const IP_ADDRESSES_RELEASED: &str = "IPAddressesReleased";
}

/// Event actions
pub mod actions {
    pub const PROVISION: &str = "Provision";
    pub const RECONCILE: &str = "Reconcile";
    pub const DELETE: &str = "Delete";
}
