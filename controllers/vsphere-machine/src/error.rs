//! Controller-specific error types.
//!
//! Errors fall into three classes (see [`ErrorKind`]). Validation errors wait
//! for the resource to change, external errors are retried with backoff and
//! fatal errors indicate an invariant the controller does not know how to
//! recover from.

use crate::remote_shell::RemoteShellError;
use ipam_client::IpamError;
use kube::Error as KubeError;
use thiserror::Error;
use vsphere_client::VSphereError;

/// Coarse classification used by the error policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Terminal until the spec is corrected
    Validation,
    /// Failure of the hypervisor, the IPAM agent or the API server
    External,
    /// Invariant violation
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::External => "external",
            ErrorKind::Fatal => "fatal",
        }
    }
}

/// Errors that can occur in the VSphereMachine Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Malformed machine spec
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The VM does not have the configured number of network adapters
    #[error("Network adapter count mismatch: {expected} configured, {actual} reported")]
    NetworkCountMismatch { expected: usize, actual: usize },

    /// Metadata shape the target platform cannot consume
    #[error("Unsupported metadata: {0}")]
    UnsupportedMetadata(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// vSphere API error
    #[error("vSphere error: {0}")]
    VSphere(#[from] VSphereError),

    /// IPAM agent error
    #[error("IPAM error: {0}")]
    Ipam(#[from] IpamError),

    /// Remote shell error
    #[error("Remote shell error: {0}")]
    RemoteShell(#[from] RemoteShellError),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Hypervisor task ended in error; resubmitted only after a spec change
    #[error("Task {task} ({operation}) failed: {message}")]
    TaskFailed {
        task: String,
        operation: String,
        message: String,
    },

    /// Task reported a state the controller does not understand
    #[error("Unknown task state for task {0}")]
    UnknownTaskState(String),

    #[error("Unexpected power state: {0}")]
    UnexpectedPowerState(String),

    /// Error raised while reconciling a specific machine
    #[error("machine {machine}: {source}")]
    Machine {
        machine: String,
        #[source]
        source: Box<ControllerError>,
    },

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Classify the error for the error policy
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControllerError::Validation(_)
            | ControllerError::NetworkCountMismatch { .. }
            | ControllerError::UnsupportedMetadata(_)
            | ControllerError::InvalidConfig(_)
            | ControllerError::TaskFailed { .. } => ErrorKind::Validation,
            ControllerError::VSphere(_)
            | ControllerError::Ipam(_)
            | ControllerError::RemoteShell(_)
            | ControllerError::Kube(_) => ErrorKind::External,
            ControllerError::UnknownTaskState(_)
            | ControllerError::UnexpectedPowerState(_)
            | ControllerError::Watch(_) => ErrorKind::Fatal,
            ControllerError::Machine { source, .. } => source.kind(),
        }
    }

    /// Whether the error should be retried quietly instead of surfaced
    pub fn is_transient(&self) -> bool {
        match self {
            ControllerError::VSphere(e) => e.is_transient(),
            ControllerError::RemoteShell(RemoteShellError::Connect(_)) => true,
            ControllerError::Machine { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Attach the identity of the machine being reconciled
    #[must_use]
    pub fn for_machine(self, machine: &str) -> Self {
        match self {
            already @ ControllerError::Machine { .. } => already,
            other => ControllerError::Machine {
                machine: machine.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Short machine-readable reason recorded in status
    pub fn reason(&self) -> &'static str {
        match self {
            ControllerError::Validation(_) => "ValidationFailed",
            ControllerError::NetworkCountMismatch { .. } => "NetworkCountMismatch",
            ControllerError::UnsupportedMetadata(_) => "UnsupportedMetadata",
            ControllerError::InvalidConfig(_) => "InvalidConfig",
            ControllerError::VSphere(_) => "VSphereError",
            ControllerError::Ipam(_) => "IPAMError",
            ControllerError::RemoteShell(_) => "RemoteShellError",
            ControllerError::Kube(_) => "KubernetesError",
            ControllerError::TaskFailed { .. } => "TaskFailed",
            ControllerError::UnknownTaskState(_) => "UnknownTaskState",
            ControllerError::UnexpectedPowerState(_) => "UnexpectedPowerState",
            ControllerError::Watch(_) => "WatchFailed",
            ControllerError::Machine { source, .. } => source.reason(),
        }
    }
}
