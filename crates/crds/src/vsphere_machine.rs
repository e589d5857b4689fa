//! VSphereMachine CRD
//!
//! Desired state of one virtual machine cloned from a template, and the
//! observed hypervisor state the controller reflects back.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Annotation naming the network that draws from the primary pool
pub const PRIMARY_NETWORK_NAME_ANNOTATION: &str = "primary-network-name";

/// Annotation naming the network that draws from the data pool
pub const STORAGE_NETWORK_NAME_ANNOTATION: &str = "storage-network-name";

/// Annotation holding the JSON map of leased addresses per network type
pub const IPAM_MANAGED_ANNOTATION: &str = "ipam-managed";

/// Finalizer guarding hypervisor cleanup
pub const VSPHERE_MACHINE_FINALIZER: &str = "vspheremachine.infrastructure.vsphere.microscaler.io";

/// Key of the bootstrap Secret holding cloud-init user-data
pub const BOOTSTRAP_DATA_KEY: &str = "value";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.vsphere.microscaler.io",
    version = "v1alpha1",
    kind = "VSphereMachine",
    namespaced,
    status = "VSphereMachineStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Power","type":"string","jsonPath":".status.powerState"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VSphereMachineSpec {
    /// Name of the VSphereCluster in the same namespace
    pub cluster_name: String,

    /// Template VM, by instance UUID or by name
    pub template: String,

    /// Full copy, or a linked clone sharing the template's disks
    #[serde(default)]
    pub clone_mode: CloneMode,

    /// Template snapshot a linked clone is made from; the current snapshot
    /// when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,

    /// Resource pool; created under the template host's root pool if missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pool: Option<String>,

    /// Virtual CPUs (at least 2)
    #[serde(default = "default_num_cpus")]
    pub num_cpus: i32,

    /// Memory in MiB; 0 means 2048
    #[serde(rename = "memoryMiB", default)]
    pub memory_mib: i64,

    /// Template disks to grow, matched by label
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DiskSpec>,

    #[serde(default)]
    pub network: NetworkSpec,

    /// Secret whose `value` key holds cloud-init user-data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_data_secret: Option<String>,

    /// Extra VMX settings written into the clone's extraConfig
    #[serde(rename = "customVMXKeys", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_vmx_keys: BTreeMap<String, String>,
}

/// How the template's disks are carried over
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum CloneMode {
    /// Independent copy of every disk
    #[default]
    #[serde(rename = "fullClone")]
    FullClone,
    /// Child disks on top of a template snapshot
    #[serde(rename = "linkedClone")]
    LinkedClone,
}

fn default_num_cpus() -> i32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiskSpec {
    /// Device label, e.g. "Hard disk 1"
    pub label: String,
    #[serde(rename = "sizeGiB")]
    pub size_gib: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    #[serde(default)]
    pub devices: Vec<NetworkDeviceSpec>,

    /// Routes applied to the first device
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<NetworkRouteSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_api_server_cidr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDeviceSpec {
    pub network_name: String,

    /// Fixed MAC; back-filled from the hypervisor when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_addr: Option<String>,

    #[serde(default)]
    pub dhcp4: bool,

    #[serde(default)]
    pub dhcp6: bool,

    /// Static addresses in CIDR form
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addrs: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway4: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway6: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_domains: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<NetworkRouteSpec>,
}

impl NetworkDeviceSpec {
    /// Static addressing requested but no address assigned yet
    pub fn needs_static_address(&self) -> bool {
        !self.dhcp4 && !self.dhcp6 && self.ip_addrs.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRouteSpec {
    pub to: String,
    pub via: String,
    #[serde(default)]
    pub metric: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VSphereMachineStatus {
    #[serde(default)]
    pub ready: bool,

    #[serde(default)]
    pub state: MachineState,

    /// MoRef value of the VM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_ref: Option<String>,

    /// In-flight task; always set together with `task_kind`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_kind: Option<OperationKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_state: Option<PowerState>,

    /// Clone mode actually used; a linked clone without a usable snapshot
    /// falls back to a full clone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone_mode: Option<CloneMode>,

    /// Snapshot MoRef a linked clone was made from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,

    /// One entry per configured device, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network: Vec<NetworkStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bios_uuid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_uuid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    /// Generation whose hypervisor task failed; nothing is resubmitted
    /// until the generation moves on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_generation: Option<i64>,

    /// Last reconciliation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<chrono::DateTime<chrono::Utc>>,
}

impl VSphereMachineStatus {
    pub fn set_task(&mut self, task_ref: impl Into<String>, kind: OperationKind) {
        self.task_ref = Some(task_ref.into());
        self.task_kind = Some(kind);
    }

    pub fn clear_task(&mut self) {
        self.task_ref = None;
        self.task_kind = None;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addrs: Vec<String>,
    pub mac_addr: String,
    #[serde(default)]
    pub network_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct MachineAddress {
    #[serde(rename = "type")]
    pub address_type: MachineAddressType,
    pub address: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum MachineAddressType {
    #[serde(rename = "InternalIP")]
    InternalIp,
    #[serde(rename = "ExternalIP")]
    ExternalIp,
}

/// Machine lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum MachineState {
    #[default]
    Pending,
    Ready,
    Deleting,
    /// VM is gone from the hypervisor
    NotFound,
    Failed,
}

/// Operation a tracked task was submitted for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum OperationKind {
    Clone,
    Create,
    Reconfigure,
    PowerOn,
    PowerOff,
    Destroy,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Clone => "clone",
            OperationKind::Create => "create",
            OperationKind::Reconfigure => "reconfigure",
            OperationKind::PowerOn => "power_on",
            OperationKind::PowerOff => "power_off",
            OperationKind::Destroy => "destroy",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults_apply() {
        let spec: VSphereMachineSpec = serde_json::from_value(serde_json::json!({
            "clusterName": "c1",
            "template": "ubuntu-22.04"
        }))
        .unwrap();
        assert_eq!(spec.num_cpus, 2);
        assert_eq!(spec.memory_mib, 0);
        assert!(spec.network.devices.is_empty());
        assert_eq!(spec.clone_mode, CloneMode::FullClone);
        assert!(spec.custom_vmx_keys.is_empty());
    }

    #[test]
    fn linked_clone_and_vmx_keys_wire_names() {
        let spec: VSphereMachineSpec = serde_json::from_value(serde_json::json!({
            "clusterName": "c1",
            "template": "ubuntu-22.04",
            "cloneMode": "linkedClone",
            "snapshot": "golden",
            "customVMXKeys": {"disk.EnableUUID": "TRUE"}
        }))
        .unwrap();
        assert_eq!(spec.clone_mode, CloneMode::LinkedClone);
        assert_eq!(spec.snapshot.as_deref(), Some("golden"));
        assert_eq!(spec.custom_vmx_keys["disk.EnableUUID"], "TRUE");
    }

    #[test]
    fn device_needs_static_address_only_without_dhcp_or_ips() {
        let mut device = NetworkDeviceSpec {
            network_name: "vm-net".to_string(),
            ..Default::default()
        };
        assert!(device.needs_static_address());
        device.dhcp4 = true;
        assert!(!device.needs_static_address());
        device.dhcp4 = false;
        device.ip_addrs.push("10.0.0.5/24".to_string());
        assert!(!device.needs_static_address());
    }

    #[test]
    fn task_ref_and_kind_move_together() {
        let mut status = VSphereMachineStatus::default();
        status.set_task("task-1", OperationKind::Clone);
        assert_eq!(status.task_kind, Some(OperationKind::Clone));
        status.clear_task();
        assert!(status.task_ref.is_none() && status.task_kind.is_none());
    }

    #[test]
    fn status_wire_names() {
        let status = VSphereMachineStatus {
            state: MachineState::NotFound,
            task_kind: Some(OperationKind::PowerOn),
            power_state: Some(PowerState::PoweredOff),
            addresses: vec![MachineAddress {
                address_type: MachineAddressType::InternalIp,
                address: "10.0.0.5".to_string(),
            }],
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "NotFound");
        assert_eq!(json["taskKind"], "PowerOn");
        assert_eq!(json["powerState"], "poweredOff");
        assert_eq!(json["addresses"][0]["type"], "InternalIP");
    }
}
