//! vSphere API models
//!
//! These models follow the VI/JSON wire format: camelCase properties and a
//! `_typeName` discriminator on polymorphic data objects (devices, backings).
//! Only the subset of the vim25 schema needed to provision one VM is modelled.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bytes in one GiB
pub const GIB: i64 = 1024 * 1024 * 1024;

/// Managed object type names
pub mod moref_type {
    pub const VIRTUAL_MACHINE: &str = "VirtualMachine";
    pub const TASK: &str = "Task";
    pub const DATACENTER: &str = "Datacenter";
    pub const FOLDER: &str = "Folder";
    pub const DATASTORE: &str = "Datastore";
    pub const RESOURCE_POOL: &str = "ResourcePool";
    pub const HOST_SYSTEM: &str = "HostSystem";
    pub const NETWORK: &str = "Network";
    pub const COMPUTE_RESOURCE: &str = "ComputeResource";
    pub const CLUSTER_COMPUTE_RESOURCE: &str = "ClusterComputeResource";
}

/// Reference to a server-side managed object (MoRef)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManagedObjectReference {
    #[serde(rename = "type")]
    pub type_: String,
    pub value: String,
}

impl ManagedObjectReference {
    pub fn new(type_: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            value: value.into(),
        }
    }

    pub fn virtual_machine(value: impl Into<String>) -> Self {
        Self::new(moref_type::VIRTUAL_MACHINE, value)
    }

    pub fn task(value: impl Into<String>) -> Self {
        Self::new(moref_type::TASK, value)
    }

    pub fn is_type(&self, type_: &str) -> bool {
        self.type_ == type_
    }
}

impl fmt::Display for ManagedObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_, self.value)
    }
}

/// `ServiceContent.about`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AboutInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    /// "VirtualCenter" for vCenter, "HostAgent" for a standalone ESXi host
    pub api_type: String,
    #[serde(default)]
    pub api_version: String,
}

impl AboutInfo {
    /// vCenter supports server-side cloning; standalone hosts do not.
    pub fn is_vcenter(&self) -> bool {
        self.api_type == "VirtualCenter"
    }
}

/// Folders and inventory hanging off a datacenter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatacenterInfo {
    pub name: String,
    pub vm_folder: ManagedObjectReference,
    pub host_folder: ManagedObjectReference,
    #[serde(default)]
    pub datastore: Vec<ManagedObjectReference>,
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
    /// Any state string this client does not know about
    #[serde(other)]
    Unknown,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Success => "success",
            TaskState::Error => "error",
            TaskState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Fault attached to a failed task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LocalizedMethodFault {
    #[serde(default)]
    pub localized_message: Option<String>,
}

/// `Task.info`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub key: String,
    pub state: TaskState,
    /// Result object; for clone/create tasks this is the new VM
    #[serde(default)]
    pub result: Option<ManagedObjectReference>,
    #[serde(default)]
    pub error: Option<LocalizedMethodFault>,
    #[serde(default)]
    pub description_id: Option<String>,
}

impl TaskInfo {
    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .and_then(|e| e.localized_message.clone())
            .unwrap_or_else(|| "task failed without a fault message".to_string())
    }
}

/// VM power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VirtualMachinePowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

/// Extra-config key/value pair
///
/// On the wire the value is an `xsd:string` wrapper
/// (`{"_typeName": "string", "_value": "..."}`); plain strings are accepted too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionValue {
    pub key: String,
    #[serde(with = "typed_string")]
    pub value: String,
}

impl OptionValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

mod typed_string {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Typed {
        #[serde(rename = "_typeName")]
        type_name: String,
        #[serde(rename = "_value")]
        value: String,
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Plain(String),
        Typed(Typed),
    }

    pub fn serialize<S: Serializer>(value: &str, serializer: S) -> Result<S::Ok, S::Error> {
        Typed {
            type_name: "string".to_string(),
            value: value.to_string(),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(match Wire::deserialize(deserializer)? {
            Wire::Plain(s) => s,
            Wire::Typed(t) => t.value,
        })
    }
}

/// Device label/summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Description {
    pub label: String,
    #[serde(default)]
    pub summary: String,
}

impl Description {
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            summary: label.clone(),
            label,
        }
    }
}

/// Flat VMDK backing of a virtual disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskBacking {
    #[serde(rename = "_typeName", default = "DiskBacking::flat_ver2")]
    pub type_name: String,
    /// Datastore path, e.g. `[datastore1] template/template.vmdk`
    pub file_name: String,
    #[serde(default)]
    pub datastore: Option<ManagedObjectReference>,
    #[serde(default)]
    pub disk_mode: Option<String>,
    #[serde(default)]
    pub thin_provisioned: Option<bool>,
}

impl DiskBacking {
    fn flat_ver2() -> String {
        "VirtualDiskFlatVer2BackingInfo".to_string()
    }

    /// Thin, persistent backing for a disk created on the given datastore path
    pub fn thin(file_name: impl Into<String>, datastore: ManagedObjectReference) -> Self {
        Self {
            type_name: Self::flat_ver2(),
            file_name: file_name.into(),
            datastore: Some(datastore),
            disk_mode: Some("persistent".to_string()),
            thin_provisioned: Some(true),
        }
    }

    /// Path relative to the datastore root (the part after `[ds] `)
    pub fn relative_path(&self) -> Option<&str> {
        self.file_name.split_once(' ').map(|(_, path)| path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDisk {
    pub key: i32,
    #[serde(default)]
    pub device_info: Option<Description>,
    #[serde(default)]
    pub controller_key: Option<i32>,
    #[serde(default)]
    pub unit_number: Option<i32>,
    pub capacity_in_bytes: i64,
    pub backing: DiskBacking,
}

impl VirtualDisk {
    pub fn label(&self) -> &str {
        self.device_info.as_ref().map_or("", |d| d.label.as_str())
    }
}

/// Standard network backing for an ethernet card
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkBacking {
    #[serde(rename = "_typeName", default = "NetworkBacking::network")]
    pub type_name: String,
    pub device_name: String,
    #[serde(default)]
    pub network: Option<ManagedObjectReference>,
}

impl NetworkBacking {
    fn network() -> String {
        "VirtualEthernetCardNetworkBackingInfo".to_string()
    }

    pub fn new(device_name: impl Into<String>, network: ManagedObjectReference) -> Self {
        Self {
            type_name: Self::network(),
            device_name: device_name.into(),
            network: Some(network),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualEthernetCard {
    pub key: i32,
    #[serde(default)]
    pub device_info: Option<Description>,
    #[serde(default)]
    pub backing: Option<NetworkBacking>,
    /// "Manual", "Generated", "Assigned" or "Automatic"
    #[serde(default)]
    pub address_type: Option<String>,
    #[serde(default)]
    pub mac_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualController {
    pub key: i32,
    #[serde(default)]
    pub device_info: Option<Description>,
    #[serde(default)]
    pub bus_number: Option<i32>,
    #[serde(default)]
    pub shared_bus: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualSerialPort {
    pub key: i32,
    #[serde(default)]
    pub device_info: Option<Description>,
    #[serde(default)]
    pub controller_key: Option<i32>,
    #[serde(default)]
    pub yield_on_poll: Option<bool>,
}

/// Hardware device attached to a VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_typeName")]
pub enum VirtualDevice {
    VirtualDisk(VirtualDisk),
    VirtualVmxnet3(VirtualEthernetCard),
    VirtualVmxnet2(VirtualEthernetCard),
    VirtualE1000(VirtualEthernetCard),
    VirtualE1000e(VirtualEthernetCard),
    #[serde(rename = "ParaVirtualSCSIController")]
    ParaVirtualScsiController(VirtualController),
    #[serde(rename = "VirtualLsiLogicController")]
    LsiLogicController(VirtualController),
    #[serde(rename = "VirtualSIOController")]
    SioController(VirtualController),
    VirtualSerialPort(VirtualSerialPort),
    /// Devices this client does not model (CD-ROM, video card, ...)
    #[serde(other)]
    Other,
}

impl VirtualDevice {
    pub fn as_disk(&self) -> Option<&VirtualDisk> {
        match self {
            VirtualDevice::VirtualDisk(disk) => Some(disk),
            _ => None,
        }
    }

    pub fn as_ethernet_card(&self) -> Option<&VirtualEthernetCard> {
        match self {
            VirtualDevice::VirtualVmxnet3(nic)
            | VirtualDevice::VirtualVmxnet2(nic)
            | VirtualDevice::VirtualE1000(nic)
            | VirtualDevice::VirtualE1000e(nic) => Some(nic),
            _ => None,
        }
    }

    pub fn as_ethernet_card_mut(&mut self) -> Option<&mut VirtualEthernetCard> {
        match self {
            VirtualDevice::VirtualVmxnet3(nic)
            | VirtualDevice::VirtualVmxnet2(nic)
            | VirtualDevice::VirtualE1000(nic)
            | VirtualDevice::VirtualE1000e(nic) => Some(nic),
            _ => None,
        }
    }

    pub fn key(&self) -> Option<i32> {
        match self {
            VirtualDevice::VirtualDisk(d) => Some(d.key),
            VirtualDevice::VirtualVmxnet3(n)
            | VirtualDevice::VirtualVmxnet2(n)
            | VirtualDevice::VirtualE1000(n)
            | VirtualDevice::VirtualE1000e(n) => Some(n.key),
            VirtualDevice::ParaVirtualScsiController(c)
            | VirtualDevice::LsiLogicController(c)
            | VirtualDevice::SioController(c) => Some(c.key),
            VirtualDevice::VirtualSerialPort(p) => Some(p.key),
            VirtualDevice::Other => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceOperation {
    Add,
    Edit,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileOperation {
    Create,
    Destroy,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDeviceConfigSpec {
    pub operation: DeviceOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_operation: Option<FileOperation>,
    pub device: VirtualDevice,
}

impl VirtualDeviceConfigSpec {
    pub fn add(device: VirtualDevice) -> Self {
        Self {
            operation: DeviceOperation::Add,
            file_operation: None,
            device,
        }
    }

    pub fn edit(device: VirtualDevice) -> Self {
        Self {
            operation: DeviceOperation::Edit,
            file_operation: None,
            device,
        }
    }

    pub fn remove(device: VirtualDevice) -> Self {
        Self {
            operation: DeviceOperation::Remove,
            file_operation: None,
            device,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineFlagInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_uuid_enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineFileInfo {
    pub vm_path_name: String,
}

/// `VirtualMachineConfigSpec`: the payload of create, clone and reconfigure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineConfigSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_uuid: Option<String>,
    #[serde(rename = "numCPUs", default, skip_serializing_if = "Option::is_none")]
    pub num_cpus: Option<i32>,
    #[serde(rename = "memoryMB", default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    /// Passed through verbatim from the template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_options: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<VirtualMachineFlagInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<VirtualMachineFileInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_change: Vec<VirtualDeviceConfigSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_config: Vec<OptionValue>,
}

/// Per-disk placement of a clone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineRelocateSpecDiskLocator {
    /// Device key of the source disk
    pub disk_id: i32,
    pub datastore: ManagedObjectReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_move_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_backing_info: Option<DiskBacking>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineRelocateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore: Option<ManagedObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<ManagedObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<ManagedObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<ManagedObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_move_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disk: Vec<VirtualMachineRelocateSpecDiskLocator>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineCloneSpec {
    pub location: VirtualMachineRelocateSpec,
    pub template: bool,
    pub power_on: bool,
    /// Snapshot to clone from; required for linked clones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<ManagedObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<VirtualMachineConfigSpec>,
}

/// CPU or memory allocation of a resource pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAllocationInfo {
    pub reservation: i64,
    pub expandable_reservation: bool,
    /// -1 means unlimited
    pub limit: i64,
    pub shares: SharesInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharesInfo {
    pub shares: i32,
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfigSpec {
    pub cpu_allocation: ResourceAllocationInfo,
    pub memory_allocation: ResourceAllocationInfo,
}

impl Default for ResourceConfigSpec {
    /// No reservation, no limit, normal shares, expandable
    fn default() -> Self {
        let allocation = ResourceAllocationInfo {
            reservation: 0,
            expandable_reservation: true,
            limit: -1,
            shares: SharesInfo {
                shares: 0,
                level: "normal".to_string(),
            },
        };
        Self {
            cpu_allocation: allocation.clone(),
            memory_allocation: allocation,
        }
    }
}

/// One entry of `guest.net` as reported by VMware Tools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GuestNicInfo {
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub ip_address: Vec<String>,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub connected: bool,
}

/// One node of a VM's snapshot tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotTree {
    pub snapshot: ManagedObjectReference,
    pub name: String,
    #[serde(default)]
    pub child_snapshot_list: Vec<VirtualMachineSnapshotTree>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotInfo {
    #[serde(default)]
    pub current_snapshot: Option<ManagedObjectReference>,
    #[serde(default)]
    pub root_snapshot_list: Vec<VirtualMachineSnapshotTree>,
}

impl VirtualMachineSnapshotInfo {
    /// Depth-first search of the tree by snapshot name
    pub fn find(&self, name: &str) -> Option<&ManagedObjectReference> {
        fn walk<'a>(
            nodes: &'a [VirtualMachineSnapshotTree],
            name: &str,
        ) -> Option<&'a ManagedObjectReference> {
            nodes.iter().find_map(|node| {
                if node.name == name {
                    Some(&node.snapshot)
                } else {
                    walk(&node.child_snapshot_list, name)
                }
            })
        }
        walk(&self.root_snapshot_list, name)
    }
}

/// The VM properties the controller reads in a single fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineProperties {
    pub name: String,
    #[serde(default)]
    pub instance_uuid: Option<String>,
    /// BIOS UUID (`config.uuid`)
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub guest_id: Option<String>,
    #[serde(default)]
    pub firmware: Option<String>,
    #[serde(default)]
    pub boot_options: Option<serde_json::Value>,
    #[serde(rename = "numCPU", default)]
    pub num_cpu: i32,
    #[serde(rename = "memoryMB", default)]
    pub memory_mb: i64,
    #[serde(default)]
    pub devices: Vec<VirtualDevice>,
    #[serde(default)]
    pub extra_config: Vec<OptionValue>,
    #[serde(default)]
    pub power_state: Option<VirtualMachinePowerState>,
    #[serde(default)]
    pub host: Option<ManagedObjectReference>,
    #[serde(default)]
    pub resource_pool: Option<ManagedObjectReference>,
    #[serde(default)]
    pub guest_net: Vec<GuestNicInfo>,
    #[serde(default)]
    pub snapshot: Option<VirtualMachineSnapshotInfo>,
}

impl VirtualMachineProperties {
    pub fn disks(&self) -> impl Iterator<Item = &VirtualDisk> {
        self.devices.iter().filter_map(VirtualDevice::as_disk)
    }

    pub fn ethernet_cards(&self) -> impl Iterator<Item = &VirtualEthernetCard> {
        self.devices.iter().filter_map(VirtualDevice::as_ethernet_card)
    }

    pub fn extra_config_value(&self, key: &str) -> Option<&str> {
        self.extra_config
            .iter()
            .find(|o| o.key == key)
            .map(|o| o.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostProperties {
    pub name: String,
    /// Name of the parent compute resource or cluster
    pub compute_resource_name: String,
    /// Root resource pool of the host's compute resource
    pub resource_pool: ManagedObjectReference,
}

/// Credentials and endpoint for a new session
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub server: String,
    pub username: String,
    pub password: String,
    /// Skip TLS certificate verification
    pub insecure: bool,
    /// Accept exactly the certificate with this SHA-1 or SHA-256 fingerprint
    /// (hex, colons optional); takes precedence over `insecure`
    pub thumbprint: Option<String>,
}

impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("insecure", &self.insecure)
            .field("thumbprint", &self.thumbprint)
            .finish()
    }
}
