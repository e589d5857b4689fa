//! Clone specification builder
//!
//! Resolves the template and placement, then computes the device changes:
//! per-label disk growth and a full replacement of the template's network
//! adapters. The result is built fresh for every attempt.
//!
//! A linked clone is made from a template snapshot, either the named one or
//! the current one. Without a usable snapshot the clone is a full copy.

use super::metadata::{
    BASE64_ENCODING, GUESTINFO_METADATA, GUESTINFO_USERDATA, GUESTINFO_USERDATA_ENCODING,
};
use super::MachineRequest;
use crate::error::ControllerError;
use crate::session::Session;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crds::{CloneMode, DiskSpec, NetworkDeviceSpec, VSphereMachineSpec};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use vsphere_client::{
    Description, ManagedObjectReference, NetworkBacking, OptionValue, ResourceConfigSpec,
    VSphereError, VirtualDevice, VirtualDeviceConfigSpec, VirtualEthernetCard,
    VirtualMachineCloneSpec, VirtualMachineConfigSpec, VirtualMachineFlagInfo,
    VirtualMachineProperties, VirtualMachineRelocateSpec, VirtualMachineRelocateSpecDiskLocator,
    GIB,
};

/// Key of the first added NIC; later NICs count down from here
pub(super) const FIRST_NIC_KEY: i32 = -100;
pub(super) const DISK_MOVE_TYPE: &str = "moveAllDiskBackingsAndConsolidate";
/// Per-disk move type of a full clone
pub(super) const FULL_CLONE_DISK_MOVE_TYPE: &str = "moveAllDiskBackingsAndDisallowSharing";
pub(super) const LINKED_CLONE_DISK_MOVE_TYPE: &str = "createNewChildDiskBacking";
const MIN_CPUS: i32 = 2;
const DEFAULT_MEMORY_MIB: i64 = 2048;

/// Everything needed to submit the clone
#[derive(Debug, Clone)]
pub(super) struct ClonePlan {
    pub template: ManagedObjectReference,
    pub folder: ManagedObjectReference,
    pub spec: VirtualMachineCloneSpec,
    /// Mode actually used
    pub mode: CloneMode,
}

/// Where the new VM goes
#[derive(Debug, Clone, PartialEq)]
pub(super) struct Placement {
    pub datastore: ManagedObjectReference,
    pub folder: ManagedObjectReference,
    pub pool: ManagedObjectReference,
    /// Host of the template, if it reports one
    pub host: Option<ManagedObjectReference>,
}

pub(super) async fn build_clone(
    session: &Session,
    req: &MachineRequest,
    spec: &VSphereMachineSpec,
    bootstrap: &[u8],
) -> Result<ClonePlan, ControllerError> {
    let (template, props) = resolve_template(session, &spec.template).await?;

    let snapshot = linked_clone_snapshot(req, spec, &props);
    let (mode, disk_move_type) = match snapshot {
        Some(_) => (CloneMode::LinkedClone, LINKED_CLONE_DISK_MOVE_TYPE),
        None => (CloneMode::FullClone, DISK_MOVE_TYPE),
    };

    // A linked clone shares the template's disks and cannot grow them.
    let mut device_change = match snapshot {
        None => disk_edits(&props, &spec.disks)?,
        Some(_) => {
            if !spec.disks.is_empty() {
                warn!("Ignoring disk sizes of {}: linked clones keep the template disks", req.key);
            }
            Vec::new()
        }
    };
    device_change.extend(nic_changes(session, &props, &spec.network.devices).await?);
    let placement = resolve_placement(session, spec, &props).await?;

    let config = VirtualMachineConfigSpec {
        annotation: Some(req.key.clone()),
        instance_uuid: Some(req.uid.clone()),
        num_cpus: Some(spec.num_cpus.max(MIN_CPUS)),
        memory_mb: Some(memory_mib(spec.memory_mib)),
        flags: Some(VirtualMachineFlagInfo {
            disk_uuid_enabled: Some(true),
        }),
        device_change,
        extra_config: vmx_config(req, &spec.custom_vmx_keys, bootstrap),
        ..Default::default()
    };

    debug!(
        "Clone plan for {}: template {}, datastore {}, pool {}, {:?}",
        req.key, template.value, placement.datastore.value, placement.pool.value, mode
    );
    Ok(ClonePlan {
        template,
        folder: placement.folder.clone(),
        spec: VirtualMachineCloneSpec {
            location: VirtualMachineRelocateSpec {
                disk: disk_locators(&props, &placement.datastore, snapshot.is_some()),
                datastore: Some(placement.datastore),
                folder: Some(placement.folder),
                pool: Some(placement.pool),
                host: None,
                disk_move_type: Some(disk_move_type.to_string()),
            },
            template: false,
            power_on: false,
            snapshot,
            config: Some(config),
        },
        mode,
    })
}

/// Snapshot to link against, or `None` for a full clone
fn linked_clone_snapshot(
    req: &MachineRequest,
    spec: &VSphereMachineSpec,
    template: &VirtualMachineProperties,
) -> Option<ManagedObjectReference> {
    if spec.clone_mode != CloneMode::LinkedClone {
        return None;
    }
    let snapshots = template.snapshot.as_ref();
    let found = match spec.snapshot.as_deref().filter(|name| !name.is_empty()) {
        Some(name) => snapshots.and_then(|s| s.find(name)),
        None => snapshots.and_then(|s| s.current_snapshot.as_ref()),
    };
    match found {
        Some(snapshot) => info!("Linked clone of {} from snapshot {}", req.key, snapshot.value),
        None => warn!(
            "Template {} has no snapshot {:?} for {}, making a full clone",
            template.name,
            spec.snapshot.as_deref().unwrap_or("<current>"),
            req.key
        ),
    }
    found.cloned()
}

/// One locator per template disk, all on the target datastore
pub(super) fn disk_locators(
    template: &VirtualMachineProperties,
    datastore: &ManagedObjectReference,
    linked: bool,
) -> Vec<VirtualMachineRelocateSpecDiskLocator> {
    let move_type = if linked {
        LINKED_CLONE_DISK_MOVE_TYPE
    } else {
        FULL_CLONE_DISK_MOVE_TYPE
    };
    template
        .disks()
        .map(|disk| VirtualMachineRelocateSpecDiskLocator {
            disk_id: disk.key,
            datastore: datastore.clone(),
            disk_move_type: Some(move_type.to_string()),
            disk_backing_info: Some(disk.backing.clone()),
        })
        .collect()
}

/// Template by instance UUID when the string is UUID-shaped, else by name
pub(super) async fn resolve_template(
    session: &Session,
    template: &str,
) -> Result<(ManagedObjectReference, VirtualMachineProperties), ControllerError> {
    let finder = session.finder();

    let mut found = None;
    if uuid::Uuid::parse_str(template).is_ok() {
        found = match finder.vm_by_instance_uuid(template).await {
            Ok(found) => found,
            Err(VSphereError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
    }
    if found.is_none() {
        found = finder.vm_by_name(template).await?;
    }

    let template_ref = found
        .ok_or_else(|| VSphereError::NotFound(format!("template {} not found", template)))?;
    let props = session.client().vm_properties(&template_ref).await?;
    Ok((template_ref, props))
}

/// Edits growing the template disks named in `disks`
///
/// Disks not named are left alone. Shrinking a disk, or naming only labels
/// the template does not have, is a validation error.
pub(super) fn disk_edits(
    template: &VirtualMachineProperties,
    disks: &[DiskSpec],
) -> Result<Vec<VirtualDeviceConfigSpec>, ControllerError> {
    if disks.is_empty() {
        return Ok(Vec::new());
    }

    let mut edits = Vec::new();
    let mut matched = 0;
    for disk in template.disks() {
        let Some(requested) = disks.iter().find(|d| d.label == disk.label()) else {
            continue;
        };
        matched += 1;

        let capacity = requested
            .size_gib
            .checked_mul(GIB)
            .filter(|bytes| *bytes > 0)
            .ok_or_else(|| {
                ControllerError::Validation(format!(
                    "invalid size {}GiB for disk {:?}",
                    requested.size_gib, requested.label
                ))
            })?;
        if capacity < disk.capacity_in_bytes {
            return Err(ControllerError::Validation(format!(
                "can't resize template disk {:?} down: requested {}GiB, template disk is {}GiB",
                requested.label,
                requested.size_gib,
                disk.capacity_in_bytes / GIB
            )));
        }
        if capacity == disk.capacity_in_bytes {
            continue;
        }

        let mut grown = disk.clone();
        grown.capacity_in_bytes = capacity;
        edits.push(VirtualDeviceConfigSpec::edit(VirtualDevice::VirtualDisk(grown)));
    }

    if matched == 0 {
        let labels: Vec<&str> = template.disks().map(|d| d.label()).collect();
        return Err(ControllerError::Validation(format!(
            "none of the requested disks {:?} match a template disk (template has {:?})",
            disks.iter().map(|d| d.label.as_str()).collect::<Vec<_>>(),
            labels
        )));
    }
    Ok(edits)
}

/// Remove every template NIC and add one per configured device
pub(super) async fn nic_changes(
    session: &Session,
    template: &VirtualMachineProperties,
    devices: &[NetworkDeviceSpec],
) -> Result<Vec<VirtualDeviceConfigSpec>, ControllerError> {
    let mut changes: Vec<VirtualDeviceConfigSpec> = template
        .devices
        .iter()
        .filter(|device| device.as_ethernet_card().is_some())
        .cloned()
        .map(VirtualDeviceConfigSpec::remove)
        .collect();
    changes.extend(nic_additions(session, devices).await?);
    Ok(changes)
}

pub(super) async fn nic_additions(
    session: &Session,
    devices: &[NetworkDeviceSpec],
) -> Result<Vec<VirtualDeviceConfigSpec>, ControllerError> {
    let mut additions = Vec::with_capacity(devices.len());
    for (index, device) in devices.iter().enumerate() {
        let network = session.finder().network(&device.network_name).await?;
        additions.push(VirtualDeviceConfigSpec::add(new_nic(index, device, network)));
    }
    Ok(additions)
}

fn new_nic(index: usize, device: &NetworkDeviceSpec, network: ManagedObjectReference) -> VirtualDevice {
    let (address_type, mac_address) = match device.mac_addr.as_deref().filter(|mac| !mac.is_empty()) {
        Some(mac) => ("Manual", Some(mac.to_string())),
        None => ("Generated", None),
    };
    VirtualDevice::VirtualVmxnet3(VirtualEthernetCard {
        key: FIRST_NIC_KEY - index as i32,
        device_info: Some(Description::new(format!("Network adapter {}", index + 1))),
        backing: Some(NetworkBacking::new(device.network_name.as_str(), network)),
        address_type: Some(address_type.to_string()),
        mac_address,
    })
}

/// Datastore, folder and pool for the new VM
///
/// Without a configured pool the VM lands in the root pool of the template's
/// host. A configured pool that does not exist is created there.
pub(super) async fn resolve_placement(
    session: &Session,
    spec: &VSphereMachineSpec,
    template: &VirtualMachineProperties,
) -> Result<Placement, ControllerError> {
    let finder = session.finder();
    let client = session.client();

    let datastore = finder.datastore_or_default(spec.datastore.as_deref()).await?;
    let folder = finder.folder_or_default(spec.folder.as_deref()).await?;

    let host = match &template.host {
        Some(host) => Some(client.host_properties(host).await?),
        None => None,
    };
    let root_pool = match &host {
        Some(host) => host.resource_pool.clone(),
        None => finder.resource_pool_or_default(None).await?,
    };

    let pool = match spec.resource_pool.as_deref() {
        None => root_pool,
        Some(name) => {
            let compute = host.as_ref().map(|h| h.compute_resource_name.as_str());
            match finder.resource_pool(name, compute).await? {
                Some(pool) => pool,
                None => {
                    let leaf = name.rsplit('/').next().unwrap_or(name);
                    info!("Creating resource pool {} under {}", leaf, root_pool.value);
                    client
                        .create_resource_pool(&root_pool, leaf, &ResourceConfigSpec::default())
                        .await?
                }
            }
        }
    };

    Ok(Placement {
        datastore,
        folder,
        pool,
        host: template.host.clone(),
    })
}

/// Bootstrap user data followed by the custom VMX keys
///
/// Custom keys may not override the cloud-init `guestinfo` entries the
/// controller owns; those are skipped.
pub(super) fn vmx_config(
    req: &MachineRequest,
    custom: &BTreeMap<String, String>,
    bootstrap: &[u8],
) -> Vec<OptionValue> {
    let mut config = userdata_config(bootstrap);
    for (key, value) in custom {
        if key.starts_with(GUESTINFO_USERDATA) || key.starts_with(GUESTINFO_METADATA) {
            warn!("Ignoring custom VMX key {} of {}: reserved for cloud-init", key, req.key);
            continue;
        }
        config.push(OptionValue::new(key.as_str(), value.as_str()));
    }
    config
}

pub(super) fn userdata_config(bootstrap: &[u8]) -> Vec<OptionValue> {
    vec![
        OptionValue::new(GUESTINFO_USERDATA, BASE64.encode(bootstrap)),
        OptionValue::new(GUESTINFO_USERDATA_ENCODING, BASE64_ENCODING),
    ]
}

fn memory_mib(requested: i64) -> i64 {
    if requested <= 0 {
        DEFAULT_MEMORY_MIB
    } else {
        requested
    }
}
