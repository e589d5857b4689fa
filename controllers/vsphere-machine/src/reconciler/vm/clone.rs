//! Create path for standalone hosts
//!
//! A standalone ESXi host has no server-side clone. The template's disks are
//! copied with `vmkfstools` over a remote shell, grown where requested, and a
//! new VM is created around the copies. The VM inherits the template's guest
//! OS, firmware and boot options.

use super::builder;
use super::metadata::{self, render_metadata};
use super::MachineRequest;
use crate::error::ControllerError;
use crate::remote_shell::{RemoteShell, RemoteShellError, RemoteShellFactory, ShellParams};
use crate::session::Session;
use crds::VSphereMachineSpec;
use tracing::{debug, info};
use vsphere_client::{
    Description, DiskBacking, ManagedObjectReference, VirtualController,
    VirtualDevice, VirtualDeviceConfigSpec, VirtualDisk, VirtualMachineConfigSpec,
    VirtualMachineFileInfo, VirtualMachineFlagInfo, VirtualMachineProperties, VirtualSerialPort, GIB,
};

pub(super) const SCSI_CONTROLLER_KEY: i32 = -200;
const FIRST_DISK_KEY: i32 = -201;
pub(super) const SIO_CONTROLLER_KEY: i32 = -301;
pub(super) const SERIAL_PORT_KEY: i32 = -302;
/// Unit 7 on a SCSI bus belongs to the controller
const SCSI_RESERVED_UNIT: i32 = 7;

/// A template disk and the datastore path of its copy
#[derive(Debug, Clone)]
struct CopiedDisk {
    template: VirtualDisk,
    file_name: String,
    capacity_in_bytes: i64,
}

/// Copy the template disks and submit the create task
pub(super) async fn create_from_template(
    session: &Session,
    shells: &dyn RemoteShellFactory,
    params: &ShellParams,
    req: &MachineRequest,
    spec: &VSphereMachineSpec,
    bootstrap: &[u8],
) -> Result<ManagedObjectReference, ControllerError> {
    let metadata = render_metadata(&req.name, spec, false)?;
    let (_, template) = builder::resolve_template(session, &spec.template).await?;
    // Same resize rules as the clone path; the grown sizes apply to the copies.
    let resized = builder::disk_edits(&template, &spec.disks)?;
    let placement = builder::resolve_placement(session, spec, &template).await?;

    let client = session.client();
    let datastore_name = client.object_name(&placement.datastore).await?;

    let copy = CopyJob {
        name: &req.name,
        template: &template,
        resized: &resized,
        datastore: &placement.datastore,
        datastore_name: &datastore_name,
    };
    let shell = shells.connect(params).await?;
    let copied = copy.run(shell.as_ref()).await;
    shell.close().await;
    let copied = copied?;

    let mut device_change = vec![scsi_controller()];
    for (index, disk) in copied.iter().enumerate() {
        device_change.push(attach_disk(index, disk, &placement.datastore));
    }
    device_change.extend(builder::nic_additions(session, &spec.network.devices).await?);
    device_change.extend(serial_console());

    let mut extra_config = builder::vmx_config(req, &spec.custom_vmx_keys, bootstrap);
    extra_config.extend(metadata::metadata_config(&metadata));

    let config = VirtualMachineConfigSpec {
        name: Some(req.name.clone()),
        annotation: Some(req.key.clone()),
        instance_uuid: Some(req.uid.clone()),
        guest_id: template.guest_id.clone(),
        firmware: template.firmware.clone(),
        boot_options: template.boot_options.clone(),
        num_cpus: (spec.num_cpus > 0).then_some(spec.num_cpus),
        memory_mb: (spec.memory_mib > 0).then_some(spec.memory_mib),
        flags: Some(VirtualMachineFlagInfo {
            disk_uuid_enabled: Some(true),
        }),
        files: Some(VirtualMachineFileInfo {
            vm_path_name: format!("[{}]", datastore_name),
        }),
        device_change,
        extra_config,
        ..Default::default()
    };

    info!(
        "Creating VM {} for {} on datastore {} from {} copied disk(s)",
        req.name,
        req.key,
        datastore_name,
        copied.len()
    );
    let task = client
        .create_vm(&placement.folder, &config, &placement.pool, placement.host.as_ref())
        .await?;
    Ok(task)
}

struct CopyJob<'a> {
    name: &'a str,
    template: &'a VirtualMachineProperties,
    /// Disk edits carrying the grown capacities
    resized: &'a [VirtualDeviceConfigSpec],
    datastore: &'a ManagedObjectReference,
    datastore_name: &'a str,
}

impl CopyJob<'_> {
    async fn run(&self, shell: &dyn RemoteShell) -> Result<Vec<CopiedDisk>, ControllerError> {
        let dir = format!("/vmfs/volumes/{}/{}", self.datastore.value, self.name);
        run(shell, &format!("mkdir -p {}", dir), false).await?;

        let mut copied = Vec::new();
        for (index, disk) in self.template.disks().enumerate() {
            let source_datastore = disk.backing.datastore.as_ref().ok_or_else(|| {
                ControllerError::Validation(format!("template disk {:?} has no datastore", disk.label()))
            })?;
            let source_path = disk.backing.relative_path().ok_or_else(|| {
                ControllerError::Validation(format!(
                    "template disk {:?} has an unexpected backing file {:?}",
                    disk.label(),
                    disk.backing.file_name
                ))
            })?;

            let file = if index == 0 {
                format!("{}.vmdk", self.name)
            } else {
                format!("{}_{}.vmdk", self.name, index)
            };
            let destination = format!("{}/{}", dir, file);
            let command = format!(
                "vmkfstools -i \"/vmfs/volumes/{}/{}\" \"{}\" -d thin",
                source_datastore.value, source_path, destination
            );
            let fresh = run(shell, &command, true).await?;

            let capacity_in_bytes = self.grown_capacity(disk).unwrap_or(disk.capacity_in_bytes);
            if capacity_in_bytes > disk.capacity_in_bytes {
                if fresh {
                    let command = format!("vmkfstools -X {}G \"{}\"", capacity_in_bytes / GIB, destination);
                    run(shell, &command, false).await?;
                } else {
                    debug!("Skipping grow of resumed copy {}", destination);
                }
            }

            copied.push(CopiedDisk {
                template: disk.clone(),
                file_name: format!("[{}] {}/{}", self.datastore_name, self.name, file),
                capacity_in_bytes,
            });
        }
        Ok(copied)
    }

    fn grown_capacity(&self, disk: &VirtualDisk) -> Option<i64> {
        self.resized
            .iter()
            .filter_map(|edit| edit.device.as_disk())
            .find(|grown| grown.key == disk.key)
            .map(|grown| grown.capacity_in_bytes)
    }
}

/// Run `command`; `Ok(false)` when a `resumable` command found its
/// destination already in place
async fn run(shell: &dyn RemoteShell, command: &str, resumable: bool) -> Result<bool, ControllerError> {
    debug!("Running {}", command);
    let output = shell.exec(command).await?;
    if output.success() {
        return Ok(true);
    }
    if resumable && output.stderr.contains("already exists") {
        info!("Destination of {:?} already exists, resuming", command);
        return Ok(false);
    }
    Err(RemoteShellError::Command {
        command: command.to_string(),
        message: format!("exit status {}: {}", output.exit_status, output.stderr.trim()),
    }
    .into())
}

fn scsi_controller() -> VirtualDeviceConfigSpec {
    VirtualDeviceConfigSpec::add(VirtualDevice::ParaVirtualScsiController(VirtualController {
        key: SCSI_CONTROLLER_KEY,
        device_info: Some(Description::new("SCSI controller 0")),
        bus_number: Some(0),
        shared_bus: Some("noSharing".to_string()),
    }))
}

fn attach_disk(index: usize, disk: &CopiedDisk, datastore: &ManagedObjectReference) -> VirtualDeviceConfigSpec {
    let mut unit = index as i32;
    if unit >= SCSI_RESERVED_UNIT {
        unit += 1;
    }
    VirtualDeviceConfigSpec::add(VirtualDevice::VirtualDisk(VirtualDisk {
        key: FIRST_DISK_KEY - index as i32,
        device_info: Some(Description::new(disk.template.label())),
        controller_key: Some(SCSI_CONTROLLER_KEY),
        unit_number: Some(unit),
        capacity_in_bytes: disk.capacity_in_bytes,
        backing: DiskBacking::thin(disk.file_name.as_str(), datastore.clone()),
    }))
}

fn serial_console() -> [VirtualDeviceConfigSpec; 2] {
    [
        VirtualDeviceConfigSpec::add(VirtualDevice::SioController(VirtualController {
            key: SIO_CONTROLLER_KEY,
            device_info: Some(Description::new("SIO controller 0")),
            ..Default::default()
        })),
        VirtualDeviceConfigSpec::add(VirtualDevice::VirtualSerialPort(VirtualSerialPort {
            key: SERIAL_PORT_KEY,
            device_info: Some(Description::new("Serial port 1")),
            controller_key: Some(SIO_CONTROLLER_KEY),
            yield_on_poll: Some(true),
        })),
    ]
}
