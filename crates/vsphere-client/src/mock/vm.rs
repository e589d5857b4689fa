//! Virtual machine operations for MockVSphereClient

use super::{lock, MockCall, MockVSphereClient, TaskEffect};
use crate::error::VSphereError;
use crate::models::*;

impl MockVSphereClient {
    /// Register a VM (or template) at `/<dc>/vm/<name>`
    pub fn add_vm(
        &self,
        datacenter: &str,
        name: &str,
        mut props: VirtualMachineProperties,
    ) -> ManagedObjectReference {
        let vm = ManagedObjectReference::virtual_machine(format!("vm-{}", self.next_id()));
        props.name = name.to_string();
        self.register(format!("/{}/vm/{}", datacenter, name), vm.clone(), name);
        lock(&self.vms).insert(vm.value.clone(), props);
        vm
    }

    /// Current properties of a VM, if it exists
    pub fn vm(&self, vm: &ManagedObjectReference) -> Option<VirtualMachineProperties> {
        lock(&self.vms).get(&vm.value).cloned()
    }

    /// Find a VM by display name
    pub fn vm_by_name(&self, name: &str) -> Option<(ManagedObjectReference, VirtualMachineProperties)> {
        lock(&self.vms)
            .iter()
            .find(|(_, props)| props.name == name)
            .map(|(id, props)| (ManagedObjectReference::virtual_machine(id.clone()), props.clone()))
    }

    pub fn set_power_state(&self, vm: &ManagedObjectReference, state: VirtualMachinePowerState) {
        if let Some(props) = lock(&self.vms).get_mut(&vm.value) {
            props.power_state = Some(state);
        }
    }

    /// Replace the guest NIC list reported by VMware Tools
    pub fn set_guest_net(&self, vm: &ManagedObjectReference, nics: Vec<GuestNicInfo>) {
        if let Some(props) = lock(&self.vms).get_mut(&vm.value) {
            props.guest_net = nics;
        }
    }

    /// Report `ips` on every ethernet card of the VM, in device order
    pub fn report_guest_ips(&self, vm: &ManagedObjectReference, ips: &[&str]) {
        if let Some(props) = lock(&self.vms).get_mut(&vm.value) {
            props.guest_net = props
                .ethernet_cards()
                .map(|nic| GuestNicInfo {
                    mac_address: nic.mac_address.clone().unwrap_or_default(),
                    ip_address: ips.iter().map(|ip| ip.to_string()).collect(),
                    network: nic
                        .backing
                        .as_ref()
                        .map(|b| b.device_name.clone())
                        .unwrap_or_default(),
                    connected: true,
                })
                .collect();
        }
    }

    fn require_vm(&self, vm: &ManagedObjectReference) -> Result<(), VSphereError> {
        if lock(&self.vms).contains_key(&vm.value) {
            Ok(())
        } else {
            Err(VSphereError::NotFound(format!("VirtualMachine {} not found", vm)))
        }
    }
}

pub fn find_by_instance_uuid(
    client: &MockVSphereClient,
    datacenter: &ManagedObjectReference,
    uuid: &str,
) -> Result<Option<ManagedObjectReference>, VSphereError> {
    client.take_failure("find_by_instance_uuid")?;
    if !lock(&client.datacenters).contains_key(&datacenter.value) {
        return Err(VSphereError::NotFound(format!("Datacenter {} not found", datacenter)));
    }
    Ok(lock(&client.vms)
        .iter()
        .find(|(_, props)| {
            props
                .instance_uuid
                .as_deref()
                .is_some_and(|id| id.eq_ignore_ascii_case(uuid))
        })
        .map(|(id, _)| ManagedObjectReference::virtual_machine(id.clone())))
}

pub fn vm_properties(
    client: &MockVSphereClient,
    vm: &ManagedObjectReference,
) -> Result<VirtualMachineProperties, VSphereError> {
    client.take_failure("vm_properties")?;
    client
        .vm(vm)
        .ok_or_else(|| VSphereError::NotFound(format!("VirtualMachine {} not found", vm)))
}

pub fn clone_vm(
    client: &MockVSphereClient,
    source: &ManagedObjectReference,
    folder: &ManagedObjectReference,
    name: &str,
    spec: &VirtualMachineCloneSpec,
) -> Result<ManagedObjectReference, VSphereError> {
    client.take_failure("clone_vm")?;
    client.require_vm(source)?;
    client.record(MockCall::Clone {
        source: source.clone(),
        folder: folder.clone(),
        name: name.to_string(),
        spec: spec.clone(),
    });
    Ok(client.submit_task(
        "VirtualMachine.clone",
        TaskEffect::Clone {
            source: source.clone(),
            folder: folder.clone(),
            name: name.to_string(),
            spec: spec.clone(),
        },
    ))
}

pub fn create_vm(
    client: &MockVSphereClient,
    folder: &ManagedObjectReference,
    spec: &VirtualMachineConfigSpec,
    pool: &ManagedObjectReference,
    host: Option<&ManagedObjectReference>,
) -> Result<ManagedObjectReference, VSphereError> {
    client.take_failure("create_vm")?;
    client.record(MockCall::Create {
        folder: folder.clone(),
        spec: spec.clone(),
        pool: pool.clone(),
        host: host.cloned(),
    });
    Ok(client.submit_task(
        "Folder.createVm",
        TaskEffect::Create {
            folder: folder.clone(),
            spec: spec.clone(),
            host: host.cloned(),
            pool: pool.clone(),
        },
    ))
}

pub fn reconfigure_vm(
    client: &MockVSphereClient,
    vm: &ManagedObjectReference,
    spec: &VirtualMachineConfigSpec,
) -> Result<ManagedObjectReference, VSphereError> {
    client.take_failure("reconfigure_vm")?;
    client.require_vm(vm)?;
    client.record(MockCall::Reconfigure {
        vm: vm.clone(),
        spec: spec.clone(),
    });
    Ok(client.submit_task(
        "VirtualMachine.reconfigure",
        TaskEffect::Reconfigure {
            vm: vm.clone(),
            spec: spec.clone(),
        },
    ))
}

pub fn power_on_vm(
    client: &MockVSphereClient,
    vm: &ManagedObjectReference,
) -> Result<ManagedObjectReference, VSphereError> {
    client.take_failure("power_on_vm")?;
    client.require_vm(vm)?;
    client.record(MockCall::PowerOn(vm.clone()));
    Ok(client.submit_task("VirtualMachine.powerOn", TaskEffect::PowerOn(vm.clone())))
}

pub fn power_off_vm(
    client: &MockVSphereClient,
    vm: &ManagedObjectReference,
) -> Result<ManagedObjectReference, VSphereError> {
    client.take_failure("power_off_vm")?;
    client.require_vm(vm)?;
    client.record(MockCall::PowerOff(vm.clone()));
    Ok(client.submit_task("VirtualMachine.powerOff", TaskEffect::PowerOff(vm.clone())))
}

pub fn destroy_vm(
    client: &MockVSphereClient,
    vm: &ManagedObjectReference,
) -> Result<ManagedObjectReference, VSphereError> {
    client.take_failure("destroy_vm")?;
    client.require_vm(vm)?;
    client.record(MockCall::Destroy(vm.clone()));
    Ok(client.submit_task("VirtualMachine.destroy", TaskEffect::Destroy(vm.clone())))
}
