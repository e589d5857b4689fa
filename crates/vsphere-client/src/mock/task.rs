//! Task bookkeeping for MockVSphereClient
//!
//! Tasks are created `Queued`. Tests decide when they finish.

use super::{lock, MockTask, MockVSphereClient, TaskEffect};
use crate::error::VSphereError;
use crate::models::*;

/// Keys handed to devices added through a config spec
const FIRST_ADDED_DEVICE_KEY: i32 = 4000;

impl MockVSphereClient {
    pub(crate) fn submit_task(&self, description_id: &str, effect: TaskEffect) -> ManagedObjectReference {
        let task = ManagedObjectReference::task(format!("task-{}", self.next_id()));
        lock(&self.tasks).insert(
            task.value.clone(),
            MockTask {
                info: TaskInfo {
                    key: task.value.clone(),
                    state: TaskState::Queued,
                    result: None,
                    error: None,
                    description_id: Some(description_id.to_string()),
                },
                effect: Some(effect),
            },
        );
        task
    }

    /// Register an arbitrary task with no side effect
    pub fn add_task(&self, info: TaskInfo) -> ManagedObjectReference {
        let task = ManagedObjectReference::task(info.key.clone());
        lock(&self.tasks).insert(task.value.clone(), MockTask { info, effect: None });
        task
    }

    /// Most recently submitted task
    pub fn last_task(&self) -> Option<ManagedObjectReference> {
        lock(&self.tasks)
            .keys()
            .filter_map(|key| {
                key.strip_prefix("task-")
                    .and_then(|n| n.parse::<u64>().ok())
                    .map(|n| (n, key.clone()))
            })
            .max()
            .map(|(_, key)| ManagedObjectReference::task(key))
    }

    /// Finish a task successfully and apply its effect
    ///
    /// Returns the task result (the new VM for clone and create).
    pub fn complete_task(&self, task: &ManagedObjectReference) -> Option<ManagedObjectReference> {
        let effect = {
            let mut tasks = lock(&self.tasks);
            let entry = tasks.get_mut(&task.value)?;
            entry.info.state = TaskState::Success;
            entry.effect.take()
        };

        let result = effect.and_then(|effect| self.apply(effect));
        if let Some(entry) = lock(&self.tasks).get_mut(&task.value) {
            entry.info.result = result.clone();
        }
        result
    }

    /// Finish a task with a fault; its effect is discarded
    pub fn fail_task(&self, task: &ManagedObjectReference, message: &str) {
        if let Some(entry) = lock(&self.tasks).get_mut(&task.value) {
            entry.info.state = TaskState::Error;
            entry.info.error = Some(LocalizedMethodFault {
                localized_message: Some(message.to_string()),
            });
            entry.effect = None;
        }
    }

    /// Move a task to an arbitrary state without applying its effect
    pub fn set_task_state(&self, task: &ManagedObjectReference, state: TaskState) {
        if let Some(entry) = lock(&self.tasks).get_mut(&task.value) {
            entry.info.state = state;
        }
    }

    /// Drop a task, as the server does once it ages out
    pub fn forget_task(&self, task: &ManagedObjectReference) {
        lock(&self.tasks).remove(&task.value);
    }

    fn apply(&self, effect: TaskEffect) -> Option<ManagedObjectReference> {
        match effect {
            TaskEffect::Clone {
                source,
                folder,
                name,
                spec,
            } => {
                let mut props = self.vm(&source)?;
                props.name = name.clone();
                props.guest_net.clear();
                props.snapshot = None;
                props.power_state = Some(if spec.power_on {
                    VirtualMachinePowerState::PoweredOn
                } else {
                    VirtualMachinePowerState::PoweredOff
                });
                if let Some(pool) = spec.location.pool.clone() {
                    props.resource_pool = Some(pool);
                }
                if let Some(host) = spec.location.host.clone() {
                    props.host = Some(host);
                }
                props.instance_uuid = None;
                if let Some(config) = &spec.config {
                    self.apply_config(&mut props, config);
                }
                Some(self.materialise(&folder, &name, props))
            }
            TaskEffect::Create {
                folder,
                spec,
                host,
                pool,
            } => {
                let name = spec.name.clone().unwrap_or_default();
                let mut props = VirtualMachineProperties {
                    name: name.clone(),
                    power_state: Some(VirtualMachinePowerState::PoweredOff),
                    host,
                    resource_pool: Some(pool),
                    ..Default::default()
                };
                self.apply_config(&mut props, &spec);
                Some(self.materialise(&folder, &name, props))
            }
            TaskEffect::Reconfigure { vm, spec } => {
                if let Some(props) = lock(&self.vms).get_mut(&vm.value) {
                    self.apply_config(props, &spec);
                }
                None
            }
            TaskEffect::PowerOn(vm) => {
                self.set_power_state(&vm, VirtualMachinePowerState::PoweredOn);
                None
            }
            TaskEffect::PowerOff(vm) => {
                self.set_power_state(&vm, VirtualMachinePowerState::PoweredOff);
                None
            }
            TaskEffect::Destroy(vm) => {
                lock(&self.vms).remove(&vm.value);
                lock(&self.inventory).retain(|_, obj| *obj != vm);
                lock(&self.names).remove(&vm);
                None
            }
        }
    }

    fn materialise(
        &self,
        folder: &ManagedObjectReference,
        name: &str,
        mut props: VirtualMachineProperties,
    ) -> ManagedObjectReference {
        let id = self.next_id();
        let vm = ManagedObjectReference::virtual_machine(format!("vm-{}", id));
        props.uuid = Some(format!("4200{:04x}-0000-0000-0000-{:012x}", id, id));
        if props.instance_uuid.is_none() {
            props.instance_uuid = Some(format!("5000{:04x}-0000-0000-0000-{:012x}", id, id));
        }
        if let Some(folder_path) = self.path_of(folder) {
            self.register(format!("{}/{}", folder_path, name), vm.clone(), name);
        }
        lock(&self.vms).insert(vm.value.clone(), props);
        vm
    }

    fn apply_config(&self, props: &mut VirtualMachineProperties, config: &VirtualMachineConfigSpec) {
        if let Some(name) = &config.name {
            props.name = name.clone();
        }
        if let Some(uuid) = &config.instance_uuid {
            props.instance_uuid = Some(uuid.clone());
        }
        if let Some(cpus) = config.num_cpus {
            props.num_cpu = cpus;
        }
        if let Some(memory) = config.memory_mb {
            props.memory_mb = memory;
        }
        if config.guest_id.is_some() {
            props.guest_id = config.guest_id.clone();
        }
        if config.firmware.is_some() {
            props.firmware = config.firmware.clone();
        }
        if config.boot_options.is_some() {
            props.boot_options = config.boot_options.clone();
        }

        for change in &config.device_change {
            let key = change.device.key();
            match change.operation {
                DeviceOperation::Remove => {
                    props.devices.retain(|device| device.key() != key);
                }
                DeviceOperation::Edit => {
                    if let Some(device) = props.devices.iter_mut().find(|device| device.key() == key) {
                        *device = change.device.clone();
                    }
                }
                DeviceOperation::Add => {
                    let device = self.added_device(props, change.device.clone());
                    props.devices.push(device);
                }
            }
        }

        for option in &config.extra_config {
            match props.extra_config.iter_mut().find(|o| o.key == option.key) {
                Some(existing) => existing.value = option.value.clone(),
                None => props.extra_config.push(option.clone()),
            }
        }
    }

    /// Assign a real key (and a generated MAC for automatic NICs)
    fn added_device(&self, props: &VirtualMachineProperties, mut device: VirtualDevice) -> VirtualDevice {
        let key = props
            .devices
            .iter()
            .filter_map(VirtualDevice::key)
            .filter(|key| *key >= FIRST_ADDED_DEVICE_KEY)
            .max()
            .map_or(FIRST_ADDED_DEVICE_KEY, |key| key + 1);
        let id = self.next_id();

        match &mut device {
            VirtualDevice::VirtualDisk(disk) => disk.key = key,
            VirtualDevice::VirtualVmxnet3(nic)
            | VirtualDevice::VirtualVmxnet2(nic)
            | VirtualDevice::VirtualE1000(nic)
            | VirtualDevice::VirtualE1000e(nic) => {
                nic.key = key;
                if nic.mac_address.as_deref().is_none_or(str::is_empty) {
                    nic.mac_address = Some(format!(
                        "00:50:56:{:02x}:{:02x}:{:02x}",
                        (id >> 16) & 0xff,
                        (id >> 8) & 0xff,
                        id & 0xff
                    ));
                    nic.address_type = Some("Assigned".to_string());
                }
            }
            VirtualDevice::ParaVirtualScsiController(c)
            | VirtualDevice::LsiLogicController(c)
            | VirtualDevice::SioController(c) => c.key = key,
            VirtualDevice::VirtualSerialPort(port) => port.key = key,
            VirtualDevice::Other => {}
        }
        device
    }
}

pub fn task_info(
    client: &MockVSphereClient,
    task: &ManagedObjectReference,
) -> Result<Option<TaskInfo>, VSphereError> {
    client.take_failure("task_info")?;
    Ok(lock(&client.tasks).get(&task.value).map(|entry| entry.info.clone()))
}
