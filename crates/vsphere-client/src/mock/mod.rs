//! Mock vSphere client for unit testing
//!
//! This module provides an in-memory implementation of `VSphereClientTrait`.
//! Submitted operations create tasks that stay `Queued` until the test drives
//! them with `complete_task`, `fail_task` or `set_task_state`; completing a
//! task applies its effect (a clone materialises a VM, a power-off flips the
//! power state, and so on).

mod connector;
mod inventory;
mod task;
mod vm;

pub use connector::MockConnector;

use crate::error::VSphereError;
use crate::models::*;
use crate::vsphere_trait::VSphereClientTrait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Operation recorded by the mock, in submission order
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Clone {
        source: ManagedObjectReference,
        folder: ManagedObjectReference,
        name: String,
        spec: VirtualMachineCloneSpec,
    },
    Create {
        folder: ManagedObjectReference,
        spec: VirtualMachineConfigSpec,
        pool: ManagedObjectReference,
        host: Option<ManagedObjectReference>,
    },
    Reconfigure {
        vm: ManagedObjectReference,
        spec: VirtualMachineConfigSpec,
    },
    PowerOn(ManagedObjectReference),
    PowerOff(ManagedObjectReference),
    Destroy(ManagedObjectReference),
    CreateResourcePool {
        parent: ManagedObjectReference,
        name: String,
    },
    Logout,
}

/// Side effect applied when a mock task completes
#[derive(Debug, Clone)]
pub(crate) enum TaskEffect {
    Clone {
        source: ManagedObjectReference,
        folder: ManagedObjectReference,
        name: String,
        spec: VirtualMachineCloneSpec,
    },
    Create {
        folder: ManagedObjectReference,
        spec: VirtualMachineConfigSpec,
        host: Option<ManagedObjectReference>,
        pool: ManagedObjectReference,
    },
    Reconfigure {
        vm: ManagedObjectReference,
        spec: VirtualMachineConfigSpec,
    },
    PowerOn(ManagedObjectReference),
    PowerOff(ManagedObjectReference),
    Destroy(ManagedObjectReference),
}

#[derive(Debug, Clone)]
pub(crate) struct MockTask {
    pub(crate) info: TaskInfo,
    pub(crate) effect: Option<TaskEffect>,
}

/// Mock vSphere client for testing
///
/// Clones share the same inventory; `reconnected` gives a handle with its own
/// session liveness flag, which is how `MockConnector` hands out sessions.
#[derive(Clone)]
pub struct MockVSphereClient {
    server: String,
    active: Arc<AtomicBool>,
    pub(crate) about: Arc<Mutex<AboutInfo>>,
    pub(crate) inventory: Arc<Mutex<HashMap<String, ManagedObjectReference>>>,
    pub(crate) children: Arc<Mutex<HashMap<String, Vec<ManagedObjectReference>>>>,
    pub(crate) names: Arc<Mutex<HashMap<ManagedObjectReference, String>>>,
    pub(crate) datacenters: Arc<Mutex<HashMap<String, DatacenterInfo>>>,
    pub(crate) compute_pools: Arc<Mutex<HashMap<String, ManagedObjectReference>>>,
    pub(crate) vms: Arc<Mutex<HashMap<String, VirtualMachineProperties>>>,
    pub(crate) hosts: Arc<Mutex<HashMap<String, HostProperties>>>,
    pub(crate) tasks: Arc<Mutex<HashMap<String, MockTask>>>,
    pub(crate) calls: Arc<Mutex<Vec<MockCall>>>,
    pub(crate) failures: Arc<Mutex<HashMap<String, MockFault>>>,
    next_id: Arc<Mutex<u64>>,
}

/// Error injected into the next call of an operation
#[derive(Debug, Clone)]
pub(crate) enum MockFault {
    Api(String),
    Unreachable(String),
    NotAuthenticated(String),
}

impl From<MockFault> for VSphereError {
    fn from(fault: MockFault) -> Self {
        match fault {
            MockFault::Api(message) => VSphereError::Api(message),
            MockFault::Unreachable(message) => VSphereError::EndpointUnreachable(message),
            MockFault::NotAuthenticated(message) => VSphereError::Authentication(message),
        }
    }
}

impl std::fmt::Debug for MockVSphereClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockVSphereClient")
            .field("server", &self.server)
            .field("active", &self.active.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Lock a mock table, ignoring poisoning from a panicked test thread
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockVSphereClient {
    /// Create an empty vCenter-flavoured mock
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            active: Arc::new(AtomicBool::new(true)),
            about: Arc::new(Mutex::new(AboutInfo {
                name: "VMware vCenter Server".to_string(),
                full_name: "VMware vCenter Server 8.0.1".to_string(),
                api_type: "VirtualCenter".to_string(),
                api_version: "8.0.1.0".to_string(),
            })),
            inventory: Arc::new(Mutex::new(HashMap::new())),
            children: Arc::new(Mutex::new(HashMap::new())),
            names: Arc::new(Mutex::new(HashMap::new())),
            datacenters: Arc::new(Mutex::new(HashMap::new())),
            compute_pools: Arc::new(Mutex::new(HashMap::new())),
            vms: Arc::new(Mutex::new(HashMap::new())),
            hosts: Arc::new(Mutex::new(HashMap::new())),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(Mutex::new(1)),
        }
    }

    /// Handle sharing this inventory with a fresh, live session
    pub fn reconnected(&self) -> Self {
        Self {
            active: Arc::new(AtomicBool::new(true)),
            ..self.clone()
        }
    }

    /// Mark this session dead (or alive again)
    pub fn set_session_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Pretend to be a standalone ESXi host
    pub fn set_standalone_host(&self) {
        let mut about = lock(&self.about);
        about.name = "VMware ESXi".to_string();
        about.full_name = "VMware ESXi 8.0.1".to_string();
        about.api_type = "HostAgent".to_string();
    }

    /// Make the next call of `op` (e.g. "clone_vm") fail with an API error
    pub fn fail_next(&self, op: &str, message: impl Into<String>) {
        lock(&self.failures).insert(op.to_string(), MockFault::Api(message.into()));
    }

    /// Make the next call of `op` fail as if the endpoint dropped off the network
    pub fn disconnect_next(&self, op: &str) {
        lock(&self.failures).insert(
            op.to_string(),
            MockFault::Unreachable(format!("connection to {} reset", self.server)),
        );
    }

    /// Make the next call of `op` fail with a `NotAuthenticated` fault
    pub fn expire_next(&self, op: &str) {
        lock(&self.failures).insert(
            op.to_string(),
            MockFault::NotAuthenticated("The session is not authenticated.".to_string()),
        );
    }

    /// All operations submitted so far
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    pub(crate) fn next_id(&self) -> u64 {
        let mut id = lock(&self.next_id);
        let current = *id;
        *id += 1;
        current
    }

    pub(crate) fn take_failure(&self, op: &str) -> Result<(), VSphereError> {
        match lock(&self.failures).remove(op) {
            Some(fault) => Err(fault.into()),
            None => Ok(()),
        }
    }

    pub(crate) fn record(&self, call: MockCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait::async_trait]
impl VSphereClientTrait for MockVSphereClient {
    fn server(&self) -> &str {
        &self.server
    }

    async fn session_is_active(&self) -> Result<bool, VSphereError> {
        self.take_failure("session_is_active")?;
        Ok(self.active.load(Ordering::SeqCst))
    }

    async fn logout(&self) -> Result<(), VSphereError> {
        self.active.store(false, Ordering::SeqCst);
        self.record(MockCall::Logout);
        Ok(())
    }

    async fn about(&self) -> Result<AboutInfo, VSphereError> {
        Ok(lock(&self.about).clone())
    }

    async fn find_by_inventory_path(
        &self,
        path: &str,
    ) -> Result<Option<ManagedObjectReference>, VSphereError> {
        inventory::find_by_inventory_path(self, path)
    }

    async fn find_by_instance_uuid(
        &self,
        datacenter: &ManagedObjectReference,
        uuid: &str,
    ) -> Result<Option<ManagedObjectReference>, VSphereError> {
        vm::find_by_instance_uuid(self, datacenter, uuid)
    }

    async fn child_entities(
        &self,
        folder: Option<&ManagedObjectReference>,
    ) -> Result<Vec<ManagedObjectReference>, VSphereError> {
        inventory::child_entities(self, folder)
    }

    async fn datacenter_info(
        &self,
        datacenter: &ManagedObjectReference,
    ) -> Result<DatacenterInfo, VSphereError> {
        inventory::datacenter_info(self, datacenter)
    }

    async fn object_name(&self, obj: &ManagedObjectReference) -> Result<String, VSphereError> {
        inventory::object_name(self, obj)
    }

    async fn compute_resource_pool(
        &self,
        compute_resource: &ManagedObjectReference,
    ) -> Result<ManagedObjectReference, VSphereError> {
        inventory::compute_resource_pool(self, compute_resource)
    }

    async fn vm_properties(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<VirtualMachineProperties, VSphereError> {
        vm::vm_properties(self, vm)
    }

    async fn host_properties(
        &self,
        host: &ManagedObjectReference,
    ) -> Result<HostProperties, VSphereError> {
        inventory::host_properties(self, host)
    }

    async fn task_info(
        &self,
        task: &ManagedObjectReference,
    ) -> Result<Option<TaskInfo>, VSphereError> {
        task::task_info(self, task)
    }

    async fn create_resource_pool(
        &self,
        parent: &ManagedObjectReference,
        name: &str,
        _spec: &ResourceConfigSpec,
    ) -> Result<ManagedObjectReference, VSphereError> {
        inventory::create_resource_pool(self, parent, name)
    }

    async fn clone_vm(
        &self,
        source: &ManagedObjectReference,
        folder: &ManagedObjectReference,
        name: &str,
        spec: &VirtualMachineCloneSpec,
    ) -> Result<ManagedObjectReference, VSphereError> {
        vm::clone_vm(self, source, folder, name, spec)
    }

    async fn create_vm(
        &self,
        folder: &ManagedObjectReference,
        spec: &VirtualMachineConfigSpec,
        pool: &ManagedObjectReference,
        host: Option<&ManagedObjectReference>,
    ) -> Result<ManagedObjectReference, VSphereError> {
        vm::create_vm(self, folder, spec, pool, host)
    }

    async fn reconfigure_vm(
        &self,
        vm: &ManagedObjectReference,
        spec: &VirtualMachineConfigSpec,
    ) -> Result<ManagedObjectReference, VSphereError> {
        vm::reconfigure_vm(self, vm, spec)
    }

    async fn power_on_vm(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<ManagedObjectReference, VSphereError> {
        vm::power_on_vm(self, vm)
    }

    async fn power_off_vm(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<ManagedObjectReference, VSphereError> {
        vm::power_off_vm(self, vm)
    }

    async fn destroy_vm(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<ManagedObjectReference, VSphereError> {
        vm::destroy_vm(self, vm)
    }
}
