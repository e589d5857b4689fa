//! Test utilities for unit testing reconcilers
//!
//! In-memory stand-ins for the API server, the event recorder and the remote
//! shell, plus a populated vCenter inventory to reconcile against.

use crate::error::ControllerError;
use crate::events::EventPublisher;
use crate::reconciler::vm::MachineRequest;
use crate::remote_shell::{CommandOutput, RemoteShell, RemoteShellError, RemoteShellFactory, ShellParams};
use crate::session::{Session, SessionCache, SessionParams};
use crate::store::MachineStore;
use async_trait::async_trait;
use crds::*;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::EventType;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use vsphere_client::{
    Description, DiskBacking, ManagedObjectReference, MockConnector, MockVSphereClient,
    NetworkBacking, VirtualController, VirtualDevice, VirtualDisk, VirtualEthernetCard,
    VirtualMachinePowerState, VirtualMachineProperties, GIB,
};

pub const SERVER: &str = "vcenter.lab";
pub const DATACENTER: &str = "dc1";
pub const NAMESPACE: &str = "default";
pub const CLUSTER: &str = "c1";
pub const IPAM_SECRET: &str = "ipam-config";
pub const TEMPLATE: &str = "ubuntu-template";
pub const MACHINE_UID: &str = "6a1f3c9e-2b7d-4e8a-9c51-0d2e4f6a8b10";
pub const TEMPLATE_UUID: &str = "564d8a1e-0c3b-4f2a-8d6e-1b2c3d4e5f60";
pub const USERNAME: &str = "administrator@vsphere.local";
pub const PASSWORD: &str = "secret";

/// vCenter inventory with one datacenter, host, datastore and template
pub struct VCenterFixture {
    pub vcenter: MockVSphereClient,
    pub connector: MockConnector,
    pub datacenter: ManagedObjectReference,
    pub datastore: ManagedObjectReference,
    pub folder: ManagedObjectReference,
    pub network: ManagedObjectReference,
    pub storage_network: ManagedObjectReference,
    pub host: ManagedObjectReference,
    pub root_pool: ManagedObjectReference,
    pub template: ManagedObjectReference,
}

impl VCenterFixture {
    pub fn new() -> Self {
        Self::build(MockVSphereClient::new(SERVER))
    }

    /// Same inventory served by a standalone ESXi host
    pub fn standalone() -> Self {
        let host = MockVSphereClient::new(SERVER);
        host.set_standalone_host();
        Self::build(host)
    }

    fn build(vcenter: MockVSphereClient) -> Self {
        let datacenter = vcenter.add_datacenter(DATACENTER);
        let datastore = vcenter.add_datastore(DATACENTER, "datastore1");
        let folder = vcenter.add_folder(DATACENTER, "workloads");
        let network = vcenter.add_network(DATACENTER, "VM Network");
        let storage_network = vcenter.add_network(DATACENTER, "Storage Network");
        let (host, root_pool) = vcenter.add_host(DATACENTER, "esx-01");
        let template = vcenter.add_vm(
            DATACENTER,
            TEMPLATE,
            template_props(&datastore, &network, &host, &root_pool),
        );

        let connector = MockConnector::new();
        connector.add_endpoint(SERVER, vcenter.clone());

        Self {
            vcenter,
            connector,
            datacenter,
            datastore,
            folder,
            network,
            storage_network,
            host,
            root_pool,
            template,
        }
    }

    pub async fn session(&self) -> Arc<Session> {
        SessionCache::new(Arc::new(self.connector.clone()))
            .get_or_create(&session_params())
            .await
            .expect("fixture session")
    }

    /// Complete the most recent task, returning its result
    pub fn complete_last_task(&self) -> Option<ManagedObjectReference> {
        let task = self.vcenter.last_task().expect("a submitted task");
        self.vcenter.complete_task(&task)
    }
}

pub fn session_params() -> SessionParams {
    SessionParams::new(SERVER)
        .with_user_info(USERNAME, PASSWORD)
        .with_datacenter(DATACENTER)
}

/// 20GiB single-disk template with one vmxnet3 adapter, powered off
pub fn template_props(
    datastore: &ManagedObjectReference,
    network: &ManagedObjectReference,
    host: &ManagedObjectReference,
    pool: &ManagedObjectReference,
) -> VirtualMachineProperties {
    VirtualMachineProperties {
        name: TEMPLATE.to_string(),
        instance_uuid: Some(TEMPLATE_UUID.to_string()),
        uuid: Some("4223aa00-0000-0000-0000-000000000001".to_string()),
        guest_id: Some("ubuntu64Guest".to_string()),
        firmware: Some("efi".to_string()),
        num_cpu: 2,
        memory_mb: 4096,
        devices: vec![
            VirtualDevice::ParaVirtualScsiController(VirtualController {
                key: 1000,
                device_info: Some(Description::new("SCSI controller 0")),
                bus_number: Some(0),
                ..Default::default()
            }),
            VirtualDevice::VirtualDisk(VirtualDisk {
                key: 2000,
                device_info: Some(Description::new("Hard disk 1")),
                controller_key: Some(1000),
                unit_number: Some(0),
                capacity_in_bytes: 20 * GIB,
                backing: DiskBacking::thin(
                    "[datastore1] ubuntu-template/ubuntu-template.vmdk",
                    datastore.clone(),
                ),
            }),
            VirtualDevice::VirtualVmxnet3(VirtualEthernetCard {
                key: 4000,
                device_info: Some(Description::new("Network adapter 1")),
                backing: Some(NetworkBacking::new("VM Network", network.clone())),
                address_type: Some("Assigned".to_string()),
                mac_address: Some("00:50:56:aa:00:01".to_string()),
            }),
        ],
        power_state: Some(VirtualMachinePowerState::PoweredOff),
        host: Some(host.clone()),
        resource_pool: Some(pool.clone()),
        ..Default::default()
    }
}

/// Cluster pointing at the fixture endpoint with an IPAM config Secret
pub fn test_cluster() -> VSphereCluster {
    let mut cluster = VSphereCluster::new(
        CLUSTER,
        VSphereClusterSpec {
            server: SERVER.to_string(),
            datacenter: Some(DATACENTER.to_string()),
            insecure: true,
            thumbprint: None,
            credentials_secret: None,
            zone: None,
            ssh_port: 22,
        },
    );
    cluster.metadata.namespace = Some(NAMESPACE.to_string());
    cluster.metadata.annotations = Some(BTreeMap::from([(
        IPAM_CONFIG_SECRET_NAME_ANNOTATION.to_string(),
        IPAM_SECRET.to_string(),
    )]));
    cluster
}

pub fn dhcp_device(network: &str) -> NetworkDeviceSpec {
    NetworkDeviceSpec {
        network_name: network.to_string(),
        dhcp4: true,
        ..Default::default()
    }
}

/// Machine with a single DHCP adapter on "VM Network"
pub fn test_machine(name: &str) -> VSphereMachine {
    test_machine_with_devices(name, vec![dhcp_device("VM Network")])
}

pub fn test_machine_with_devices(name: &str, devices: Vec<NetworkDeviceSpec>) -> VSphereMachine {
    let mut spec: VSphereMachineSpec = serde_json::from_value(serde_json::json!({
        "clusterName": CLUSTER,
        "template": TEMPLATE,
        "bootstrapDataSecret": bootstrap_secret(name),
    }))
    .expect("valid machine spec");
    spec.network.devices = devices;

    VSphereMachine {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            uid: Some(MACHINE_UID.to_string()),
            generation: Some(1),
            annotations: Some(BTreeMap::from([
                (PRIMARY_NETWORK_NAME_ANNOTATION.to_string(), "VM Network".to_string()),
                (STORAGE_NETWORK_NAME_ANNOTATION.to_string(), "Storage Network".to_string()),
            ])),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

pub fn bootstrap_secret(name: &str) -> String {
    format!("{}-bootstrap", name)
}

/// Request for `name` as the reconciler would build it
pub fn machine_request(name: &str, bootstrap: Option<&[u8]>) -> MachineRequest {
    MachineRequest {
        key: format!("{}/{}", NAMESPACE, name),
        name: name.to_string(),
        uid: MACHINE_UID.to_string(),
        generation: 1,
        object_ref: ObjectReference {
            api_version: Some("infrastructure.vsphere.microscaler.io/v1alpha1".to_string()),
            kind: Some("VSphereMachine".to_string()),
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            uid: Some(MACHINE_UID.to_string()),
            ..Default::default()
        },
        bootstrap_data: bootstrap.map(<[u8]>::to_vec),
    }
}

type ObjectKey = (String, String);

fn key(namespace: &str, name: &str) -> ObjectKey {
    (namespace.to_string(), name.to_string())
}

/// In-memory API server applying JSON merge patches
#[derive(Default)]
pub struct MockMachineStore {
    clusters: Mutex<HashMap<ObjectKey, VSphereCluster>>,
    secrets: Mutex<HashMap<ObjectKey, BTreeMap<String, Vec<u8>>>>,
    machines: Mutex<HashMap<ObjectKey, Value>>,
    patches: Mutex<Vec<Value>>,
    status_patches: Mutex<Vec<Value>>,
    fail_next_patch: AtomicBool,
}

impl MockMachineStore {
    pub fn add_cluster(&self, cluster: &VSphereCluster) {
        let namespace = cluster.metadata.namespace.clone().unwrap_or_default();
        let name = cluster.metadata.name.clone().unwrap_or_default();
        self.clusters
            .lock()
            .unwrap()
            .insert(key(&namespace, &name), cluster.clone());
    }

    pub fn add_secret(&self, namespace: &str, name: &str, data: &[(&str, &[u8])]) {
        let data = data
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_vec()))
            .collect();
        self.secrets.lock().unwrap().insert(key(namespace, name), data);
    }

    pub fn add_machine(&self, machine: &VSphereMachine) {
        let namespace = machine.metadata.namespace.clone().unwrap_or_default();
        let name = machine.metadata.name.clone().unwrap_or_default();
        self.machines
            .lock()
            .unwrap()
            .insert(key(&namespace, &name), serde_json::to_value(machine).unwrap());
    }

    /// Current state of a stored machine with all patches applied
    pub fn machine(&self, namespace: &str, name: &str) -> VSphereMachine {
        let stored = self.machines.lock().unwrap()[&key(namespace, name)].clone();
        serde_json::from_value(stored).unwrap()
    }

    /// Object (non-status) patches, oldest first
    pub fn patches(&self) -> Vec<Value> {
        self.patches.lock().unwrap().clone()
    }

    pub fn status_patches(&self) -> Vec<Value> {
        self.status_patches.lock().unwrap().clone()
    }

    /// Fail the next object patch with an API error
    pub fn fail_next_patch(&self) {
        self.fail_next_patch.store(true, Ordering::SeqCst);
    }

    fn apply(&self, namespace: &str, name: &str, patch: &Value) {
        if let Some(stored) = self.machines.lock().unwrap().get_mut(&key(namespace, name)) {
            merge_patch(stored, patch);
        }
    }
}

/// RFC 7386 JSON merge patch
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(entries) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(map) = target {
        for (field, value) in entries {
            if value.is_null() {
                map.remove(field);
            } else {
                merge_patch(map.entry(field.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[async_trait]
impl MachineStore for MockMachineStore {
    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VSphereCluster>, ControllerError> {
        Ok(self.clusters.lock().unwrap().get(&key(namespace, name)).cloned())
    }

    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, ControllerError> {
        Ok(self.secrets.lock().unwrap().get(&key(namespace, name)).cloned())
    }

    async fn patch_machine(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), ControllerError> {
        if self.fail_next_patch.swap(false, Ordering::SeqCst) {
            return Err(ControllerError::Kube(kube::Error::Service(Box::new(
                std::io::Error::other("injected patch failure"),
            ))));
        }
        self.patches.lock().unwrap().push(patch.clone());
        self.apply(namespace, name, patch);
        Ok(())
    }

    async fn patch_machine_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), ControllerError> {
        self.status_patches.lock().unwrap().push(patch.clone());
        self.apply(namespace, name, patch);
        Ok(())
    }
}

/// Event publisher that keeps what it was given
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<(EventType, String, Option<String>)>>,
}

impl RecordingEventPublisher {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, reason, _)| reason.clone())
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(type_, _, _)| *type_ == EventType::Warning)
            .map(|(_, reason, _)| reason.clone())
            .collect()
    }

    pub fn notes(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, _, note)| note.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events
            .lock()
            .unwrap()
            .push((type_, reason.to_string(), note));
    }
}

/// Shell that records commands and answers from a script
///
/// Commands without a scripted answer succeed with empty output.
#[derive(Clone, Default)]
pub struct ScriptedShellFactory {
    commands: Arc<Mutex<Vec<String>>>,
    responses: Arc<Mutex<Vec<(String, CommandOutput)>>>,
    connections: Arc<Mutex<Vec<ShellParams>>>,
    refuse: Arc<AtomicBool>,
    closed: Arc<AtomicUsize>,
}

impl ScriptedShellFactory {
    /// Answer commands starting with `prefix` with `output`
    pub fn respond(&self, prefix: &str, output: CommandOutput) {
        self.responses
            .lock()
            .unwrap()
            .push((prefix.to_string(), output));
    }

    pub fn refuse_connections(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn connections(&self) -> Vec<ShellParams> {
        self.connections.lock().unwrap().clone()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteShellFactory for ScriptedShellFactory {
    async fn connect(&self, params: &ShellParams) -> Result<Box<dyn RemoteShell>, RemoteShellError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(RemoteShellError::Connect(format!(
                "{}:{} refused the connection",
                params.host, params.port
            )));
        }
        self.connections.lock().unwrap().push(params.clone());
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl RemoteShell for ScriptedShellFactory {
    async fn exec(&self, command: &str) -> Result<CommandOutput, RemoteShellError> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(self
            .responses
            .lock()
            .unwrap()
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Params for the fixture's SSH endpoint
pub fn shell_params() -> ShellParams {
    ShellParams {
        host: SERVER.to_string(),
        port: 22,
        username: USERNAME.to_string(),
        password: PASSWORD.to_string(),
    }
}
