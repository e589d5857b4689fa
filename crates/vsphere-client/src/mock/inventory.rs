//! Inventory setup and lookups for MockVSphereClient
//!
//! Handles datacenters, folders, datastores, networks, hosts and resource pools.

use super::{lock, MockCall, MockVSphereClient};
use crate::error::VSphereError;
use crate::models::*;

const ROOT: &str = "";

impl MockVSphereClient {
    /// Register a datacenter at inventory path `/<name>`
    pub fn add_datacenter(&self, name: &str) -> ManagedObjectReference {
        let id = self.next_id();
        let dc = ManagedObjectReference::new(moref_type::DATACENTER, format!("datacenter-{}", id));
        let vm_folder = ManagedObjectReference::new(moref_type::FOLDER, format!("group-v{}", id));
        let host_folder = ManagedObjectReference::new(moref_type::FOLDER, format!("group-h{}", id));

        self.register(format!("/{}", name), dc.clone(), name);
        self.register(format!("/{}/vm", name), vm_folder.clone(), "vm");
        self.register(format!("/{}/host", name), host_folder.clone(), "host");
        lock(&self.children)
            .entry(ROOT.to_string())
            .or_default()
            .push(dc.clone());
        lock(&self.datacenters).insert(
            dc.value.clone(),
            DatacenterInfo {
                name: name.to_string(),
                vm_folder,
                host_folder,
                datastore: Vec::new(),
            },
        );
        dc
    }

    /// Register a datastore at `/<dc>/datastore/<name>`
    pub fn add_datastore(&self, datacenter: &str, name: &str) -> ManagedObjectReference {
        let ds = ManagedObjectReference::new(moref_type::DATASTORE, format!("datastore-{}", self.next_id()));
        self.register(format!("/{}/datastore/{}", datacenter, name), ds.clone(), name);
        if let Some(info) = lock(&self.datacenters)
            .values_mut()
            .find(|info| info.name == datacenter)
        {
            info.datastore.push(ds.clone());
        }
        ds
    }

    /// Register a VM folder at `/<dc>/vm/<name>`
    pub fn add_folder(&self, datacenter: &str, name: &str) -> ManagedObjectReference {
        let folder = ManagedObjectReference::new(moref_type::FOLDER, format!("group-v{}", self.next_id()));
        self.register(format!("/{}/vm/{}", datacenter, name), folder.clone(), name);
        folder
    }

    /// Register a network at `/<dc>/network/<name>`
    pub fn add_network(&self, datacenter: &str, name: &str) -> ManagedObjectReference {
        let network = ManagedObjectReference::new(moref_type::NETWORK, format!("network-{}", self.next_id()));
        self.register(format!("/{}/network/{}", datacenter, name), network.clone(), name);
        network
    }

    /// Register a standalone host with its compute resource and root pool
    ///
    /// Returns `(host, root resource pool)`.
    pub fn add_host(&self, datacenter: &str, name: &str) -> (ManagedObjectReference, ManagedObjectReference) {
        let id = self.next_id();
        let compute = ManagedObjectReference::new(moref_type::COMPUTE_RESOURCE, format!("domain-s{}", id));
        let host = ManagedObjectReference::new(moref_type::HOST_SYSTEM, format!("host-{}", id));
        let pool = ManagedObjectReference::new(moref_type::RESOURCE_POOL, format!("resgroup-{}", id));

        let compute_path = format!("/{}/host/{}", datacenter, name);
        self.register(compute_path.clone(), compute.clone(), name);
        self.register(format!("{}/{}", compute_path, name), host.clone(), name);
        self.register(format!("{}/Resources", compute_path), pool.clone(), "Resources");

        let host_folder = lock(&self.datacenters)
            .values()
            .find(|info| info.name == datacenter)
            .map(|info| info.host_folder.value.clone());
        if let Some(folder) = host_folder {
            lock(&self.children).entry(folder).or_default().push(compute.clone());
        }
        lock(&self.compute_pools).insert(compute.value.clone(), pool.clone());
        lock(&self.hosts).insert(
            host.value.clone(),
            HostProperties {
                name: name.to_string(),
                compute_resource_name: name.to_string(),
                resource_pool: pool.clone(),
            },
        );
        (host, pool)
    }

    /// Inventory path of a registered object
    pub fn path_of(&self, obj: &ManagedObjectReference) -> Option<String> {
        lock(&self.inventory)
            .iter()
            .find(|(_, v)| *v == obj)
            .map(|(path, _)| path.clone())
    }

    pub(crate) fn register(&self, path: String, obj: ManagedObjectReference, name: &str) {
        lock(&self.names).insert(obj.clone(), name.to_string());
        lock(&self.inventory).insert(path, obj);
    }
}

pub fn find_by_inventory_path(
    client: &MockVSphereClient,
    path: &str,
) -> Result<Option<ManagedObjectReference>, VSphereError> {
    client.take_failure("find_by_inventory_path")?;
    Ok(lock(&client.inventory).get(path).cloned())
}

pub fn child_entities(
    client: &MockVSphereClient,
    folder: Option<&ManagedObjectReference>,
) -> Result<Vec<ManagedObjectReference>, VSphereError> {
    let key = folder.map_or(ROOT, |f| f.value.as_str());
    Ok(lock(&client.children).get(key).cloned().unwrap_or_default())
}

pub fn datacenter_info(
    client: &MockVSphereClient,
    datacenter: &ManagedObjectReference,
) -> Result<DatacenterInfo, VSphereError> {
    lock(&client.datacenters)
        .get(&datacenter.value)
        .cloned()
        .ok_or_else(|| VSphereError::NotFound(format!("Datacenter {} not found", datacenter)))
}

pub fn object_name(
    client: &MockVSphereClient,
    obj: &ManagedObjectReference,
) -> Result<String, VSphereError> {
    lock(&client.names)
        .get(obj)
        .cloned()
        .ok_or_else(|| VSphereError::NotFound(format!("Object {} not found", obj)))
}

pub fn compute_resource_pool(
    client: &MockVSphereClient,
    compute_resource: &ManagedObjectReference,
) -> Result<ManagedObjectReference, VSphereError> {
    lock(&client.compute_pools)
        .get(&compute_resource.value)
        .cloned()
        .ok_or_else(|| VSphereError::NotFound(format!("Compute resource {} not found", compute_resource)))
}

pub fn host_properties(
    client: &MockVSphereClient,
    host: &ManagedObjectReference,
) -> Result<HostProperties, VSphereError> {
    lock(&client.hosts)
        .get(&host.value)
        .cloned()
        .ok_or_else(|| VSphereError::NotFound(format!("Host {} not found", host)))
}

pub fn create_resource_pool(
    client: &MockVSphereClient,
    parent: &ManagedObjectReference,
    name: &str,
) -> Result<ManagedObjectReference, VSphereError> {
    client.take_failure("create_resource_pool")?;
    let parent_path = client
        .path_of(parent)
        .ok_or_else(|| VSphereError::NotFound(format!("Resource pool {} not found", parent)))?;

    let pool = ManagedObjectReference::new(moref_type::RESOURCE_POOL, format!("resgroup-{}", client.next_id()));
    client.register(format!("{}/{}", parent_path, name), pool.clone(), name);
    client.record(MockCall::CreateResourcePool {
        parent: parent.clone(),
        name: name.to_string(),
    });
    Ok(pool)
}
