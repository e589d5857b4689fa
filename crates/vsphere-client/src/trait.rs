//! Trait seams for the vSphere client
//!
//! `VSphereClientTrait` is the subset of the vim25 API needed to provision a
//! single VM. `VSphereConnector` creates authenticated clients and lets the
//! session cache be tested without a live endpoint.

use crate::error::VSphereError;
use crate::models::*;
use std::sync::Arc;

/// Authenticated connection to one vSphere endpoint
#[async_trait::async_trait]
pub trait VSphereClientTrait: Send + Sync {
    /// Endpoint this client is connected to
    fn server(&self) -> &str;

    /// Lightweight liveness check of the authenticated session
    async fn session_is_active(&self) -> Result<bool, VSphereError>;

    /// Terminate the session
    async fn logout(&self) -> Result<(), VSphereError>;

    /// Product information, used to tell vCenter from a standalone host
    async fn about(&self) -> Result<AboutInfo, VSphereError>;

    // Inventory lookups

    /// Resolve an inventory path such as `/dc1/vm/folder/name`
    async fn find_by_inventory_path(
        &self,
        path: &str,
    ) -> Result<Option<ManagedObjectReference>, VSphereError>;

    /// Resolve a VM by instance UUID within a datacenter
    async fn find_by_instance_uuid(
        &self,
        datacenter: &ManagedObjectReference,
        uuid: &str,
    ) -> Result<Option<ManagedObjectReference>, VSphereError>;

    /// Children of the root folder (`None`) or of the given folder
    async fn child_entities(
        &self,
        folder: Option<&ManagedObjectReference>,
    ) -> Result<Vec<ManagedObjectReference>, VSphereError>;

    async fn datacenter_info(
        &self,
        datacenter: &ManagedObjectReference,
    ) -> Result<DatacenterInfo, VSphereError>;

    /// Display name of any managed entity
    async fn object_name(&self, obj: &ManagedObjectReference) -> Result<String, VSphereError>;

    /// Root resource pool of a compute resource or cluster
    async fn compute_resource_pool(
        &self,
        compute_resource: &ManagedObjectReference,
    ) -> Result<ManagedObjectReference, VSphereError>;

    // Property fetches

    async fn vm_properties(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<VirtualMachineProperties, VSphereError>;

    async fn host_properties(
        &self,
        host: &ManagedObjectReference,
    ) -> Result<HostProperties, VSphereError>;

    /// `Task.info`; `None` once the task has aged out of the server
    async fn task_info(
        &self,
        task: &ManagedObjectReference,
    ) -> Result<Option<TaskInfo>, VSphereError>;

    // Mutations

    async fn create_resource_pool(
        &self,
        parent: &ManagedObjectReference,
        name: &str,
        spec: &ResourceConfigSpec,
    ) -> Result<ManagedObjectReference, VSphereError>;

    /// `CloneVM_Task`; returns the task reference
    async fn clone_vm(
        &self,
        source: &ManagedObjectReference,
        folder: &ManagedObjectReference,
        name: &str,
        spec: &VirtualMachineCloneSpec,
    ) -> Result<ManagedObjectReference, VSphereError>;

    /// `CreateVM_Task`; returns the task reference
    async fn create_vm(
        &self,
        folder: &ManagedObjectReference,
        spec: &VirtualMachineConfigSpec,
        pool: &ManagedObjectReference,
        host: Option<&ManagedObjectReference>,
    ) -> Result<ManagedObjectReference, VSphereError>;

    async fn reconfigure_vm(
        &self,
        vm: &ManagedObjectReference,
        spec: &VirtualMachineConfigSpec,
    ) -> Result<ManagedObjectReference, VSphereError>;

    async fn power_on_vm(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<ManagedObjectReference, VSphereError>;

    async fn power_off_vm(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<ManagedObjectReference, VSphereError>;

    async fn destroy_vm(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<ManagedObjectReference, VSphereError>;
}

/// Factory for authenticated clients
#[async_trait::async_trait]
pub trait VSphereConnector: Send + Sync {
    /// Authenticate against `params.server`
    ///
    /// Fails with `Authentication` when the credentials are rejected and with
    /// `EndpointUnreachable` when the URL cannot be parsed or connected.
    async fn connect(
        &self,
        params: &ConnectParams,
    ) -> Result<Arc<dyn VSphereClientTrait>, VSphereError>;
}
