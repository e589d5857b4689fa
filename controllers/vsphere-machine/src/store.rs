//! Kubernetes persistence seam
//!
//! Everything the reconciler reads from or writes to the API server goes
//! through [`MachineStore`], so reconcile logic can run against an in-memory
//! store in tests.

use crate::error::ControllerError;
use async_trait::async_trait;
use crds::{VSphereCluster, VSphereMachine};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use std::collections::BTreeMap;

/// Reads and writes the resources a machine reconcile depends on
#[async_trait]
pub trait MachineStore: Send + Sync {
    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VSphereCluster>, ControllerError>;

    /// Data of a Secret, `None` when the Secret does not exist
    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, ControllerError>;

    /// JSON merge patch of the machine object (metadata and spec)
    async fn patch_machine(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), ControllerError>;

    /// JSON merge patch of the status subresource
    async fn patch_machine_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), ControllerError>;
}

/// API-server backed store
#[derive(Clone)]
pub struct KubeMachineStore {
    client: Client,
}

impl std::fmt::Debug for KubeMachineStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeMachineStore").finish_non_exhaustive()
    }
}

impl KubeMachineStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MachineStore for KubeMachineStore {
    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VSphereCluster>, ControllerError> {
        let api: Api<VSphereCluster> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, ControllerError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.map(|secret| {
            secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(key, value)| (key, value.0))
                .collect()
        }))
    }

    async fn patch_machine(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), ControllerError> {
        let api: Api<VSphereMachine> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn patch_machine_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), ControllerError> {
        let api: Api<VSphereMachine> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}
