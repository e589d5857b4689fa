//! vSphere VI/JSON API client

use crate::common::{map_transport_error, HttpClient, DEFAULT_RELEASE, SESSION_HEADER};
use crate::error::VSphereError;
use crate::models::*;
use crate::vsphere_trait::{VSphereClientTrait, VSphereConnector};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// `ServiceInstance.content`, reduced to the references this client needs
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceContent {
    about: AboutInfo,
    root_folder: ManagedObjectReference,
    search_index: ManagedObjectReference,
    session_manager: ManagedObjectReference,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmConfigInfo {
    name: String,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    instance_uuid: Option<String>,
    #[serde(default)]
    guest_id: Option<String>,
    #[serde(default)]
    firmware: Option<String>,
    #[serde(default)]
    boot_options: Option<serde_json::Value>,
    hardware: VmHardware,
    #[serde(default)]
    extra_config: Vec<OptionValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmHardware {
    #[serde(rename = "numCPU", default)]
    num_cpu: i32,
    #[serde(rename = "memoryMB", default)]
    memory_mb: i64,
    #[serde(default)]
    device: Vec<VirtualDevice>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmRuntimeInfo {
    #[serde(default)]
    power_state: Option<VirtualMachinePowerState>,
    #[serde(default)]
    host: Option<ManagedObjectReference>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GuestInfo {
    #[serde(default)]
    net: Vec<GuestNicInfo>,
}

/// vSphere API client holding one authenticated session
pub struct VSphereClient {
    http: HttpClient,
    server: String,
    content: ServiceContent,
}

impl std::fmt::Debug for VSphereClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VSphereClient")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl VSphereClient {
    /// Log in to a vSphere endpoint
    ///
    /// # Arguments
    /// * `params` - Endpoint and credentials
    /// * `timeout` - Per-request timeout
    ///
    /// # Returns
    /// An authenticated client or `Authentication`/`EndpointUnreachable`
    pub async fn login(params: &ConnectParams, timeout: Duration) -> Result<Self, VSphereError> {
        let base_url = normalize_server_url(&params.server)?;

        let builder = Client::builder().timeout(timeout);
        let builder = match params.thumbprint.as_deref() {
            Some(thumbprint) => {
                debug!("Pinning certificate of {} to {}", base_url, thumbprint);
                builder.use_preconfigured_tls(crate::tls::pinned_client_config(thumbprint)?)
            }
            None => builder.danger_accept_invalid_certs(params.insecure),
        };
        let client = builder.build().map_err(VSphereError::Http)?;

        // Service content is readable without a session
        let content_url = format!(
            "{}/sdk/vim25/{}/ServiceInstance/ServiceInstance/content",
            base_url, DEFAULT_RELEASE
        );
        debug!("GET {}", content_url);
        let content: ServiceContent = client
            .get(&content_url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(map_transport_error)?
            .error_for_status()
            .map_err(|e| VSphereError::EndpointUnreachable(e.to_string()))?
            .json()
            .await
            .map_err(VSphereError::Http)?;

        let login_url = format!(
            "{}/sdk/vim25/{}/{}/{}/Login",
            base_url, DEFAULT_RELEASE, content.session_manager.type_, content.session_manager.value
        );
        debug!("POST {}", login_url);
        let response = client
            .post(&login_url)
            .header("Content-Type", "application/json")
            .json(&json!({ "userName": params.username, "password": params.password }))
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(crate::common::fault_to_error(status, &body, "Login"));
        }

        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                VSphereError::Authentication(format!("Login to {} returned no session id", base_url))
            })?;

        info!("Logged in to {} ({})", base_url, content.about.full_name);

        Ok(Self {
            http: HttpClient::new(client, base_url, DEFAULT_RELEASE.to_string(), session_id),
            server: params.server.clone(),
            content,
        })
    }
}

/// Accept `host`, `host:port` or a full URL; always talk HTTPS by default
fn normalize_server_url(server: &str) -> Result<String, VSphereError> {
    let candidate = if server.contains("://") {
        server.to_string()
    } else {
        format!("https://{}", server)
    };
    let url = Url::parse(&candidate)
        .map_err(|e| VSphereError::EndpointUnreachable(format!("invalid server URL {:?}: {}", server, e)))?;
    if url.host_str().is_none() {
        return Err(VSphereError::EndpointUnreachable(format!(
            "server URL {:?} has no host",
            server
        )));
    }
    Ok(format!("{}://{}", url.scheme(), url.authority()))
}

#[async_trait::async_trait]
impl VSphereClientTrait for VSphereClient {
    fn server(&self) -> &str {
        &self.server
    }

    async fn session_is_active(&self) -> Result<bool, VSphereError> {
        let current: Result<Option<serde_json::Value>, VSphereError> = self
            .http
            .get_property(&self.content.session_manager, "currentSession")
            .await;
        match current {
            Ok(session) => Ok(session.is_some()),
            Err(VSphereError::Authentication(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn logout(&self) -> Result<(), VSphereError> {
        self.http
            .invoke_void(&self.content.session_manager, "Logout", &json!({}))
            .await
    }

    async fn about(&self) -> Result<AboutInfo, VSphereError> {
        Ok(self.content.about.clone())
    }

    async fn find_by_inventory_path(
        &self,
        path: &str,
    ) -> Result<Option<ManagedObjectReference>, VSphereError> {
        self.http
            .invoke(
                &self.content.search_index,
                "FindByInventoryPath",
                &json!({ "inventoryPath": path }),
            )
            .await
    }

    async fn find_by_instance_uuid(
        &self,
        datacenter: &ManagedObjectReference,
        uuid: &str,
    ) -> Result<Option<ManagedObjectReference>, VSphereError> {
        self.http
            .invoke(
                &self.content.search_index,
                "FindByUuid",
                &json!({
                    "datacenter": datacenter,
                    "uuid": uuid,
                    "vmSearch": true,
                    "instanceUuid": true,
                }),
            )
            .await
    }

    async fn child_entities(
        &self,
        folder: Option<&ManagedObjectReference>,
    ) -> Result<Vec<ManagedObjectReference>, VSphereError> {
        let folder = folder.unwrap_or(&self.content.root_folder);
        self.http.get_property(folder, "childEntity").await
    }

    async fn datacenter_info(
        &self,
        datacenter: &ManagedObjectReference,
    ) -> Result<DatacenterInfo, VSphereError> {
        let name: String = self.http.get_property(datacenter, "name").await?;
        let vm_folder = self.http.get_property(datacenter, "vmFolder").await?;
        let host_folder = self.http.get_property(datacenter, "hostFolder").await?;
        let datastore = self.http.get_property(datacenter, "datastore").await?;
        Ok(DatacenterInfo {
            name,
            vm_folder,
            host_folder,
            datastore,
        })
    }

    async fn object_name(&self, obj: &ManagedObjectReference) -> Result<String, VSphereError> {
        self.http.get_property(obj, "name").await
    }

    async fn compute_resource_pool(
        &self,
        compute_resource: &ManagedObjectReference,
    ) -> Result<ManagedObjectReference, VSphereError> {
        self.http.get_property(compute_resource, "resourcePool").await
    }

    async fn vm_properties(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<VirtualMachineProperties, VSphereError> {
        let config: VmConfigInfo = self.http.get_property(vm, "config").await?;
        let runtime: VmRuntimeInfo = self.http.get_property(vm, "runtime").await?;
        let guest: Option<GuestInfo> = self.http.get_property(vm, "guest").await?;
        let resource_pool: Option<ManagedObjectReference> =
            self.http.get_property(vm, "resourcePool").await?;
        let snapshot: Option<VirtualMachineSnapshotInfo> =
            self.http.get_property(vm, "snapshot").await?;

        Ok(VirtualMachineProperties {
            name: config.name,
            instance_uuid: config.instance_uuid,
            uuid: config.uuid,
            guest_id: config.guest_id,
            firmware: config.firmware,
            boot_options: config.boot_options,
            num_cpu: config.hardware.num_cpu,
            memory_mb: config.hardware.memory_mb,
            devices: config.hardware.device,
            extra_config: config.extra_config,
            power_state: runtime.power_state,
            host: runtime.host,
            resource_pool,
            guest_net: guest.unwrap_or_default().net,
            snapshot,
        })
    }

    async fn host_properties(
        &self,
        host: &ManagedObjectReference,
    ) -> Result<HostProperties, VSphereError> {
        let name: String = self.http.get_property(host, "name").await?;
        let parent: ManagedObjectReference = self.http.get_property(host, "parent").await?;
        let compute_resource_name = self.object_name(&parent).await?;
        let resource_pool = self.compute_resource_pool(&parent).await?;
        Ok(HostProperties {
            name,
            compute_resource_name,
            resource_pool,
        })
    }

    async fn task_info(
        &self,
        task: &ManagedObjectReference,
    ) -> Result<Option<TaskInfo>, VSphereError> {
        match self.http.get_property(task, "info").await {
            Ok(info) => Ok(Some(info)),
            Err(VSphereError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_resource_pool(
        &self,
        parent: &ManagedObjectReference,
        name: &str,
        spec: &ResourceConfigSpec,
    ) -> Result<ManagedObjectReference, VSphereError> {
        self.http
            .invoke(parent, "CreateResourcePool", &json!({ "name": name, "spec": spec }))
            .await
    }

    async fn clone_vm(
        &self,
        source: &ManagedObjectReference,
        folder: &ManagedObjectReference,
        name: &str,
        spec: &VirtualMachineCloneSpec,
    ) -> Result<ManagedObjectReference, VSphereError> {
        self.http
            .invoke(
                source,
                "CloneVM_Task",
                &json!({ "folder": folder, "name": name, "spec": spec }),
            )
            .await
    }

    async fn create_vm(
        &self,
        folder: &ManagedObjectReference,
        spec: &VirtualMachineConfigSpec,
        pool: &ManagedObjectReference,
        host: Option<&ManagedObjectReference>,
    ) -> Result<ManagedObjectReference, VSphereError> {
        let mut body = json!({ "config": spec, "pool": pool });
        if let Some(host) = host {
            body["host"] = serde_json::to_value(host)?;
        }
        self.http.invoke(folder, "CreateVM_Task", &body).await
    }

    async fn reconfigure_vm(
        &self,
        vm: &ManagedObjectReference,
        spec: &VirtualMachineConfigSpec,
    ) -> Result<ManagedObjectReference, VSphereError> {
        self.http
            .invoke(vm, "ReconfigVM_Task", &json!({ "spec": spec }))
            .await
    }

    async fn power_on_vm(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<ManagedObjectReference, VSphereError> {
        self.http.invoke(vm, "PowerOnVM_Task", &json!({})).await
    }

    async fn power_off_vm(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<ManagedObjectReference, VSphereError> {
        self.http.invoke(vm, "PowerOffVM_Task", &json!({})).await
    }

    async fn destroy_vm(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<ManagedObjectReference, VSphereError> {
        self.http.invoke(vm, "Destroy_Task", &json!({})).await
    }
}

/// Connector that logs in over the VI/JSON API
#[derive(Debug, Clone)]
pub struct RestConnector {
    timeout: Duration,
}

impl RestConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for RestConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait::async_trait]
impl VSphereConnector for RestConnector {
    async fn connect(
        &self,
        params: &ConnectParams,
    ) -> Result<Arc<dyn VSphereClientTrait>, VSphereError> {
        let client = VSphereClient::login(params, self.timeout).await?;
        Ok(Arc::new(client))
    }
}
