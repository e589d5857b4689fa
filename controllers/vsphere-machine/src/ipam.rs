//! Static address leasing for machine network devices
//!
//! Devices that ask for neither DHCP nor fixed addresses get one address per
//! device from the IPAM agent configured on the owning cluster. Leases are
//! recorded in the machine's `ipam-managed` annotation before the devices are
//! updated, so they can be released after a restart. Any failure after a
//! successful reservation releases what was reserved in the same pass.

use crate::error::ControllerError;
use crate::events::{actions, reasons, EventPublisher};
use crate::metrics;
use crate::store::MachineStore;
use crds::{
    NetworkDeviceSpec, VSphereCluster, VSphereMachine, IPAM_CONFIG_SECRET_KEY,
    IPAM_CONFIG_SECRET_NAMESPACE_ANNOTATION, IPAM_CONFIG_SECRET_NAME_ANNOTATION,
    IPAM_MANAGED_ANNOTATION, PRIMARY_NETWORK_NAME_ANNOTATION, STORAGE_NETWORK_NAME_ANNOTATION,
};
use ipam_client::{
    reservation_addresses, IpAddressReservation, IpVersion, IpamAgent, IpamAgentFactory,
    IpamConfig, IpamError, NetworkType,
};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Leased addresses per network type, as stored in the annotation
type ManagedAddresses = BTreeMap<String, Vec<String>>;

pub struct IpamService {
    factory: Arc<dyn IpamAgentFactory>,
    store: Arc<dyn MachineStore>,
}

impl std::fmt::Debug for IpamService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpamService").finish_non_exhaustive()
    }
}

impl IpamService {
    pub fn new(factory: Arc<dyn IpamAgentFactory>, store: Arc<dyn MachineStore>) -> Self {
        Self { factory, store }
    }

    /// Lease addresses for every device that still needs one
    ///
    /// # Arguments
    ///
    /// * `machine` - Machine whose devices are checked; the leases and the
    ///   filled devices are patched onto it before they are returned
    /// * `cluster` - Owning cluster, which names the IPAM agent endpoint
    /// * `events` - Sink for the `IPAddressesReserved` event
    ///
    /// # Returns
    ///
    /// * `Ok(Some(devices))` - The device list with leased addresses, gateways
    ///   and name servers filled in
    /// * `Ok(None)` - No device needed an address
    /// * `Err(ControllerError)` - The agent or the annotation write failed
    pub async fn reconcile(
        &self,
        machine: &VSphereMachine,
        cluster: &VSphereCluster,
        events: &dyn EventPublisher,
    ) -> Result<Option<Vec<NetworkDeviceSpec>>, ControllerError> {
        let mut devices = machine.spec.network.devices.clone();
        let groups = group_pending_devices(machine, cluster, &devices)?;
        if groups.is_empty() {
            return Ok(None);
        }

        let namespace = machine.namespace().unwrap_or_default();
        let name = machine.name_any();
        let agent = self.agent(cluster).await?;

        let mut managed = machine.annotations().get(IPAM_MANAGED_ANNOTATION).cloned();
        let mut reserved: Vec<(NetworkType, Vec<String>)> = Vec::new();

        for (network_type, indices) in &groups {
            let reservations = match agent
                .reserve(*network_type, IpVersion::IPv4, indices.len())
                .await
            {
                Ok(reservations) => reservations,
                Err(e) => {
                    release_all(agent.as_ref(), &reserved).await;
                    return Err(e.into());
                }
            };
            let addresses = reservation_addresses(&reservations);
            reserved.push((*network_type, addresses.clone()));

            if reservations.len() != indices.len() {
                release_all(agent.as_ref(), &reserved).await;
                return Err(IpamError::Exhausted(format!(
                    "requested {} {} addresses, agent returned {}",
                    indices.len(),
                    network_type,
                    reservations.len()
                ))
                .into());
            }

            managed = match merge_managed(managed.as_deref(), *network_type, &addresses) {
                Ok(merged) => Some(merged),
                Err(e) => {
                    release_all(agent.as_ref(), &reserved).await;
                    return Err(IpamError::Serialization(e).into());
                }
            };

            for (index, reservation) in indices.iter().zip(&reservations) {
                assign(&mut devices[*index], reservation);
            }
        }

        let patch = serde_json::json!({
            "metadata": { "annotations": { IPAM_MANAGED_ANNOTATION: managed } },
            "spec": { "network": { "devices": &devices } },
        });
        if let Err(e) = self.store.patch_machine(&namespace, &name, &patch).await {
            release_all(agent.as_ref(), &reserved).await;
            return Err(e);
        }

        let total: usize = reserved.iter().map(|(_, a)| a.len()).sum();
        metrics::record_ipam_addresses("reserve", total);
        let summary = summarize(&reserved);
        info!("Reserved IP addresses for {}/{}: {}", namespace, name, summary);
        events
            .publish(
                &machine.object_ref(&()),
                EventType::Normal,
                reasons::IP_ADDRESSES_RESERVED,
                actions::PROVISION,
                Some(summary),
            )
            .await;

        Ok(Some(devices))
    }

    /// Release every address recorded on the machine
    ///
    /// A machine without the annotation, or with an empty one, is a no-op.
    /// Each network type is removed from the annotation as soon as its
    /// addresses are released.
    pub async fn release(
        &self,
        machine: &VSphereMachine,
        cluster: &VSphereCluster,
        events: &dyn EventPublisher,
    ) -> Result<(), ControllerError> {
        let Some(raw) = machine.annotations().get(IPAM_MANAGED_ANNOTATION) else {
            return Ok(());
        };
        let mut managed: ManagedAddresses =
            serde_json::from_str(raw).map_err(IpamError::Serialization)?;
        if managed.values().all(Vec::is_empty) {
            return Ok(());
        }

        let namespace = machine.namespace().unwrap_or_default();
        let name = machine.name_any();
        let agent = self.agent(cluster).await?;
        let mut released: Vec<(NetworkType, Vec<String>)> = Vec::new();

        for key in managed.keys().cloned().collect::<Vec<_>>() {
            let network_type: NetworkType = key.parse()?;
            let addresses = managed.remove(&key).unwrap_or_default();
            if !addresses.is_empty() {
                agent.release(network_type, &addresses).await?;
            }

            let remaining = if managed.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&managed).map_err(IpamError::Serialization)?)
            };
            let patch = serde_json::json!({
                "metadata": { "annotations": { IPAM_MANAGED_ANNOTATION: remaining } }
            });
            self.store.patch_machine(&namespace, &name, &patch).await?;
            debug!("Released {} addresses of {}/{}", network_type, namespace, name);
            released.push((network_type, addresses));
        }

        let total: usize = released.iter().map(|(_, a)| a.len()).sum();
        metrics::record_ipam_addresses("release", total);
        let summary = summarize(&released);
        info!("Released IP addresses of {}/{}: {}", namespace, name, summary);
        events
            .publish(
                &machine.object_ref(&()),
                EventType::Normal,
                reasons::IP_ADDRESSES_RELEASED,
                actions::DELETE,
                Some(summary),
            )
            .await;
        Ok(())
    }

    /// Healthy agent from the configuration Secret named on the cluster
    async fn agent(&self, cluster: &VSphereCluster) -> Result<Arc<dyn IpamAgent>, ControllerError> {
        let annotations = cluster.annotations();
        let secret_name = annotations
            .get(IPAM_CONFIG_SECRET_NAME_ANNOTATION)
            .ok_or_else(|| {
                ControllerError::InvalidConfig(format!(
                    "cluster {} has no {} annotation",
                    cluster.name_any(),
                    IPAM_CONFIG_SECRET_NAME_ANNOTATION
                ))
            })?;
        let secret_namespace = annotations
            .get(IPAM_CONFIG_SECRET_NAMESPACE_ANNOTATION)
            .cloned()
            .or_else(|| cluster.namespace())
            .unwrap_or_default();

        let data = self
            .store
            .get_secret_data(&secret_namespace, secret_name)
            .await?
            .ok_or_else(|| {
                ControllerError::InvalidConfig(format!(
                    "IPAM config secret {}/{} not found",
                    secret_namespace, secret_name
                ))
            })?;
        let raw = data.get(IPAM_CONFIG_SECRET_KEY).ok_or_else(|| {
            ControllerError::InvalidConfig(format!(
                "IPAM config secret {}/{} has no {} key",
                secret_namespace, secret_name, IPAM_CONFIG_SECRET_KEY
            ))
        })?;

        let config = IpamConfig::from_json(raw)?;
        let agent = self.factory.agent(&config)?;
        agent.health_check().await?;
        Ok(agent)
    }
}

/// Indices of devices needing an address, grouped by the pool they draw from
fn group_pending_devices(
    machine: &VSphereMachine,
    cluster: &VSphereCluster,
    devices: &[NetworkDeviceSpec],
) -> Result<BTreeMap<NetworkType, Vec<usize>>, ControllerError> {
    let annotations = machine.annotations();
    let primary = annotations.get(PRIMARY_NETWORK_NAME_ANNOTATION);
    let storage = annotations.get(STORAGE_NETWORK_NAME_ANNOTATION);

    let mut groups: BTreeMap<NetworkType, Vec<usize>> = BTreeMap::new();
    for (index, device) in devices.iter().enumerate() {
        if !device.needs_static_address() {
            continue;
        }
        let network_type = if primary == Some(&device.network_name) {
            if cluster.spec.is_management_zone() {
                NetworkType::Management
            } else {
                NetworkType::Workload
            }
        } else if storage == Some(&device.network_name) {
            NetworkType::Data
        } else {
            return Err(ControllerError::Validation(format!(
                "network {} needs a static address but is neither the {} nor the {} network",
                device.network_name, PRIMARY_NETWORK_NAME_ANNOTATION, STORAGE_NETWORK_NAME_ANNOTATION
            )));
        };
        groups.entry(network_type).or_default().push(index);
    }
    Ok(groups)
}

/// Add `addresses` under `network_type` to the serialized annotation
fn merge_managed(
    existing: Option<&str>,
    network_type: NetworkType,
    addresses: &[String],
) -> Result<String, serde_json::Error> {
    let mut managed: ManagedAddresses = match existing {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)?,
        _ => ManagedAddresses::new(),
    };
    managed
        .entry(network_type.as_str().to_string())
        .or_default()
        .extend(addresses.iter().cloned());
    serde_json::to_string(&managed)
}

fn assign(device: &mut NetworkDeviceSpec, reservation: &IpAddressReservation) {
    device.ip_addrs.push(reservation.address.clone());
    let config = &reservation.network_config;
    if device.nameservers.is_empty() {
        device.nameservers = config.name_servers.clone();
    }
    if device.gateway4.is_none() {
        device.gateway4 = config.default_gateway.clone();
    }
    if device.search_domains.is_empty() {
        device.search_domains = config.domain_search.clone();
    }
}

async fn release_all(agent: &dyn IpamAgent, reserved: &[(NetworkType, Vec<String>)]) {
    for (network_type, addresses) in reserved {
        if let Err(e) = agent.release(*network_type, addresses).await {
            warn!(
                "Failed to release {} addresses {:?} after an aborted reservation: {}",
                network_type, addresses, e
            );
        }
    }
}

fn summarize(leases: &[(NetworkType, Vec<String>)]) -> String {
    leases
        .iter()
        .map(|(network_type, addresses)| format!("{}: {}", network_type, addresses.join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use ipam_client::{MockAgentFactory, MockIpamAgent};

    fn static_device(network: &str) -> NetworkDeviceSpec {
        NetworkDeviceSpec {
            network_name: network.to_string(),
            ..Default::default()
        }
    }

    fn setup(agent: &MockIpamAgent) -> (IpamService, Arc<MockMachineStore>, VSphereCluster) {
        let store = Arc::new(MockMachineStore::default());
        let cluster = test_cluster();
        store.add_cluster(&cluster);
        store.add_secret(
            NAMESPACE,
            IPAM_SECRET,
            &[(IPAM_CONFIG_SECRET_KEY, br#"{"url": "http://ipam.lab:8080"}"#.as_slice())],
        );
        let service = IpamService::new(Arc::new(MockAgentFactory::new(agent.clone())), store.clone());
        (service, store, cluster)
    }

    #[tokio::test]
    async fn devices_get_addresses_per_network_type() {
        let agent = MockIpamAgent::new();
        let (service, store, cluster) = setup(&agent);
        let machine = test_machine_with_devices(
            "m1",
            vec![static_device("VM Network"), static_device("Storage Network")],
        );
        store.add_machine(&machine);
        let events = RecordingEventPublisher::default();

        let devices = service.reconcile(&machine, &cluster, &events).await.unwrap().unwrap();

        assert_eq!(devices[0].ip_addrs, vec!["10.2.0.10/24"]);
        assert_eq!(devices[1].ip_addrs, vec!["10.3.0.11/24"]);
        assert_eq!(devices[0].gateway4.as_deref(), Some("10.0.0.1"));
        assert_eq!(devices[0].nameservers, vec!["10.0.0.2"]);
        assert_eq!(devices[0].search_domains, vec!["cluster.local"]);

        let stored = store.machine(NAMESPACE, "m1");
        let managed: ManagedAddresses =
            serde_json::from_str(&stored.annotations()[IPAM_MANAGED_ANNOTATION]).unwrap();
        assert_eq!(managed["workload"], vec!["10.2.0.10/24"]);
        assert_eq!(managed["data"], vec!["10.3.0.11/24"]);
        assert_eq!(stored.spec.network.devices, devices);
        assert_eq!(events.reasons(), vec![reasons::IP_ADDRESSES_RESERVED]);
    }

    #[tokio::test]
    async fn management_zone_draws_from_management_pool() {
        let agent = MockIpamAgent::new();
        let (service, store, mut cluster) = setup(&agent);
        cluster.spec.zone = Some(crds::MANAGEMENT_ZONE.to_string());
        let machine = test_machine_with_devices("m1", vec![static_device("VM Network")]);
        store.add_machine(&machine);

        service
            .reconcile(&machine, &cluster, &RecordingEventPublisher::default())
            .await
            .unwrap();
        assert_eq!(agent.leased(NetworkType::Management).len(), 1);
    }

    #[tokio::test]
    async fn dhcp_devices_need_no_agent() {
        let agent = MockIpamAgent::new();
        agent.set_unhealthy(true);
        let (service, _store, cluster) = setup(&agent);
        let machine = test_machine("m1");

        let result = service
            .reconcile(&machine, &cluster, &RecordingEventPublisher::default())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn unknown_network_is_a_validation_error() {
        let agent = MockIpamAgent::new();
        let (service, _store, cluster) = setup(&agent);
        let machine = test_machine_with_devices("m1", vec![static_device("Other Network")]);

        let err = service
            .reconcile(&machine, &cluster, &RecordingEventPublisher::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Validation(_)));
        assert!(agent.leased(NetworkType::Workload).is_empty());
    }

    #[tokio::test]
    async fn corrupt_annotation_releases_the_new_reservation() {
        let agent = MockIpamAgent::new();
        let (service, store, cluster) = setup(&agent);
        let mut machine = test_machine_with_devices("m1", vec![static_device("VM Network")]);
        machine
            .annotations_mut()
            .insert(IPAM_MANAGED_ANNOTATION.to_string(), "{not json".to_string());
        store.add_machine(&machine);

        let err = service
            .reconcile(&machine, &cluster, &RecordingEventPublisher::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ControllerError::Ipam(IpamError::Serialization(_))));
        assert_eq!(
            agent.releases(),
            vec![(NetworkType::Workload, vec!["10.2.0.10/24".to_string()])]
        );
        assert!(store.patches().is_empty());
    }

    #[tokio::test]
    async fn short_reservation_is_released() {
        let agent = MockIpamAgent::new();
        agent.short_change_next(1);
        let (service, store, cluster) = setup(&agent);
        let machine = test_machine_with_devices(
            "m1",
            vec![static_device("VM Network"), static_device("VM Network")],
        );
        store.add_machine(&machine);

        let err = service
            .reconcile(&machine, &cluster, &RecordingEventPublisher::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Ipam(IpamError::Exhausted(_))));
        assert_eq!(agent.releases().len(), 1);
        assert!(agent.leased(NetworkType::Workload).is_empty());
    }

    #[tokio::test]
    async fn failed_persist_releases_every_type() {
        let agent = MockIpamAgent::new();
        let (service, store, cluster) = setup(&agent);
        let machine = test_machine_with_devices(
            "m1",
            vec![static_device("VM Network"), static_device("Storage Network")],
        );
        store.add_machine(&machine);
        store.fail_next_patch();

        service
            .reconcile(&machine, &cluster, &RecordingEventPublisher::default())
            .await
            .unwrap_err();
        let released: Vec<NetworkType> = agent.releases().into_iter().map(|(t, _)| t).collect();
        assert_eq!(released, vec![NetworkType::Workload, NetworkType::Data]);
    }

    #[tokio::test]
    async fn release_without_annotation_is_a_noop() {
        let agent = MockIpamAgent::new();
        agent.set_unhealthy(true);
        let (service, store, cluster) = setup(&agent);
        let machine = test_machine("m1");

        service
            .release(&machine, &cluster, &RecordingEventPublisher::default())
            .await
            .unwrap();
        assert!(agent.releases().is_empty());
        assert!(store.patches().is_empty());
    }

    #[tokio::test]
    async fn release_returns_addresses_and_clears_annotation() {
        let agent = MockIpamAgent::new();
        let (service, store, cluster) = setup(&agent);
        let mut machine = test_machine("m1");
        machine.annotations_mut().insert(
            IPAM_MANAGED_ANNOTATION.to_string(),
            r#"{"data":["10.3.0.4/24"],"workload":["10.2.0.7/24"]}"#.to_string(),
        );
        store.add_machine(&machine);
        let events = RecordingEventPublisher::default();

        service.release(&machine, &cluster, &events).await.unwrap();

        assert_eq!(
            agent.releases(),
            vec![
                (NetworkType::Data, vec!["10.3.0.4/24".to_string()]),
                (NetworkType::Workload, vec!["10.2.0.7/24".to_string()]),
            ]
        );
        let stored = store.machine(NAMESPACE, "m1");
        assert!(!stored.annotations().contains_key(IPAM_MANAGED_ANNOTATION));
        assert_eq!(events.reasons(), vec![reasons::IP_ADDRESSES_RELEASED]);
    }
}
