//! cloud-init metadata
//!
//! The metadata document carries a netplan v2 network config keyed by the
//! adapters' MAC addresses. It is stored base64 encoded in the VM's extra
//! config and rewritten whenever the rendered form drifts from it.

use super::{task, MachineRequest, VmReconciler};
use crate::error::ControllerError;
use crate::reconcile_helpers::{ReconcileOutcome, OPERATION_INTERVAL};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crds::{NetworkDeviceSpec, NetworkRouteSpec, OperationKind, VSphereMachineSpec, VSphereMachineStatus};
use serde::{Serialize, Serializer};
use tracing::{debug, info};
use vsphere_client::{
    ManagedObjectReference, OptionValue, VirtualMachineConfigSpec, VirtualMachineProperties,
};

pub const GUESTINFO_METADATA: &str = "guestinfo.metadata";
pub const GUESTINFO_METADATA_ENCODING: &str = "guestinfo.metadata.encoding";
pub const GUESTINFO_USERDATA: &str = "guestinfo.userdata";
pub const GUESTINFO_USERDATA_ENCODING: &str = "guestinfo.userdata.encoding";
pub const BASE64_ENCODING: &str = "base64";

#[derive(Serialize)]
struct Metadata<'a> {
    #[serde(rename = "instance-id")]
    instance_id: &'a str,
    #[serde(rename = "local-hostname")]
    local_hostname: &'a str,
    #[serde(rename = "wait-on-network")]
    wait_on_network: WaitOnNetwork,
    network: Network,
}

#[derive(Serialize)]
struct WaitOnNetwork {
    ipv4: bool,
    ipv6: bool,
}

#[derive(Serialize)]
struct Network {
    version: u8,
    ethernets: Ethernets,
}

/// `id<N>` keyed adapters, serialized in configured order
struct Ethernets(Vec<(String, Ethernet)>);

impl Serialize for Ethernets {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(id, ethernet)| (id, ethernet)))
    }
}

#[derive(Serialize, Default)]
struct Ethernet {
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    mac_match: Option<MacMatch>,
    #[serde(rename = "set-name", skip_serializing_if = "Option::is_none")]
    set_name: Option<String>,
    dhcp4: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    dhcp6: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    addresses: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gateway4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gateway6: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nameservers: Option<Nameservers>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    routes: Vec<Route>,
}

#[derive(Serialize)]
struct MacMatch {
    macaddress: String,
}

#[derive(Serialize)]
struct Nameservers {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    addresses: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    search: Vec<String>,
}

#[derive(Serialize)]
struct Route {
    to: String,
    via: String,
    #[serde(skip_serializing_if = "is_zero")]
    metric: i32,
}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

impl From<&NetworkRouteSpec> for Route {
    fn from(route: &NetworkRouteSpec) -> Self {
        Self {
            to: route.to.clone(),
            via: route.via.clone(),
            metric: route.metric,
        }
    }
}

/// Whether the minimal single-adapter DHCP document suffices
///
/// Only a lone DHCPv4 adapter with no static addressing, gateways, routes or
/// name servers qualifies; anything else would be lost by the basic form.
pub fn is_basic(spec: &VSphereMachineSpec) -> bool {
    match spec.network.devices.as_slice() {
        [device] => {
            device.dhcp4
                && device.ip_addrs.is_empty()
                && device.gateway4.is_none()
                && device.gateway6.is_none()
                && device.routes.is_empty()
                && device.nameservers.is_empty()
                && device.search_domains.is_empty()
                && spec.network.routes.is_empty()
        }
        _ => false,
    }
}

/// Render the metadata document for `name`
///
/// Standalone hosts only take the basic form; pass `allow_full = false` to
/// reject anything richer.
pub fn render_metadata(
    name: &str,
    spec: &VSphereMachineSpec,
    allow_full: bool,
) -> Result<String, ControllerError> {
    let basic = is_basic(spec);
    if !basic && !allow_full {
        return Err(ControllerError::UnsupportedMetadata(format!(
            "{} network devices with static addressing, routes or name servers need vCenter; standalone hosts only support a single DHCP adapter",
            spec.network.devices.len()
        )));
    }

    let devices = &spec.network.devices;
    let ethernets = devices
        .iter()
        .enumerate()
        .map(|(index, device)| {
            let mut ethernet = if basic {
                basic_ethernet(device)
            } else {
                full_ethernet(device)
            };
            if let Some(mac) = device.mac_addr.as_deref().filter(|mac| !mac.is_empty()) {
                ethernet.mac_match = Some(MacMatch {
                    macaddress: mac.to_string(),
                });
                ethernet.set_name = Some(format!("eth{}", index));
            }
            if index == 0 && !basic {
                ethernet
                    .routes
                    .extend(spec.network.routes.iter().map(Route::from));
            }
            (format!("id{}", index), ethernet)
        })
        .collect();

    let metadata = Metadata {
        instance_id: name,
        local_hostname: name,
        wait_on_network: WaitOnNetwork {
            ipv4: devices.iter().any(|d| d.dhcp4 || has_family(d, false)),
            ipv6: devices.iter().any(|d| d.dhcp6 || has_family(d, true)),
        },
        network: Network {
            version: 2,
            ethernets: Ethernets(ethernets),
        },
    };

    serde_yaml::to_string(&metadata)
        .map_err(|e| ControllerError::UnsupportedMetadata(format!("failed to render metadata: {}", e)))
}

fn basic_ethernet(device: &NetworkDeviceSpec) -> Ethernet {
    Ethernet {
        dhcp4: true,
        dhcp6: device.dhcp6.then_some(true),
        ..Default::default()
    }
}

fn full_ethernet(device: &NetworkDeviceSpec) -> Ethernet {
    let nameservers = (!device.nameservers.is_empty() || !device.search_domains.is_empty())
        .then(|| Nameservers {
            addresses: device.nameservers.clone(),
            search: device.search_domains.clone(),
        });
    Ethernet {
        dhcp4: device.dhcp4,
        dhcp6: Some(device.dhcp6),
        addresses: device.ip_addrs.clone(),
        gateway4: device.gateway4.clone(),
        gateway6: device.gateway6.clone(),
        nameservers,
        routes: device.routes.iter().map(Route::from).collect(),
        ..Default::default()
    }
}

fn has_family(device: &NetworkDeviceSpec, ipv6: bool) -> bool {
    device
        .ip_addrs
        .iter()
        .any(|addr| addr.contains(':') == ipv6)
}

pub(super) fn metadata_config(rendered: &str) -> Vec<OptionValue> {
    vec![
        OptionValue::new(GUESTINFO_METADATA, BASE64.encode(rendered)),
        OptionValue::new(GUESTINFO_METADATA_ENCODING, BASE64_ENCODING),
    ]
}

/// Rewrite the stored metadata if it differs from the rendered document
pub(super) async fn reconcile_metadata(
    vm: &VmReconciler<'_>,
    req: &MachineRequest,
    spec: &VSphereMachineSpec,
    status: &mut VSphereMachineStatus,
    vm_ref: &ManagedObjectReference,
    props: &VirtualMachineProperties,
) -> Result<ReconcileOutcome, ControllerError> {
    let rendered = render_metadata(&req.name, spec, vm.session.is_vcenter())?;

    let stored = props
        .extra_config_value(GUESTINFO_METADATA)
        .map(|encoded| {
            BASE64.decode(encoded).map_err(|e| {
                ControllerError::Validation(format!(
                    "{} of VM {} is not valid base64: {}",
                    GUESTINFO_METADATA, vm_ref.value, e
                ))
            })
        })
        .transpose()?;

    if stored.as_deref() == Some(rendered.as_bytes()) {
        debug!("Metadata of {} is current", req.key);
        return Ok(ReconcileOutcome::Done);
    }

    info!("Metadata of {} changed, reconfiguring VM {}", req.key, vm_ref.value);
    let config = VirtualMachineConfigSpec {
        extra_config: metadata_config(&rendered),
        ..Default::default()
    };
    let task = vm.session.client().reconfigure_vm(vm_ref, &config).await?;
    task::record_submission(vm, req, status, &task, OperationKind::Reconfigure).await;
    Ok(ReconcileOutcome::RetryAfter(OPERATION_INTERVAL))
}
