//! Adapter status, MAC back-propagation and IP readiness

use crate::error::ControllerError;
use crate::reconcile_helpers::{ReconcileOutcome, WAIT_FOR_IP_INTERVAL};
use crds::{MachineAddress, MachineAddressType, NetworkStatus, VSphereMachineSpec, VSphereMachineStatus};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, info};
use vsphere_client::{VirtualMachinePowerState, VirtualMachineProperties};

/// Parse guest-reported addresses, dropping anything not routable
///
/// A `/prefix` suffix is accepted and stripped.
pub fn sanitize_ips(ips: &[String]) -> Vec<String> {
    ips.iter()
        .filter_map(|raw| {
            let addr = raw.split('/').next().unwrap_or(raw).trim();
            addr.parse::<IpAddr>().ok()
        })
        .filter(|ip| is_usable(*ip))
        .map(|ip| ip.to_string())
        .collect()
}

fn is_usable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !(v4.is_unspecified() || v4.is_loopback() || v4.is_link_local() || is_link_local_multicast_v4(v4)),
        IpAddr::V6(v6) => !(v6.is_unspecified() || v6.is_loopback() || is_link_local_v6(v6) || v6.segments()[0] == 0xff02),
    }
}

fn is_link_local_multicast_v4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    a == 224 && b == 0 && c == 0
}

fn is_link_local_v6(ip: Ipv6Addr) -> bool {
    ip.segments()[0] & 0xffc0 == 0xfe80
}

/// One entry per ethernet device, in device order
///
/// The guest NIC is matched by MAC; its network name wins over the backing's.
pub fn network_status(props: &VirtualMachineProperties) -> Vec<NetworkStatus> {
    props
        .ethernet_cards()
        .map(|nic| {
            let mac = nic.mac_address.clone().unwrap_or_default();
            let guest = props
                .guest_net
                .iter()
                .find(|g| !mac.is_empty() && g.mac_address.eq_ignore_ascii_case(&mac));
            let network_name = guest
                .map(|g| g.network.clone())
                .filter(|n| !n.is_empty())
                .or_else(|| nic.backing.as_ref().map(|b| b.device_name.clone()))
                .unwrap_or_default();

            NetworkStatus {
                connected: guest.is_some_and(|g| g.connected),
                ip_addrs: guest.map(|g| sanitize_ips(&g.ip_address)).unwrap_or_default(),
                mac_addr: mac,
                network_name,
            }
        })
        .collect()
}

/// Record adapter state and wait for addresses on a running VM
///
/// # Arguments
/// * `spec` - Each device takes the MAC its adapter reports
/// * `status` - Receives the observed adapters and the flattened addresses
/// * `props` - Fresh properties of the running VM
///
/// # Returns
/// `Done` when the VM is not powered on or every adapter reports an address,
/// otherwise a retry after the IP poll interval.
pub(super) fn reconcile_network(
    spec: &mut VSphereMachineSpec,
    status: &mut VSphereMachineStatus,
    props: &VirtualMachineProperties,
) -> Result<ReconcileOutcome, ControllerError> {
    let observed = network_status(props);
    if observed.len() != spec.network.devices.len() {
        return Err(ControllerError::NetworkCountMismatch {
            expected: spec.network.devices.len(),
            actual: observed.len(),
        });
    }

    for (device, nic) in spec.network.devices.iter_mut().zip(&observed) {
        if !nic.mac_addr.is_empty() && device.mac_addr.as_deref() != Some(nic.mac_addr.as_str()) {
            debug!("Adapter on {} has MAC {}", device.network_name, nic.mac_addr);
            device.mac_addr = Some(nic.mac_addr.clone());
        }
    }
    status.network = observed;

    if props.power_state != Some(VirtualMachinePowerState::PoweredOn) {
        status.addresses.clear();
        return Ok(ReconcileOutcome::Done);
    }

    status.addresses = status
        .network
        .iter()
        .flat_map(|nic| nic.ip_addrs.iter())
        .map(|ip| MachineAddress {
            address_type: MachineAddressType::InternalIp,
            address: ip.clone(),
        })
        .collect();

    if let Some(waiting) = status.network.iter().find(|nic| nic.ip_addrs.is_empty()) {
        info!("Waiting for adapter {} of {} to report an IP", waiting.mac_addr, props.name);
        return Ok(ReconcileOutcome::RetryAfter(WAIT_FOR_IP_INTERVAL));
    }
    Ok(ReconcileOutcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::NetworkDeviceSpec;
    use vsphere_client::{GuestNicInfo, VirtualDevice, VirtualEthernetCard};

    fn nic(key: i32, mac: &str) -> VirtualDevice {
        VirtualDevice::VirtualVmxnet3(VirtualEthernetCard {
            key,
            mac_address: Some(mac.to_string()),
            ..Default::default()
        })
    }

    fn guest(mac: &str, ips: &[&str]) -> GuestNicInfo {
        GuestNicInfo {
            mac_address: mac.to_string(),
            ip_address: ips.iter().map(|s| s.to_string()).collect(),
            network: "VM Network".to_string(),
            connected: true,
        }
    }

    fn spec_with(devices: usize) -> VSphereMachineSpec {
        let mut spec: VSphereMachineSpec = serde_json::from_value(serde_json::json!({
            "clusterName": "c1",
            "template": "ubuntu-template",
        }))
        .unwrap();
        spec.network.devices = (0..devices)
            .map(|_| NetworkDeviceSpec {
                network_name: "VM Network".to_string(),
                dhcp4: true,
                ..Default::default()
            })
            .collect();
        spec
    }

    #[test]
    fn test_sanitize_ips_drops_unroutable() {
        let ips: Vec<String> = [
            "10.1.0.10",
            "10.1.0.11/24",
            "127.0.0.1",
            "0.0.0.0",
            "169.254.3.4",
            "224.0.0.251",
            "fe80::1",
            "ff02::1",
            "::1",
            "2001:db8::5",
            "not-an-ip",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        assert_eq!(
            sanitize_ips(&ips),
            vec!["10.1.0.10", "10.1.0.11", "2001:db8::5"]
        );
    }

    #[test]
    fn test_network_status_matches_mac_case_insensitively() {
        let props = VirtualMachineProperties {
            devices: vec![nic(4000, "00:50:56:AA:BB:CC"), nic(4001, "00:50:56:aa:bb:cd")],
            guest_net: vec![guest("00:50:56:aa:bb:cc", &["10.1.0.10", "fe80::1"])],
            ..Default::default()
        };

        let status = network_status(&props);
        assert_eq!(status.len(), 2);
        assert!(status[0].connected);
        assert_eq!(status[0].ip_addrs, vec!["10.1.0.10"]);
        assert!(!status[1].connected);
        assert!(status[1].ip_addrs.is_empty());
    }

    #[test]
    fn test_reconcile_network_count_mismatch() {
        let mut spec = spec_with(2);
        let mut status = VSphereMachineStatus::default();
        let props = VirtualMachineProperties {
            devices: vec![nic(4000, "00:50:56:00:00:01")],
            ..Default::default()
        };

        let err = reconcile_network(&mut spec, &mut status, &props).unwrap_err();
        assert!(matches!(
            err,
            ControllerError::NetworkCountMismatch {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn test_reconcile_network_back_propagates_mac_and_skips_ip_wait_when_off() {
        let mut spec = spec_with(1);
        let mut status = VSphereMachineStatus::default();
        let props = VirtualMachineProperties {
            devices: vec![nic(4000, "00:50:56:00:00:01")],
            power_state: Some(VirtualMachinePowerState::PoweredOff),
            ..Default::default()
        };

        let outcome = reconcile_network(&mut spec, &mut status, &props).unwrap();
        assert!(outcome.is_done());
        assert_eq!(
            spec.network.devices[0].mac_addr.as_deref(),
            Some("00:50:56:00:00:01")
        );
        assert_eq!(status.network.len(), 1);
        assert!(status.addresses.is_empty());
    }

    #[test]
    fn test_reconcile_network_waits_for_every_adapter() {
        let mut spec = spec_with(2);
        let mut status = VSphereMachineStatus::default();
        let mut props = VirtualMachineProperties {
            devices: vec![nic(4000, "00:50:56:00:00:01"), nic(4001, "00:50:56:00:00:02")],
            guest_net: vec![guest("00:50:56:00:00:01", &["10.1.0.10"])],
            power_state: Some(VirtualMachinePowerState::PoweredOn),
            ..Default::default()
        };

        let outcome = reconcile_network(&mut spec, &mut status, &props).unwrap();
        assert_eq!(outcome, ReconcileOutcome::RetryAfter(WAIT_FOR_IP_INTERVAL));

        props.guest_net.push(guest("00:50:56:00:00:02", &["10.2.0.11"]));
        let outcome = reconcile_network(&mut spec, &mut status, &props).unwrap();
        assert!(outcome.is_done());
        let addresses: Vec<&str> = status.addresses.iter().map(|a| a.address.as_str()).collect();
        assert_eq!(addresses, vec!["10.1.0.10", "10.2.0.11"]);
        assert!(status
            .addresses
            .iter()
            .all(|a| a.address_type == MachineAddressType::InternalIp));
    }
}
