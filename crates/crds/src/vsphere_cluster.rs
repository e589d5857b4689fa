//! VSphereCluster CRD
//!
//! Endpoint, credentials and placement shared by the machines of a cluster.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation naming the Secret with the IPAM configuration
pub const IPAM_CONFIG_SECRET_NAME_ANNOTATION: &str = "ipam-config-secret-name";

/// Annotation naming the namespace of the IPAM configuration Secret
pub const IPAM_CONFIG_SECRET_NAMESPACE_ANNOTATION: &str = "ipam-config-secret-namespace";

/// Key of the IPAM configuration document in its Secret
pub const IPAM_CONFIG_SECRET_KEY: &str = "config.json";

/// Zone whose primary networks lease from the management pool
pub const MANAGEMENT_ZONE: &str = "management";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.vsphere.microscaler.io",
    version = "v1alpha1",
    kind = "VSphereCluster",
    namespaced,
    status = "VSphereClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VSphereClusterSpec {
    /// vCenter or ESXi host, as a host name or URL
    pub server: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,

    /// Skip TLS certificate verification
    #[serde(default)]
    pub insecure: bool,

    /// SHA-1 or SHA-256 fingerprint of the server certificate; when set only
    /// that certificate is accepted, regardless of `insecure`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbprint: Option<String>,

    /// Secret with `username` and `password` keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,

    /// SSH port of standalone hosts
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

fn default_ssh_port() -> u16 {
    22
}

impl VSphereClusterSpec {
    pub fn is_management_zone(&self) -> bool {
        self.zone.as_deref() == Some(MANAGEMENT_ZONE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VSphereClusterStatus {
    #[serde(default)]
    pub ready: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_port_defaults_to_22() {
        let spec: VSphereClusterSpec =
            serde_json::from_value(serde_json::json!({"server": "vc.example.com"})).unwrap();
        assert_eq!(spec.ssh_port, 22);
        assert!(!spec.insecure);
        assert!(spec.thumbprint.is_none());
        assert!(!spec.is_management_zone());
    }
}
