//! IPAM agent data models

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::IpamError;

/// Address pool classification
///
/// Primary-network adapters draw from `Management` in the management zone and
/// from `Workload` elsewhere; storage-network adapters draw from `Data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Management,
    Workload,
    Data,
}

impl NetworkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Management => "management",
            NetworkType::Workload => "workload",
            NetworkType::Data => "data",
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkType {
    type Err = IpamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "management" => Ok(NetworkType::Management),
            "workload" => Ok(NetworkType::Workload),
            "data" => Ok(NetworkType::Data),
            other => Err(IpamError::InvalidConfig(format!("unknown network type {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpVersion {
    #[serde(rename = "ipv4")]
    IPv4,
    #[serde(rename = "ipv6")]
    IPv6,
}

/// Network settings handed out with a reservation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    #[serde(default)]
    pub name_servers: Vec<String>,
    #[serde(default)]
    pub default_gateway: Option<String>,
    #[serde(default)]
    pub domain_search: Vec<String>,
}

/// One leased address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpAddressReservation {
    /// Address in CIDR form, e.g. `10.0.0.5/24`
    pub address: String,
    #[serde(default)]
    pub network_config: NetworkConfig,
}

/// Agent configuration, stored as `config.json` in a Secret
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamConfig {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "IpamConfig::default_timeout")]
    pub timeout_seconds: u64,
}

impl IpamConfig {
    fn default_timeout() -> u64 {
        30
    }

    /// Parse and validate a `config.json` document
    pub fn from_json(bytes: &[u8]) -> Result<Self, IpamError> {
        let config: IpamConfig = serde_json::from_slice(bytes)
            .map_err(|e| IpamError::InvalidConfig(format!("could not unmarshal ipam config: {}", e)))?;
        if config.url.trim().is_empty() {
            return Err(IpamError::InvalidConfig("url must not be empty".to_string()));
        }
        Ok(config)
    }
}

impl fmt::Debug for IpamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpamConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

/// Body of a reservation request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    pub network_type: NetworkType,
    pub ip_version: IpVersion,
    pub count: usize,
}

/// Body of a release request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest<'a> {
    pub network_type: NetworkType,
    pub addresses: &'a [String],
}

/// Addresses of a batch of reservations, in order
pub fn reservation_addresses(reservations: &[IpAddressReservation]) -> Vec<String> {
    reservations.iter().map(|r| r.address.clone()).collect()
}
