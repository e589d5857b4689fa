//! IPAM agent contract

use crate::error::IpamError;
use crate::models::*;

/// Agent leasing addresses from typed pools
#[async_trait::async_trait]
pub trait IpamAgent: Send + Sync {
    /// Lease addresses from the pool of one network type
    ///
    /// # Arguments
    /// * `network_type` - Pool to lease from
    /// * `ip_version` - Address family of the leases
    /// * `count` - Number of addresses wanted
    ///
    /// # Returns
    /// * `Ok(Vec<IpAddressReservation>)` - One entry per requested address
    /// * `Err(IpamError)` - The agent rejected the request or was unreachable
    async fn reserve(
        &self,
        network_type: NetworkType,
        ip_version: IpVersion,
        count: usize,
    ) -> Result<Vec<IpAddressReservation>, IpamError>;

    /// Return addresses to their pool
    async fn release(&self, network_type: NetworkType, addresses: &[String]) -> Result<(), IpamError>;

    async fn health_check(&self) -> Result<(), IpamError>;
}

/// Builds an agent from its configuration document
pub trait IpamAgentFactory: Send + Sync {
    fn agent(&self, config: &IpamConfig) -> Result<std::sync::Arc<dyn IpamAgent>, IpamError>;
}
