//! Mock IPAM agent for unit testing
//!
//! Hands out sequential addresses per network type and records every release.

use crate::error::IpamError;
use crate::ipam_trait::{IpamAgent, IpamAgentFactory};
use crate::models::*;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Mock IPAM agent for testing
#[derive(Debug, Clone, Default)]
pub struct MockIpamAgent {
    leased: Arc<Mutex<HashMap<NetworkType, Vec<String>>>>,
    releases: Arc<Mutex<Vec<(NetworkType, Vec<String>)>>>,
    network_config: Arc<Mutex<NetworkConfig>>,
    next_host: Arc<Mutex<u8>>,
    failures: Arc<Mutex<HashSet<String>>>,
    short_by: Arc<Mutex<usize>>,
    unhealthy: Arc<Mutex<bool>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockIpamAgent {
    pub fn new() -> Self {
        Self {
            next_host: Arc::new(Mutex::new(10)),
            network_config: Arc::new(Mutex::new(NetworkConfig {
                name_servers: vec!["10.0.0.2".to_string()],
                default_gateway: Some("10.0.0.1".to_string()),
                domain_search: vec!["cluster.local".to_string()],
            })),
            ..Default::default()
        }
    }

    /// Network settings attached to every reservation
    pub fn set_network_config(&self, config: NetworkConfig) {
        *lock(&self.network_config) = config;
    }

    /// Make the next `op` ("reserve", "release", "health_check") fail
    pub fn fail_next(&self, op: &str) {
        lock(&self.failures).insert(op.to_string());
    }

    /// Return `n` fewer reservations than requested on the next reserve
    pub fn short_change_next(&self, n: usize) {
        *lock(&self.short_by) = n;
    }

    pub fn set_unhealthy(&self, unhealthy: bool) {
        *lock(&self.unhealthy) = unhealthy;
    }

    /// Addresses currently leased for `network_type`
    pub fn leased(&self, network_type: NetworkType) -> Vec<String> {
        lock(&self.leased).get(&network_type).cloned().unwrap_or_default()
    }

    /// Every release call, in order
    pub fn releases(&self) -> Vec<(NetworkType, Vec<String>)> {
        lock(&self.releases).clone()
    }

    fn take_failure(&self, op: &str) -> Result<(), IpamError> {
        if lock(&self.failures).remove(op) {
            Err(IpamError::Api(format!("injected {} failure", op)))
        } else {
            Ok(())
        }
    }

    fn subnet(network_type: NetworkType) -> u8 {
        match network_type {
            NetworkType::Management => 1,
            NetworkType::Workload => 2,
            NetworkType::Data => 3,
        }
    }
}

#[async_trait::async_trait]
impl IpamAgent for MockIpamAgent {
    async fn reserve(
        &self,
        network_type: NetworkType,
        _ip_version: IpVersion,
        count: usize,
    ) -> Result<Vec<IpAddressReservation>, IpamError> {
        self.take_failure("reserve")?;
        let count = count.saturating_sub(std::mem::take(&mut *lock(&self.short_by)));
        let config = lock(&self.network_config).clone();

        let mut reservations = Vec::with_capacity(count);
        for _ in 0..count {
            let host = {
                let mut next = lock(&self.next_host);
                let host = *next;
                *next = next.wrapping_add(1);
                host
            };
            let address = format!("10.{}.0.{}/24", Self::subnet(network_type), host);
            lock(&self.leased).entry(network_type).or_default().push(address.clone());
            reservations.push(IpAddressReservation {
                address,
                network_config: config.clone(),
            });
        }
        Ok(reservations)
    }

    async fn release(&self, network_type: NetworkType, addresses: &[String]) -> Result<(), IpamError> {
        self.take_failure("release")?;
        if let Some(leased) = lock(&self.leased).get_mut(&network_type) {
            leased.retain(|a| !addresses.contains(a));
        }
        lock(&self.releases).push((network_type, addresses.to_vec()));
        Ok(())
    }

    async fn health_check(&self) -> Result<(), IpamError> {
        self.take_failure("health_check")?;
        if *lock(&self.unhealthy) {
            return Err(IpamError::HealthCheck("mock agent marked unhealthy".to_string()));
        }
        Ok(())
    }
}

/// Factory that always returns the same mock agent
#[derive(Debug, Clone, Default)]
pub struct MockAgentFactory {
    pub agent: MockIpamAgent,
    configs: Arc<Mutex<Vec<IpamConfig>>>,
}

impl MockAgentFactory {
    pub fn new(agent: MockIpamAgent) -> Self {
        Self {
            agent,
            configs: Arc::default(),
        }
    }

    /// Configurations agents were built from
    pub fn configs(&self) -> Vec<IpamConfig> {
        lock(&self.configs).clone()
    }
}

impl IpamAgentFactory for MockAgentFactory {
    fn agent(&self, config: &IpamConfig) -> Result<Arc<dyn IpamAgent>, IpamError> {
        lock(&self.configs).push(config.clone());
        Ok(Arc::new(self.agent.clone()))
    }
}
