//! IPAM Agent Client
//!
//! Leases static addresses for machine network adapters from an external
//! IP address management agent. Addresses come from one of three pools
//! (management, workload, data) and carry the gateway, name servers and
//! search domains the adapter should use.
//!
//! # Example
//!
//! ```no_run
//! use ipam_client::{IpVersion, IpamAgent, IpamConfig, IpamHttpClient, NetworkType};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = IpamConfig::from_json(br#"{"url": "http://ipam:8080", "token": "t"}"#)?;
//! let agent = IpamHttpClient::new(&config)?;
//! agent.health_check().await?;
//!
//! let reservations = agent.reserve(NetworkType::Workload, IpVersion::IPv4, 2).await?;
//! let addresses: Vec<String> = reservations.iter().map(|r| r.address.clone()).collect();
//! agent.release(NetworkType::Workload, &addresses).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod ipam_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::{HttpAgentFactory, IpamHttpClient};
pub use error::IpamError;
pub use models::*;
pub use ipam_trait::{IpamAgent, IpamAgentFactory};
#[cfg(feature = "test-util")]
pub use mock::{MockAgentFactory, MockIpamAgent};
