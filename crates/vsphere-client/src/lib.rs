//! vSphere VI/JSON API Client
//!
//! A small client for the vim25 JSON API exposed by vCenter and ESXi 8.
//! It covers the calls needed to provision a single virtual machine:
//! inventory lookups, clone/create/reconfigure/power/destroy tasks, task
//! polling and session management.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use vsphere_client::{ConnectParams, VSphereClient, VSphereClientTrait};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let params = ConnectParams {
//!     server: "vcenter.example.com".to_string(),
//!     username: "administrator@vsphere.local".to_string(),
//!     password: "secret".to_string(),
//!     insecure: false,
//!     thumbprint: None,
//! };
//! let client = VSphereClient::login(&params, Duration::from_secs(30)).await?;
//!
//! // Resolve a template and read its hardware
//! if let Some(template) = client.find_by_inventory_path("/dc1/vm/templates/ubuntu").await? {
//!     let props = client.vm_properties(&template).await?;
//!     println!("{} has {} disks", props.name, props.disks().count());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Sessions**: login, liveness check and logout
//! - **Pinning**: optional server certificate thumbprint instead of CA trust
//! - **Tasks**: every mutation returns a `Task` reference to poll
//! - **test-util**: in-memory `MockVSphereClient` and `MockConnector`

pub mod client;
pub mod common;
pub mod error;
pub mod models;
pub mod tls;
#[path = "trait.rs"]
pub mod vsphere_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::{RestConnector, VSphereClient};
pub use common::HttpClient;
pub use error::VSphereError;
pub use models::*;
pub use vsphere_trait::{VSphereClientTrait, VSphereConnector};
#[cfg(feature = "test-util")]
pub use mock::{MockCall, MockConnector, MockVSphereClient};
