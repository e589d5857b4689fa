//! vSphere Machine CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the vSphere machine controller.

pub mod vsphere_cluster;
pub mod vsphere_machine;

pub use vsphere_cluster::*;
pub use vsphere_machine::*;
