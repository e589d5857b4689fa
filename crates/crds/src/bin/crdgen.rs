//! Print the CRD manifests as a multi-document YAML stream

use crds::{VSphereCluster, VSphereMachine};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&VSphereCluster::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&VSphereMachine::crd())?);
    Ok(())
}
