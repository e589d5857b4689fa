//! Integration tests for the vSphere client
//!
//! These tests require a reachable vCenter or ESXi endpoint.
//! Set VSPHERE_SERVER, VSPHERE_USERNAME and VSPHERE_PASSWORD to run them;
//! VSPHERE_DATACENTER and VSPHERE_TEMPLATE enable the inventory tests.

use std::time::Duration;
use vsphere_client::{ConnectParams, VSphereClient, VSphereClientTrait, VSphereError};

fn params_from_env() -> ConnectParams {
    ConnectParams {
        server: std::env::var("VSPHERE_SERVER").expect("VSPHERE_SERVER must be set"),
        username: std::env::var("VSPHERE_USERNAME").expect("VSPHERE_USERNAME must be set"),
        password: std::env::var("VSPHERE_PASSWORD").expect("VSPHERE_PASSWORD must be set"),
        insecure: std::env::var("VSPHERE_INSECURE").is_ok_and(|v| v == "true"),
        thumbprint: std::env::var("VSPHERE_THUMBPRINT").ok(),
    }
}

#[tokio::test]
#[ignore] // Requires a running vSphere endpoint
async fn test_login_and_logout() {
    let client = VSphereClient::login(&params_from_env(), Duration::from_secs(30))
        .await
        .expect("login failed");

    assert!(client.session_is_active().await.expect("liveness check failed"));

    let about = client.about().await.expect("about failed");
    println!("Connected to {} ({})", about.full_name, about.api_type);

    client.logout().await.expect("logout failed");
}

#[tokio::test]
#[ignore]
async fn test_bad_password_is_authentication_error() {
    let mut params = params_from_env();
    params.password = "definitely-not-the-password".to_string();

    let err = VSphereClient::login(&params, Duration::from_secs(30))
        .await
        .expect_err("login should fail");
    assert!(matches!(err, VSphereError::Authentication(_)), "got {err:?}");
}

#[tokio::test]
#[ignore]
async fn test_unreachable_endpoint() {
    let params = ConnectParams {
        server: "127.0.0.1:1".to_string(),
        username: "user".to_string(),
        password: "pass".to_string(),
        insecure: true,
        thumbprint: None,
    };

    let err = VSphereClient::login(&params, Duration::from_secs(5))
        .await
        .expect_err("login should fail");
    assert!(err.is_transient(), "got {err:?}");
}

#[tokio::test]
#[ignore]
async fn test_template_lookup() {
    let datacenter = std::env::var("VSPHERE_DATACENTER").expect("VSPHERE_DATACENTER must be set");
    let template = std::env::var("VSPHERE_TEMPLATE").expect("VSPHERE_TEMPLATE must be set");

    let client = VSphereClient::login(&params_from_env(), Duration::from_secs(30))
        .await
        .expect("login failed");

    let path = format!("/{}/vm/{}", datacenter, template);
    let vm = client
        .find_by_inventory_path(&path)
        .await
        .expect("lookup failed")
        .expect("template not found");

    let props = client.vm_properties(&vm).await.expect("properties failed");
    println!(
        "Template {} has {} disks and {} NICs",
        props.name,
        props.disks().count(),
        props.ethernet_cards().count()
    );

    client.logout().await.expect("logout failed");
}
