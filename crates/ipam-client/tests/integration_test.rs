//! Integration tests for the IPAM agent client
//!
//! These tests require a running IPAM agent.
//! Set IPAM_URL (and IPAM_TOKEN if the agent needs one) to run.

use ipam_client::{IpVersion, IpamAgent, IpamConfig, IpamHttpClient, NetworkType};

fn client_from_env() -> IpamHttpClient {
    let config = IpamConfig {
        url: std::env::var("IPAM_URL").unwrap_or_else(|_| "http://localhost:8080".to_string()),
        token: std::env::var("IPAM_TOKEN").ok(),
        timeout_seconds: 10,
    };
    IpamHttpClient::new(&config).expect("Failed to create client")
}

#[tokio::test]
#[ignore] // Requires running IPAM agent
async fn test_health_check() {
    let client = client_from_env();
    client.health_check().await.expect("health check failed");
}

#[tokio::test]
#[ignore]
async fn test_reserve_and_release() {
    let client = client_from_env();

    let reservations = client
        .reserve(NetworkType::Workload, IpVersion::IPv4, 2)
        .await
        .expect("Failed to reserve addresses");
    assert_eq!(reservations.len(), 2);

    let addresses: Vec<String> = reservations.iter().map(|r| r.address.clone()).collect();
    println!("Reserved {:?}", addresses);

    client
        .release(NetworkType::Workload, &addresses)
        .await
        .expect("Failed to release addresses");
}
