//! IPAM client errors

use thiserror::Error;

/// Errors that can occur when talking to an IPAM agent
#[derive(Debug, Error)]
pub enum IpamError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Agent returned an error
    #[error("IPAM API error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Agent did not pass its health check
    #[error("IPAM agent health check failed: {0}")]
    HealthCheck(String),

    /// Pool has fewer free addresses than requested
    #[error("IPAM pool exhausted: {0}")]
    Exhausted(String),

    /// Configuration document is missing fields or malformed
    #[error("Invalid IPAM config: {0}")]
    InvalidConfig(String),
}
