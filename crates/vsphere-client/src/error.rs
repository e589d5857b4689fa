//! Error types for the vSphere client

use thiserror::Error;

/// Errors that can occur when talking to a vSphere endpoint
#[derive(Debug, Error)]
pub enum VSphereError {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned a fault
    #[error("API error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Credentials were rejected
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Endpoint URL could not be parsed or connected to
    #[error("Endpoint unreachable: {0}")]
    EndpointUnreachable(String),

    /// Requested datacenter does not exist on the endpoint
    #[error("Datacenter not found: {0}")]
    DatacenterNotFound(String),

    /// Managed object not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request or ambiguous lookup
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl VSphereError {
    /// Whether the error is a transport-level failure worth retrying later
    pub fn is_transient(&self) -> bool {
        match self {
            VSphereError::EndpointUnreachable(_) => true,
            VSphereError::Http(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }
}
