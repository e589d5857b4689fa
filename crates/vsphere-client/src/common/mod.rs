//! Common utilities for the vSphere VI/JSON client
//!
//! Every managed object is addressed as
//! `{base}/sdk/vim25/{release}/{moType}/{moId}/{property|method}`.

use crate::error::VSphereError;
use crate::models::ManagedObjectReference;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Header carrying the authenticated session id
pub const SESSION_HEADER: &str = "vmware-api-session-id";

/// Default vim25 release used in request paths
pub const DEFAULT_RELEASE: &str = "8.0.1.0";

/// Fault body returned by the VI/JSON API on non-2xx responses
#[derive(Debug, Deserialize)]
struct FaultBody {
    #[serde(rename = "_typeName", default)]
    type_name: String,
    #[serde(default)]
    message: Option<String>,
}

/// HTTP client wrapper bound to one endpoint and session
pub struct HttpClient {
    client: Client,
    base_url: String,
    release: String,
    session_id: String,
}

impl HttpClient {
    /// Create a new HTTP client wrapper
    pub fn new(client: Client, base_url: String, release: String, session_id: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            release,
            session_id,
        }
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL of a property or method on a managed object
    pub fn object_url(&self, moref: &ManagedObjectReference, member: &str) -> String {
        format!(
            "{}/sdk/vim25/{}/{}/{}/{}",
            self.base_url, self.release, moref.type_, moref.value, member
        )
    }

    /// GET a property of a managed object
    pub async fn get_property<T: DeserializeOwned>(
        &self,
        moref: &ManagedObjectReference,
        property: &str,
    ) -> Result<T, VSphereError> {
        let url = self.object_url(moref, property);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .header(SESSION_HEADER, &self.session_id)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(map_transport_error)?;

        decode(response, &format!("GET {}/{}", moref, property)).await
    }

    /// POST a method invocation on a managed object
    pub async fn invoke<T: DeserializeOwned>(
        &self,
        moref: &ManagedObjectReference,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T, VSphereError> {
        let url = self.object_url(moref, method);
        debug!("POST {} with body: {}", url, body);

        let response = self
            .client
            .post(&url)
            .header(SESSION_HEADER, &self.session_id)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;

        decode(response, &format!("{} {}", method, moref)).await
    }

    /// POST a method that returns no value
    pub async fn invoke_void(
        &self,
        moref: &ManagedObjectReference,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<(), VSphereError> {
        let url = self.object_url(moref, method);
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .header(SESSION_HEADER, &self.session_id)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body_text = response.text().await.unwrap_or_default();
        Err(fault_to_error(status, &body_text, &format!("{} {}", method, moref)))
    }
}

/// Map connection failures to `EndpointUnreachable`
pub fn map_transport_error(e: reqwest::Error) -> VSphereError {
    if e.is_connect() || e.is_timeout() {
        VSphereError::EndpointUnreachable(e.to_string())
    } else {
        VSphereError::Http(e)
    }
}

async fn decode<T: DeserializeOwned>(
    response: reqwest::Response,
    context: &str,
) -> Result<T, VSphereError> {
    let status = response.status();
    let body_text = response.text().await.map_err(VSphereError::Http)?;

    if !status.is_success() {
        return Err(fault_to_error(status, &body_text, context));
    }

    // Methods returning nothing answer 204 with an empty body
    let body = if body_text.trim().is_empty() { "null" } else { body_text.as_str() };
    serde_json::from_str(body).map_err(|e| {
        VSphereError::Api(format!(
            "error decoding {} response: {} - Response (first 500 chars): {}",
            context,
            e,
            body.chars().take(500).collect::<String>()
        ))
    })
}

/// Translate a VI/JSON fault into a typed error
pub fn fault_to_error(status: StatusCode, body: &str, context: &str) -> VSphereError {
    let fault: Option<FaultBody> = serde_json::from_str(body).ok();
    let type_name = fault.as_ref().map_or("", |f| f.type_name.as_str());
    let message = fault
        .as_ref()
        .and_then(|f| f.message.clone())
        .unwrap_or_else(|| body.to_string());

    match (status, type_name) {
        (_, "ManagedObjectNotFound") | (StatusCode::NOT_FOUND, _) => {
            VSphereError::NotFound(format!("{}: {}", context, message))
        }
        (_, "InvalidLogin" | "NotAuthenticated") | (StatusCode::UNAUTHORIZED, _) => {
            VSphereError::Authentication(format!("{}: {}", context, message))
        }
        (_, "InvalidArgument" | "InvalidRequest") | (StatusCode::BAD_REQUEST, _) => {
            VSphereError::InvalidRequest(format!("{}: {}", context, message))
        }
        _ => VSphereError::Api(format!("{} failed: {} - {}", context, status, message)),
    }
}
