//! HTTP IPAM agent
//!
//! Talks to the agent's REST API:
//! `GET /health`, `POST /api/v1/reservations`, `POST /api/v1/releases`.

use crate::error::IpamError;
use crate::ipam_trait::{IpamAgent, IpamAgentFactory};
use crate::models::*;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// IPAM agent client
pub struct IpamHttpClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl std::fmt::Debug for IpamHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpamHttpClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl IpamHttpClient {
    /// Create a client from a parsed configuration document
    ///
    /// # Arguments
    /// * `config` - Agent endpoint and request timeout
    pub fn new(config: &IpamConfig) -> Result<Self, IpamError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(IpamError::Http)?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);
        let builder = self
            .client
            .request(method, &url)
            .header("Accept", "application/json");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, IpamError> {
        let response = self
            .request(reqwest::Method::POST, path)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(error_for_status(status, &text));
        }

        let body = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(body).map_err(|e| {
            IpamError::Api(format!(
                "error decoding response body: {} - Response (first 500 chars): {}",
                e,
                body.chars().take(500).collect::<String>()
            ))
        })
    }
}

fn error_for_status(status: StatusCode, body: &str) -> IpamError {
    match status {
        StatusCode::CONFLICT | StatusCode::INSUFFICIENT_STORAGE => IpamError::Exhausted(body.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            IpamError::Api(format!("Invalid token: {} - {}", status, body))
        }
        _ => IpamError::Api(format!("{} - {}", status, body)),
    }
}

#[async_trait::async_trait]
impl IpamAgent for IpamHttpClient {
    async fn reserve(
        &self,
        network_type: NetworkType,
        ip_version: IpVersion,
        count: usize,
    ) -> Result<Vec<IpAddressReservation>, IpamError> {
        let request = ReserveRequest {
            network_type,
            ip_version,
            count,
        };
        let reservations: Vec<IpAddressReservation> = self.post("/api/v1/reservations", &request).await?;
        if reservations.len() < count {
            return Err(IpamError::Exhausted(format!(
                "requested {} {} addresses, agent returned {}",
                count,
                network_type,
                reservations.len()
            )));
        }
        Ok(reservations)
    }

    async fn release(&self, network_type: NetworkType, addresses: &[String]) -> Result<(), IpamError> {
        let request = ReleaseRequest {
            network_type,
            addresses,
        };
        let _: serde_json::Value = self.post("/api/v1/releases", &request).await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), IpamError> {
        let response = self
            .request(reqwest::Method::GET, "/health")
            .send()
            .await
            .map_err(|e| IpamError::HealthCheck(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IpamError::HealthCheck(format!("{} - {}", status, body)));
        }
        Ok(())
    }
}

/// Factory producing `IpamHttpClient` agents
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpAgentFactory;

impl IpamAgentFactory for HttpAgentFactory {
    fn agent(&self, config: &IpamConfig) -> Result<Arc<dyn IpamAgent>, IpamError> {
        Ok(Arc::new(IpamHttpClient::new(config)?))
    }
}
