//! Mock connector handing out sessions to registered endpoints

use super::{lock, MockVSphereClient};
use crate::error::VSphereError;
use crate::models::ConnectParams;
use crate::vsphere_trait::{VSphereClientTrait, VSphereConnector};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Connector backed by in-memory endpoints
///
/// Every successful `connect` returns a fresh session sharing the endpoint's
/// inventory, so tests can count logins and kill individual sessions.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    endpoints: Arc<Mutex<HashMap<String, MockVSphereClient>>>,
    credentials: Arc<Mutex<HashMap<String, (String, String)>>>,
    sessions: Arc<Mutex<Vec<MockVSphereClient>>>,
    attempts: Arc<Mutex<Vec<ConnectParams>>>,
    connects: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `client` for `server`, accepting any credentials
    pub fn add_endpoint(&self, server: &str, client: MockVSphereClient) {
        lock(&self.endpoints).insert(server.to_string(), client);
    }

    /// Only accept the given username and password for `server`
    pub fn require_credentials(&self, server: &str, username: &str, password: &str) {
        lock(&self.credentials).insert(
            server.to_string(),
            (username.to_string(), password.to_string()),
        );
    }

    /// Number of successful logins
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Parameters of every connect call, successful or not
    pub fn attempts(&self) -> Vec<ConnectParams> {
        lock(&self.attempts).clone()
    }

    /// Sessions handed out so far, oldest first
    pub fn sessions(&self) -> Vec<MockVSphereClient> {
        lock(&self.sessions).clone()
    }
}

#[async_trait::async_trait]
impl VSphereConnector for MockConnector {
    async fn connect(
        &self,
        params: &ConnectParams,
    ) -> Result<Arc<dyn VSphereClientTrait>, VSphereError> {
        lock(&self.attempts).push(params.clone());
        let endpoint = lock(&self.endpoints)
            .get(&params.server)
            .cloned()
            .ok_or_else(|| {
                VSphereError::EndpointUnreachable(format!("no route to {}", params.server))
            })?;

        if let Some((username, password)) = lock(&self.credentials).get(&params.server)
            && (username != &params.username || password != &params.password)
        {
            return Err(VSphereError::Authentication(format!(
                "Cannot complete login due to an incorrect user name or password for {}",
                params.server
            )));
        }

        let session = endpoint.reconnected();
        lock(&self.sessions).push(session.clone());
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(session))
    }
}
