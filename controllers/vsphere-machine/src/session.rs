//! vSphere session cache
//!
//! A [`SessionCache`] is created once at startup and shared by every
//! reconcile. Sessions are keyed by (server, username, datacenter); the cache
//! map lock is held only for lookup and insert, never across a network call,
//! so one slow login cannot stall reconciles against other endpoints.
//!
//! A cached session is checked for liveness before it is handed out. A session
//! the server no longer recognises is logged out on a best-effort basis and
//! replaced. A check that fails for any other reason is returned to the caller
//! and the entry is kept for the next attempt.

use crate::metrics;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use vsphere_client::{
    moref_type, AboutInfo, ConnectParams, DatacenterInfo, ManagedObjectReference, VSphereClientTrait,
    VSphereConnector, VSphereError,
};

/// Connection parameters for one endpoint/identity/datacenter
#[derive(Clone, PartialEq, Eq)]
pub struct SessionParams {
    server: String,
    username: String,
    password: String,
    datacenter: Option<String>,
    insecure: bool,
    thumbprint: Option<String>,
}

impl fmt::Debug for SessionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionParams")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("datacenter", &self.datacenter)
            .field("insecure", &self.insecure)
            .field("thumbprint", &self.thumbprint)
            .finish()
    }
}

impl SessionParams {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            username: String::new(),
            password: String::new(),
            datacenter: None,
            insecure: false,
            thumbprint: None,
        }
    }

    #[must_use]
    pub fn with_user_info(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    #[must_use]
    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    #[must_use]
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Pin the server certificate to this SHA-1 or SHA-256 fingerprint
    #[must_use]
    pub fn with_thumbprint(mut self, thumbprint: impl Into<String>) -> Self {
        self.thumbprint = Some(thumbprint.into()).filter(|t: &String| !t.is_empty());
        self
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Cache identity; never contains the password
    ///
    /// A pinned thumbprint is part of the identity, so re-pinning a server
    /// opens a new session instead of reusing one made under the old pin.
    pub fn cache_key(&self) -> String {
        let mut key = format!(
            "{}#{}#{}",
            self.server,
            self.username,
            self.datacenter.as_deref().unwrap_or_default()
        );
        if let Some(thumbprint) = &self.thumbprint {
            key.push('#');
            key.push_str(thumbprint);
        }
        key
    }

    fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            server: self.server.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            insecure: self.insecure,
            thumbprint: self.thumbprint.clone(),
        }
    }
}

/// Authenticated connection bound to one datacenter
pub struct Session {
    client: Arc<dyn VSphereClientTrait>,
    about: AboutInfo,
    finder: Finder,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("server", &self.client.server())
            .field("api_type", &self.about.api_type)
            .field("datacenter", &self.finder.datacenter_name())
            .finish()
    }
}

impl Session {
    pub fn client(&self) -> &dyn VSphereClientTrait {
        self.client.as_ref()
    }

    pub fn finder(&self) -> &Finder {
        &self.finder
    }

    pub fn about(&self) -> &AboutInfo {
        &self.about
    }

    /// Whether the endpoint supports server-side cloning
    pub fn is_vcenter(&self) -> bool {
        self.about.is_vcenter()
    }

    /// `Ok(false)` only when the server no longer knows the session
    async fn is_alive(&self) -> Result<bool, VSphereError> {
        match self.client.session_is_active().await {
            Ok(active) => Ok(active),
            Err(VSphereError::Authentication(e)) => {
                debug!("Session on {} is not authenticated: {}", self.client.server(), e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// Inventory lookups scoped to one datacenter
///
/// Relative names are resolved under the datacenter's standard folders
/// (`vm`, `datastore`, `network`, `host`); names starting with `/` are taken
/// as full inventory paths.
pub struct Finder {
    client: Arc<dyn VSphereClientTrait>,
    datacenter: ManagedObjectReference,
    info: DatacenterInfo,
}

impl fmt::Debug for Finder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finder")
            .field("datacenter", &self.datacenter)
            .field("name", &self.info.name)
            .finish()
    }
}

impl Finder {
    /// Resolve the named datacenter, or the only datacenter when none is named
    pub async fn datacenter_or_default(
        client: &dyn VSphereClientTrait,
        name: Option<&str>,
    ) -> Result<ManagedObjectReference, VSphereError> {
        if let Some(name) = name {
            let path = if name.starts_with('/') {
                name.to_string()
            } else {
                format!("/{}", name)
            };
            return match client.find_by_inventory_path(&path).await? {
                Some(dc) if dc.is_type(moref_type::DATACENTER) => Ok(dc),
                _ => Err(VSphereError::DatacenterNotFound(name.to_string())),
            };
        }

        let mut datacenters: Vec<ManagedObjectReference> = client
            .child_entities(None)
            .await?
            .into_iter()
            .filter(|child| child.is_type(moref_type::DATACENTER))
            .collect();
        match datacenters.len() {
            0 => Err(VSphereError::DatacenterNotFound(
                "no datacenter found on endpoint".to_string(),
            )),
            1 => Ok(datacenters.remove(0)),
            n => Err(VSphereError::InvalidRequest(format!(
                "default datacenter resolves to {} datacenters, please specify one",
                n
            ))),
        }
    }

    pub fn datacenter(&self) -> &ManagedObjectReference {
        &self.datacenter
    }

    pub fn datacenter_name(&self) -> &str {
        &self.info.name
    }

    fn path(&self, folder: &str, name: &str) -> String {
        if name.starts_with('/') {
            name.to_string()
        } else {
            format!("/{}/{}/{}", self.info.name, folder, name)
        }
    }

    async fn require(&self, what: &str, path: String) -> Result<ManagedObjectReference, VSphereError> {
        self.client
            .find_by_inventory_path(&path)
            .await?
            .ok_or_else(|| VSphereError::NotFound(format!("{} {} not found", what, path)))
    }

    /// Named VM folder, or the datacenter's root VM folder
    pub async fn folder_or_default(&self, name: Option<&str>) -> Result<ManagedObjectReference, VSphereError> {
        match name {
            Some(name) => self.require("folder", self.path("vm", name)).await,
            None => Ok(self.info.vm_folder.clone()),
        }
    }

    /// Named datastore, or the datacenter's only datastore
    pub async fn datastore_or_default(
        &self,
        name: Option<&str>,
    ) -> Result<ManagedObjectReference, VSphereError> {
        if let Some(name) = name {
            return self.require("datastore", self.path("datastore", name)).await;
        }
        match self.info.datastore.as_slice() {
            [only] => Ok(only.clone()),
            [] => Err(VSphereError::NotFound(format!(
                "no datastore found in datacenter {}",
                self.info.name
            ))),
            many => Err(VSphereError::InvalidRequest(format!(
                "default datastore resolves to {} datastores in datacenter {}, please specify one",
                many.len(),
                self.info.name
            ))),
        }
    }

    /// Named pool, or the root pool of the datacenter's only compute resource
    pub async fn resource_pool_or_default(
        &self,
        name: Option<&str>,
    ) -> Result<ManagedObjectReference, VSphereError> {
        if let Some(name) = name {
            return self
                .resource_pool(name, None)
                .await?
                .ok_or_else(|| VSphereError::NotFound(format!("resource pool {} not found", name)));
        }

        let mut computes: Vec<ManagedObjectReference> = self
            .client
            .child_entities(Some(&self.info.host_folder))
            .await?
            .into_iter()
            .filter(|child| {
                child.is_type(moref_type::COMPUTE_RESOURCE)
                    || child.is_type(moref_type::CLUSTER_COMPUTE_RESOURCE)
            })
            .collect();
        match computes.len() {
            0 => Err(VSphereError::NotFound(format!(
                "no compute resource found in datacenter {}",
                self.info.name
            ))),
            1 => self.client.compute_resource_pool(&computes.remove(0)).await,
            n => Err(VSphereError::InvalidRequest(format!(
                "default resource pool resolves to {} compute resources, please specify one",
                n
            ))),
        }
    }

    /// Look up a resource pool by path or name
    ///
    /// A relative name is tried directly under the host folder and then
    /// under the root pool of `compute_resource`, when one is given.
    pub async fn resource_pool(
        &self,
        name: &str,
        compute_resource: Option<&str>,
    ) -> Result<Option<ManagedObjectReference>, VSphereError> {
        let mut candidates = vec![self.path("host", name)];
        if !name.starts_with('/')
            && let Some(compute) = compute_resource
        {
            candidates.push(format!("/{}/host/{}/Resources/{}", self.info.name, compute, name));
        }

        for path in candidates {
            if let Some(obj) = self.client.find_by_inventory_path(&path).await?
                && obj.is_type(moref_type::RESOURCE_POOL)
            {
                return Ok(Some(obj));
            }
        }
        Ok(None)
    }

    pub async fn network(&self, name: &str) -> Result<ManagedObjectReference, VSphereError> {
        self.require("network", self.path("network", name)).await
    }

    pub async fn vm_by_name(&self, name: &str) -> Result<Option<ManagedObjectReference>, VSphereError> {
        Ok(self
            .client
            .find_by_inventory_path(&self.path("vm", name))
            .await?
            .filter(|obj| obj.is_type(moref_type::VIRTUAL_MACHINE)))
    }

    pub async fn vm_by_instance_uuid(
        &self,
        uuid: &str,
    ) -> Result<Option<ManagedObjectReference>, VSphereError> {
        self.client.find_by_instance_uuid(&self.datacenter, uuid).await
    }
}

/// Process-wide cache of authenticated sessions
pub struct SessionCache {
    connector: Arc<dyn VSphereConnector>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCache")
            .field("sessions", &self.sessions().len())
            .finish_non_exhaustive()
    }
}

impl SessionCache {
    pub fn new(connector: Arc<dyn VSphereConnector>) -> Self {
        Self {
            connector,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return a live session for `params`, logging in when needed
    ///
    /// # Errors
    ///
    /// `Authentication` when the credentials are rejected, `EndpointUnreachable`
    /// when the server cannot be reached and `DatacenterNotFound` when the
    /// requested datacenter does not exist. A failed liveness check of a
    /// cached session is returned as is.
    pub async fn get_or_create(&self, params: &SessionParams) -> Result<Arc<Session>, VSphereError> {
        let key = params.cache_key();
        let cached = self.sessions().get(&key).cloned();

        if let Some(session) = cached {
            if session.is_alive().await? {
                metrics::record_session_lookup("hit");
                debug!("Reusing cached vSphere session for {}", key);
                return Ok(session);
            }
            metrics::record_session_lookup("stale");
            warn!("Cached vSphere session for {} is no longer active, reconnecting", key);
            if let Err(e) = session.client.logout().await {
                debug!("Logout of stale session for {} failed: {}", key, e);
            }
        } else {
            metrics::record_session_lookup("miss");
        }

        let client = self.connector.connect(&params.connect_params()).await?;
        let about = client.about().await?;
        let datacenter =
            Finder::datacenter_or_default(client.as_ref(), params.datacenter.as_deref()).await?;
        let info = client.datacenter_info(&datacenter).await?;
        info!(
            "Logged in to {} ({}) as {}, datacenter {}",
            params.server, about.full_name, params.username, info.name
        );

        let session = Arc::new(Session {
            finder: Finder {
                client: Arc::clone(&client),
                datacenter,
                info,
            },
            client,
            about,
        });
        self.sessions().insert(key, Arc::clone(&session));
        Ok(session)
    }

    /// Number of cached sessions
    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{VCenterFixture, DATACENTER, SERVER};
    use vsphere_client::{MockCall, MockConnector, MockVSphereClient};

    fn params() -> SessionParams {
        SessionParams::new(SERVER)
            .with_user_info("administrator@vsphere.local", "secret")
            .with_datacenter(DATACENTER)
    }

    #[test]
    fn cache_key_excludes_password() {
        let key = params().cache_key();
        assert_eq!(key, format!("{}#administrator@vsphere.local#{}", SERVER, DATACENTER));
        assert!(!format!("{:?}", params()).contains("secret"));
    }

    #[tokio::test]
    async fn same_session_is_returned_while_alive() {
        let fixture = VCenterFixture::new();
        let cache = SessionCache::new(Arc::new(fixture.connector.clone()));

        let first = cache.get_or_create(&params()).await.unwrap();
        let second = cache.get_or_create(&params()).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fixture.connector.connect_count(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn dead_session_is_replaced_and_logged_out() {
        let fixture = VCenterFixture::new();
        let cache = SessionCache::new(Arc::new(fixture.connector.clone()));

        let first = cache.get_or_create(&params()).await.unwrap();
        fixture.connector.sessions()[0].set_session_active(false);
        let second = cache.get_or_create(&params()).await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(fixture.connector.connect_count(), 2);
        assert!(fixture.vcenter.calls().contains(&MockCall::Logout));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn expired_session_is_replaced_and_logged_out() {
        let fixture = VCenterFixture::new();
        let cache = SessionCache::new(Arc::new(fixture.connector.clone()));

        let first = cache.get_or_create(&params()).await.unwrap();
        fixture.connector.sessions()[0].expire_next("session_is_active");
        let second = cache.get_or_create(&params()).await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(fixture.connector.connect_count(), 2);
        assert!(fixture.vcenter.calls().contains(&MockCall::Logout));
    }

    #[tokio::test]
    async fn failed_liveness_check_keeps_the_session() {
        let fixture = VCenterFixture::new();
        let cache = SessionCache::new(Arc::new(fixture.connector.clone()));

        let first = cache.get_or_create(&params()).await.unwrap();
        fixture.connector.sessions()[0].disconnect_next("session_is_active");

        let err = cache.get_or_create(&params()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(!fixture.vcenter.calls().contains(&MockCall::Logout));
        assert_eq!(fixture.connector.connect_count(), 1);

        let again = cache.get_or_create(&params()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn pinned_thumbprint_is_part_of_the_identity() {
        let pinned = params().with_thumbprint("AB:CD:EF");
        assert_eq!(
            pinned.cache_key(),
            format!("{}#administrator@vsphere.local#{}#AB:CD:EF", SERVER, DATACENTER)
        );
        assert_eq!(pinned.connect_params().thumbprint.as_deref(), Some("AB:CD:EF"));
        assert_eq!(params().with_thumbprint("").cache_key(), params().cache_key());
    }

    #[tokio::test]
    async fn different_datacenters_get_different_sessions() {
        let fixture = VCenterFixture::new();
        fixture.vcenter.add_datacenter("dc2");
        let cache = SessionCache::new(Arc::new(fixture.connector.clone()));

        let first = cache.get_or_create(&params()).await.unwrap();
        let other = SessionParams::new(SERVER)
            .with_user_info("administrator@vsphere.local", "secret")
            .with_datacenter("dc2");
        let second = cache.get_or_create(&other).await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.finder().datacenter_name(), "dc2");
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn rejected_credentials_surface_as_authentication_error() {
        let fixture = VCenterFixture::new();
        fixture
            .connector
            .require_credentials(SERVER, "administrator@vsphere.local", "right");
        let cache = SessionCache::new(Arc::new(fixture.connector.clone()));

        let err = cache.get_or_create(&params()).await.unwrap_err();
        assert!(matches!(err, VSphereError::Authentication(_)));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn unknown_datacenter_is_reported() {
        let fixture = VCenterFixture::new();
        let cache = SessionCache::new(Arc::new(fixture.connector.clone()));
        let params = SessionParams::new(SERVER)
            .with_user_info("u", "p")
            .with_datacenter("nope");

        let err = cache.get_or_create(&params).await.unwrap_err();
        assert!(matches!(err, VSphereError::DatacenterNotFound(name) if name == "nope"));
    }

    #[tokio::test]
    async fn default_datacenter_must_be_unambiguous() {
        let vcenter = MockVSphereClient::new(SERVER);
        let connector = MockConnector::new();
        connector.add_endpoint(SERVER, vcenter.clone());
        let cache = SessionCache::new(Arc::new(connector));
        let params = SessionParams::new(SERVER).with_user_info("u", "p");

        let err = cache.get_or_create(&params).await.unwrap_err();
        assert!(matches!(err, VSphereError::DatacenterNotFound(_)));

        vcenter.add_datacenter("dc1");
        let session = cache.get_or_create(&params).await.unwrap();
        assert_eq!(session.finder().datacenter_name(), "dc1");

        vcenter.add_datacenter("dc2");
        let fresh = SessionCache::new(Arc::new({
            let connector = MockConnector::new();
            connector.add_endpoint(SERVER, vcenter.clone());
            connector
        }));
        let err = fresh.get_or_create(&params).await.unwrap_err();
        assert!(matches!(err, VSphereError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn finder_resolves_defaults_and_relative_names() {
        let fixture = VCenterFixture::new();
        let cache = SessionCache::new(Arc::new(fixture.connector.clone()));
        let session = cache.get_or_create(&params()).await.unwrap();
        let finder = session.finder();

        assert_eq!(finder.datastore_or_default(None).await.unwrap(), fixture.datastore);
        assert_eq!(finder.folder_or_default(Some("workloads")).await.unwrap(), fixture.folder);
        assert_eq!(finder.network("VM Network").await.unwrap(), fixture.network);
        assert_eq!(finder.resource_pool_or_default(None).await.unwrap(), fixture.root_pool);
        assert_eq!(finder.vm_by_name("ubuntu-template").await.unwrap(), Some(fixture.template.clone()));
        assert_eq!(finder.vm_by_name("missing").await.unwrap(), None);
        assert!(finder.resource_pool("team-a", Some("esx-01")).await.unwrap().is_none());
        assert!(matches!(
            finder.network("missing").await.unwrap_err(),
            VSphereError::NotFound(_)
        ));
    }
}
