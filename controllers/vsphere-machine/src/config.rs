//! Controller configuration from environment variables.

use crate::error::ControllerError;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_CONCURRENCY: u16 = 4;
const DEFAULT_HTTP_TIMEOUT_SECONDS: u64 = 30;

/// Process-wide controller settings
#[derive(Clone)]
pub struct ControllerConfig {
    /// Credentials used when a cluster names no credentials Secret
    pub username: String,
    pub password: String,
    /// Namespace scope of the watch; `None` watches all namespaces
    pub namespace: Option<String>,
    pub metrics_addr: SocketAddr,
    pub concurrency: u16,
    pub http_timeout: Duration,
}

impl fmt::Debug for ControllerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("namespace", &self.namespace)
            .field("metrics_addr", &self.metrics_addr)
            .field("concurrency", &self.concurrency)
            .field("http_timeout", &self.http_timeout)
            .finish()
    }
}

impl ControllerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let required = |key: &str| {
            lookup(key).filter(|v| !v.is_empty()).ok_or_else(|| {
                ControllerError::InvalidConfig(format!("{} environment variable is required", key))
            })
        };

        let username = required("VSPHERE_USERNAME")?;
        let password = required("VSPHERE_PASSWORD")?;
        let namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty());

        let metrics_addr = lookup("METRICS_ADDR")
            .unwrap_or_else(|| DEFAULT_METRICS_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| ControllerError::InvalidConfig(format!("METRICS_ADDR: {}", e)))?;

        let concurrency = match lookup("RECONCILE_CONCURRENCY") {
            Some(value) => value.parse::<u16>().map_err(|e| {
                ControllerError::InvalidConfig(format!("RECONCILE_CONCURRENCY: {}", e))
            })?,
            None => DEFAULT_CONCURRENCY,
        };
        if concurrency == 0 {
            return Err(ControllerError::InvalidConfig(
                "RECONCILE_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        let timeout_seconds = match lookup("VSPHERE_HTTP_TIMEOUT_SECONDS") {
            Some(value) => value.parse::<u64>().map_err(|e| {
                ControllerError::InvalidConfig(format!("VSPHERE_HTTP_TIMEOUT_SECONDS: {}", e))
            })?,
            None => DEFAULT_HTTP_TIMEOUT_SECONDS,
        };

        Ok(Self {
            username,
            password,
            namespace,
            metrics_addr,
            concurrency,
            http_timeout: Duration::from_secs(timeout_seconds),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_credentials_are_set() {
        let config = ControllerConfig::from_lookup(lookup(&[
            ("VSPHERE_USERNAME", "administrator@vsphere.local"),
            ("VSPHERE_PASSWORD", "secret"),
        ]))
        .unwrap();

        assert_eq!(config.namespace, None);
        assert_eq!(config.metrics_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert!(!format!("{:?}", config).contains("secret"));
    }

    #[test]
    fn missing_password_is_invalid_config() {
        let err = ControllerConfig::from_lookup(lookup(&[("VSPHERE_USERNAME", "admin")]))
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(msg) if msg.contains("VSPHERE_PASSWORD")));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = ControllerConfig::from_lookup(lookup(&[
            ("VSPHERE_USERNAME", "admin"),
            ("VSPHERE_PASSWORD", "pw"),
            ("RECONCILE_CONCURRENCY", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = ControllerConfig::from_lookup(lookup(&[
            ("VSPHERE_USERNAME", "admin"),
            ("VSPHERE_PASSWORD", "pw"),
            ("WATCH_NAMESPACE", "capv-system"),
            ("METRICS_ADDR", "127.0.0.1:9090"),
            ("RECONCILE_CONCURRENCY", "8"),
            ("VSPHERE_HTTP_TIMEOUT_SECONDS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.namespace.as_deref(), Some("capv-system"));
        assert_eq!(config.metrics_addr.port(), 9090);
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.http_timeout, Duration::from_secs(5));
    }
}
