//! Backend sessions.
//!
//! A [`Connection`] is the caller-side handle for one adapter session on one
//! node. It holds no key material. Connections are owned by the cluster
//! manager; copies handed to operations are invalidated when the session is
//! closed on the backend.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::config::{AuthMethod, CertPaths, HsmConfig};
use crate::error::{HsmError, Result};
use crate::random::RandomSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub connection_id: String,
    pub vendor_name: String,
    pub endpoint: String,
    pub session_id: String,
    pub auth_method: AuthMethod,
    pub status: ConnectionStatus,
    pub established_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Connection {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// Everything an adapter needs to open a session on one endpoint.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub endpoint: String,
    pub client_id: String,
    pub auth_method: AuthMethod,
    pub credentials: Option<Zeroizing<String>>,
    pub cert_paths: Option<CertPaths>,
    pub validate_certificates: bool,
    pub session_timeout: Duration,
    /// Randomness source the backend should use for this session.
    pub random_source: RandomSource,
    /// Re-verify stored key metadata on every load.
    pub integrity_checks: bool,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("endpoint", &self.endpoint)
            .field("client_id", &self.client_id)
            .field("auth_method", &self.auth_method)
            .field("credentials", &self.credentials.as_ref().map(|_| "<redacted>"))
            .field("cert_paths", &self.cert_paths)
            .field("session_timeout", &self.session_timeout)
            .field("random_source", &self.random_source)
            .field("integrity_checks", &self.integrity_checks)
            .finish()
    }
}

impl ConnectionConfig {
    pub fn from_config(config: &HsmConfig, endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            client_id: config.authentication.client_id.clone(),
            auth_method: config.authentication.auth_method,
            credentials: config.authentication.credentials.clone().map(Zeroizing::new),
            cert_paths: config.authentication.cert_paths.clone(),
            validate_certificates: config.authentication.validate_certificates,
            session_timeout: Duration::from_secs(config.authentication.session_timeout),
            random_source: config.random_source(),
            integrity_checks: config.security.integrity_checks,
        }
    }

    pub fn for_endpoint(&self, endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            ..self.clone()
        }
    }
}

fn check_pem(path: &Path, role: &str, accepted_tags: &[&str]) -> Result<()> {
    let raw = std::fs::read(path).map_err(|e| {
        HsmError::Authentication(format!("{} {} is not readable: {}", role, path.display(), e))
    })?;
    let docs = pem::parse_many(&raw)
        .map_err(|e| HsmError::Authentication(format!("{} {} is not valid PEM: {}", role, path.display(), e)))?;
    if docs.is_empty() {
        return Err(HsmError::Authentication(format!(
            "{} {} contains no PEM blocks",
            role,
            path.display()
        )));
    }
    if !docs.iter().any(|d| accepted_tags.contains(&d.tag())) {
        return Err(HsmError::Authentication(format!(
            "{} {} has none of the expected blocks {:?}",
            role,
            path.display(),
            accepted_tags
        )));
    }
    Ok(())
}

/// Check that certificate credentials exist and parse before any handshake.
pub fn validate_certificate_credentials(paths: &CertPaths) -> Result<()> {
    check_pem(&paths.client_cert, "client certificate", &["CERTIFICATE"])?;
    check_pem(
        &paths.client_key,
        "client key",
        &["PRIVATE KEY", "EC PRIVATE KEY", "RSA PRIVATE KEY"],
    )?;
    if let Some(ca) = &paths.ca_cert {
        check_pem(ca, "CA certificate", &["CERTIFICATE"])?;
    }
    Ok(())
}
