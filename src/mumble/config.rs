use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::mumble::control::Timing;
use crate::mumble::server::TlsOptions;
use crate::transport::errors::ConnectError;

pub const DEFAULT_PORT: u16 = 64738;
pub const DEFAULT_RELEASE: &str = "mumbot";

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MumbleConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub cert_pem: Option<String>,
    pub tokens: Vec<String>,
    pub accept_invalid_certs: bool,
    pub client_release: String,
    pub poll_interval_ms: u64,
    pub ping_interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for MumbleConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: DEFAULT_PORT,
            username: String::new(),
            password: None,
            cert_pem: None,
            tokens: Vec::new(),
            accept_invalid_certs: true,
            client_release: DEFAULT_RELEASE.to_string(),
            poll_interval_ms: 500,
            ping_interval_ms: 10_000,
            probe_timeout_ms: 1000,
        }
    }
}

impl MumbleConfig {
    pub fn new(server: String, port: u16, username: String) -> Self {
        Self {
            server,
            port,
            username,
            ..Self::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConnectError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|err| {
            ConnectError::InvalidConfig(format!("{}: {err}", path.display()))
        })
    }

    pub fn validate(&self) -> Result<(), ConnectError> {
        if self.server.trim().is_empty() {
            return Err(ConnectError::InvalidConfig(
                "server is required".to_string(),
            ));
        }
        if self.username.trim().is_empty() {
            return Err(ConnectError::InvalidConfig(
                "username is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn timing(&self) -> Timing {
        Timing {
            poll_interval: self.poll_interval(),
            ping_interval: self.ping_interval(),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.max(1))
    }

    pub fn tls_options(&self) -> TlsOptions {
        TlsOptions {
            accept_invalid_certs: self.accept_invalid_certs,
            cert_pem: self.cert_pem.clone(),
        }
    }
}
