use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};

use super::ConfigError;

pub const DEFAULT_HOST: &str = ":9090";

/// One listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_name")]
    pub name: String,

    /// `host:port`; a bare `:port` binds every interface.
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default)]
    pub http2_only: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuthConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<JwtSigningConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proxy: Vec<ProxyTargetConfig>,
}

fn default_server_name() -> String {
    "default".to_string()
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            host: default_host(),
            http2_only: false,
            basic_auth: None,
            jwt: None,
            tls: None,
            proxy: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Resolve the configured host to a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let host = if self.host.starts_with(':') {
            format!("0.0.0.0{}", self.host)
        } else {
            self.host.clone()
        };
        host.to_socket_addrs()
            .map_err(|e| ConfigError::Invalid(format!("server {:?}: host {:?}: {e}", self.name, self.host)))?
            .next()
            .ok_or_else(|| ConfigError::Invalid(format!("server {:?}: host {:?} resolved to nothing", self.name, self.host)))
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls.is_some() {
            "https"
        } else {
            "http"
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BasicAuthConfig {
    pub username: String,
    pub password: String,
    #[serde(default, alias = "relm", skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
}

/// Signing configuration shared by every route on a listener.
///
/// Key material fields are templates, evaluated once at load time so they can
/// come from `env(..)` or `file(..)`.
#[derive(Clone, Deserialize, Serialize)]
pub struct JwtSigningConfig {
    pub name: String,
    #[serde(alias = "algo", alias = "alg")]
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, alias = "key", skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl std::fmt::Debug for JwtSigningConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtSigningConfig")
            .field("name", &self.name)
            .field("algorithm", &self.algorithm)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("public_key", &self.public_key.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

/// A named upstream a response status or route can delegate to.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyTargetConfig {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, super::HeaderValues>,
}
