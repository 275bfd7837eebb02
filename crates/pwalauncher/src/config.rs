//! Gateway configuration: loading, defaults and validation.
//!
//! The configuration file is read once at startup (YAML or JSON, picked by
//! extension) and never changes afterwards. Everything that can be checked
//! before a listener binds is checked in [`GatewayConfig::validate`].

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use pwalauncher_router::{MountKind, RouteTable, RouteTableError};
use rand::RngCore;
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;

use crate::response::DEFAULT_MAX_BODY_SIZE;
use crate::tls::TlsError;

/// Paths that may be fetched without the session cookie unless overridden.
pub const DEFAULT_COOKIE_ALLOWED: &[&str] = &["/", "/index.html", "/favicon.ico"];

/// Errors raised while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported config format '{0}' (expected .yaml, .yml or .json)")]
    UnknownFormat(PathBuf),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("route conflict: {0}")]
    Route(#[from] RouteTableError),

    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// PEM material for the TLS listeners.
#[derive(Debug, Clone, Deserialize)]
pub struct SslConfig {
    /// Private key file.
    pub key: PathBuf,
    /// Certificate chain file, leaf first.
    pub cert: PathBuf,
    /// Optional CA bundle appended to the served chain.
    #[serde(default)]
    pub ca: Option<PathBuf>,
}

/// A named upstream mounted at `/<path>`.
#[derive(Debug, Clone, Deserialize)]
pub struct NamedTarget {
    pub path: String,
    pub link: String,
}

/// How the session secret is configured on disk.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CookieSecretConfig {
    Pair { key: String, value: String },
    Mode(CookieSecretMode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CookieSecretMode {
    /// Generate a fresh pair at startup; sessions end with the process.
    Random,
}

/// The shared cookie pair every browser session must present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSecret {
    pub key: String,
    pub value: String,
}

impl SessionSecret {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// A fresh random pair: an 8-byte hex name and a 32-byte hex value.
    pub fn random() -> Self {
        let mut rng = rand::rng();
        let mut key = [0u8; 8];
        let mut value = [0u8; 32];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut value);
        Self {
            key: format!("s{}", hex::encode(key)),
            value: hex::encode(value),
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Local backends, each mounted at `/<port>`.
    #[serde(default)]
    pub ports: Vec<u16>,

    /// Named upstreams.
    #[serde(default)]
    pub proxy: Vec<NamedTarget>,

    #[serde(default)]
    pub ssl: Option<SslConfig>,

    /// Plain HTTP listener.
    #[serde(default)]
    pub port: Option<u16>,

    /// HTTP/1.1-over-TLS listener.
    #[serde(default)]
    pub ssl_port: Option<u16>,

    /// HTTP/2-over-TLS listener.
    #[serde(default)]
    pub http2_port: Option<u16>,

    /// Port advertised in HTTPS redirects.
    #[serde(default)]
    pub ssl_redirect_port: Option<u16>,

    #[serde(default)]
    pub redirect_https: bool,

    /// Require TLS clients to present the server's own certificate.
    #[serde(default)]
    pub ssl_verify: bool,

    #[serde(default)]
    pub jwt_secret: Option<String>,

    #[serde(default)]
    pub cookie_secret: Option<CookieSecretConfig>,

    #[serde(default = "default_cookie_allowed")]
    pub cookie_secret_allowed: Vec<String>,

    #[serde(default)]
    pub ip_blacklist: Vec<String>,

    #[serde(default = "default_wwwroot")]
    pub wwwroot: PathBuf,

    #[serde(default)]
    pub disable_ws: bool,

    #[serde(default)]
    pub socket_restream: bool,

    #[serde(default)]
    pub cors_anywhere: bool,

    /// Largest request body buffered by the relay and cors-anywhere.
    /// Proxied bodies stream and are not limited.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

fn default_cookie_allowed() -> Vec<String> {
    DEFAULT_COOKIE_ALLOWED.iter().map(|p| p.to_string()).collect()
}

fn default_max_body_size() -> usize {
    DEFAULT_MAX_BODY_SIZE
}

fn default_wwwroot() -> PathBuf {
    PathBuf::from("wwwroot")
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            proxy: Vec::new(),
            ssl: None,
            port: None,
            ssl_port: None,
            http2_port: None,
            ssl_redirect_port: None,
            redirect_https: false,
            ssl_verify: false,
            jwt_secret: None,
            cookie_secret: None,
            cookie_secret_allowed: default_cookie_allowed(),
            ip_blacklist: Vec::new(),
            wwwroot: default_wwwroot(),
            disable_ws: false,
            socket_restream: false,
            cors_anywhere: false,
            max_body_size: default_max_body_size(),
        }
    }
}

impl GatewayConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        let config = match extension.as_deref() {
            Some("yaml") | Some("yml") => Self::from_yaml(&content)?,
            Some("json") => Self::from_json(&content)?,
            _ => return Err(ConfigError::UnknownFormat(path.to_path_buf())),
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse YAML without validating.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Parse JSON without validating.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Check every startup invariant. Errors here are fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let listeners: Vec<u16> = [self.port, self.ssl_port, self.http2_port]
            .into_iter()
            .flatten()
            .collect();

        if self.max_body_size == 0 {
            return Err(invalid("maxBodySize must be greater than zero"));
        }

        if listeners.is_empty() {
            return Err(invalid(
                "at least one of port, sslPort or http2Port must be set",
            ));
        }

        // Port 0 asks the OS for a free port and may repeat.
        let mut seen = HashSet::new();
        for port in listeners.iter().filter(|p| **p != 0) {
            if !seen.insert(*port) {
                return Err(invalid(format!("listener port {} is used twice", port)));
            }
        }

        if self.ssl.is_none() {
            if self.ssl_port.is_some() || self.http2_port.is_some() {
                return Err(invalid("sslPort and http2Port require ssl"));
            }
            if self.ssl_verify {
                return Err(invalid("sslVerify requires ssl"));
            }
        }

        if self.redirect_https && self.redirect_port().is_none() {
            return Err(invalid(
                "redirectHttps requires sslRedirectPort, sslPort or http2Port",
            ));
        }

        for port in &self.ports {
            if *port == 0 {
                return Err(invalid("numbered target port must be greater than 0"));
            }
        }

        for target in &self.proxy {
            if target.path.trim_matches('/').is_empty() {
                return Err(invalid("proxy path must not be empty"));
            }
            validate_link(&target.link)?;
        }

        self.blacklist()?;

        if let Some(secret) = &self.jwt_secret {
            if secret.is_empty() {
                return Err(invalid("jwtSecret must not be empty"));
            }
        }

        if let Some(CookieSecretConfig::Pair { key, value }) = &self.cookie_secret {
            if key.is_empty() || value.is_empty() {
                return Err(invalid("cookieSecret key and value must not be empty"));
            }
            if !is_cookie_token(key) {
                return Err(invalid(format!(
                    "cookieSecret key '{}' is not a valid cookie name",
                    key
                )));
            }
        }

        // Duplicate ports, duplicate names and names shadowing ports all
        // surface as route conflicts.
        self.route_table()?;

        Ok(())
    }

    /// Build the route table: numbered mounts first, then named mounts, both
    /// in configuration order.
    pub fn route_table(&self) -> Result<RouteTable, ConfigError> {
        let mut builder = RouteTable::builder();

        for port in &self.ports {
            builder = builder.mount(
                &format!("/{}", port),
                MountKind::Numbered(*port),
                format!("http://127.0.0.1:{}", port),
            )?;
        }

        for target in &self.proxy {
            let name = target.path.trim_matches('/').to_string();
            builder = builder.mount(&target.path, MountKind::Named(name), target.link.clone())?;
        }

        Ok(builder.build())
    }

    /// Parsed `ipBlacklist`.
    pub fn blacklist(&self) -> Result<HashSet<IpAddr>, ConfigError> {
        self.ip_blacklist
            .iter()
            .map(|entry| {
                entry
                    .trim()
                    .parse::<IpAddr>()
                    .map(|ip| ip.to_canonical())
                    .map_err(|_| invalid(format!("ipBlacklist entry '{}' is not an IP", entry)))
            })
            .collect()
    }

    /// Port used in HTTPS redirects.
    pub fn redirect_port(&self) -> Option<u16> {
        self.ssl_redirect_port
            .or(self.ssl_port)
            .or(self.http2_port)
    }

    /// Resolve the session secret. `None` disables the session gate.
    pub fn session_secret(&self) -> Option<SessionSecret> {
        match self.cookie_secret.as_ref()? {
            CookieSecretConfig::Pair { key, value } => Some(SessionSecret::new(key, value)),
            CookieSecretConfig::Mode(CookieSecretMode::Random) => Some(SessionSecret::random()),
        }
    }

}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn validate_link(link: &str) -> Result<(), ConfigError> {
    let url = Url::parse(link)
        .map_err(|e| invalid(format!("proxy link '{}' is not a URL: {}", link, e)))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(invalid(format!(
            "proxy link '{}' must use http or https",
            link
        )));
    }
    if url.host_str().is_none() {
        return Err(invalid(format!("proxy link '{}' has no host", link)));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(invalid(format!(
            "proxy link '{}' must not carry a query or fragment",
            link
        )));
    }
    Ok(())
}

/// RFC 6265 cookie-name characters.
fn is_cookie_token(name: &str) -> bool {
    name.bytes().all(|b| {
        b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
    })
}
