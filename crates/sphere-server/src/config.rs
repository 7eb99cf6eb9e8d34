//! Server configuration.
//!
//! Layered, later layers winning:
//! - Built-in defaults
//! - The first file found of `sphere.toml`, `/etc/sphere/sphere.toml`,
//!   `~/.config/sphere/sphere.toml`
//! - Environment variables (`SPHERE_PORT`, `SPHERE_AUTH__ACCESS_TOKEN_SECRET`, ...)

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sphere_core::{AccountSettings, TokenConfig};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest accepted token lifetime (one year).
const MAX_TOKEN_TTL_SECS: u64 = 365 * 24 * 60 * 60;

const CONFIG_PATHS: [&str; 3] = [
    "sphere.toml",
    "/etc/sphere/sphere.toml",
    "~/.config/sphere/sphere.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Externally reachable base URL, used in emailed links.
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Token secrets and lifetimes.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of open gateway sockets, superseded ones included.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Token configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub access_token_secret: String,

    #[serde(default = "default_access_ttl")]
    pub access_token_ttl_secs: u64,

    #[serde(default)]
    pub refresh_token_secret: String,

    #[serde(default = "default_refresh_ttl")]
    pub refresh_token_ttl_secs: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_public_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_access_ttl() -> u64 {
    15 * 60
}

fn default_refresh_ttl() -> u64 {
    10 * 24 * 60 * 60
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: default_public_url(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            access_token_secret: String::new(),
            access_token_ttl_secs: default_access_ttl(),
            refresh_token_secret: String::new(),
            refresh_token_ttl_secs: default_refresh_ttl(),
        }
    }
}

// Secrets stay out of logs.
impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("access_token_secret", &"<redacted>")
            .field("access_token_ttl_secs", &self.access_token_ttl_secs)
            .field("refresh_token_secret", &"<redacted>")
            .field("refresh_token_ttl_secs", &self.refresh_token_ttl_secs)
            .finish()
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, the first config file found and the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer cannot be parsed or the result is invalid.
    pub fn load() -> Result<Self> {
        let file = CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());

        let config = Self::layered(file.as_deref())?;
        config.validate()?;
        Ok(config)
    }

    /// Build the layered configuration with an optional file layer.
    fn layered(file: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder().add_source(
            ::config::Config::try_from(&Self::default()).context("Failed to encode defaults")?,
        );

        if let Some(path) = file {
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Toml),
            );
        }

        builder
            .add_source(
                ::config::Environment::with_prefix("SPHERE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Reject configurations the server cannot run safely with.
    ///
    /// # Errors
    ///
    /// Returns an error for missing or shared token secrets, or lifetimes that
    /// are zero or longer than a year.
    pub fn validate(&self) -> Result<()> {
        let auth = &self.auth;
        if auth.access_token_secret.is_empty() || auth.refresh_token_secret.is_empty() {
            bail!("auth.access_token_secret and auth.refresh_token_secret must be set");
        }
        if auth.access_token_secret == auth.refresh_token_secret {
            bail!("access and refresh tokens must be signed with different secrets");
        }
        if auth.access_token_ttl_secs == 0 || auth.refresh_token_ttl_secs == 0 {
            bail!("token lifetimes must be positive");
        }
        if auth.access_token_ttl_secs > MAX_TOKEN_TTL_SECS
            || auth.refresh_token_ttl_secs > MAX_TOKEN_TTL_SECS
        {
            bail!("token lifetimes must not exceed {MAX_TOKEN_TTL_SECS} seconds");
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Token settings for the token service.
    #[must_use]
    pub fn token_config(&self) -> TokenConfig {
        TokenConfig {
            access_secret: self.auth.access_token_secret.clone(),
            access_ttl: Duration::from_secs(self.auth.access_token_ttl_secs),
            refresh_secret: self.auth.refresh_token_secret.clone(),
            refresh_ttl: Duration::from_secs(self.auth.refresh_token_ttl_secs),
        }
    }

    /// Settings for account flows.
    #[must_use]
    pub fn account_settings(&self) -> AccountSettings {
        AccountSettings {
            public_url: self.public_url.trim_end_matches('/').to_string(),
            ..AccountSettings::default()
        }
    }
}
