//! # Client Configuration
//!
//! Configuration management for the sync client.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     LIVEQUERY_DEPLOYMENT_URL=https://happy-otter-123.example.cloud     │
//! │     LIVEQUERY_REFRESH_LEEWAY_SECS=30                                   │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/livequery/livequery.toml (Linux)                         │
//! │     ~/Library/Application Support/dev.livequery.livequery/... (macOS)  │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     no deployment, auto-generated client_id                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # livequery.toml
//! [deployment]
//! url = "https://happy-otter-123.example.cloud"
//! client_id = "550e8400-e29b-41d4-a716-446655440000"
//!
//! [connection]
//! connect_timeout_secs = 10
//! initial_backoff_ms = 100
//! max_backoff_secs = 16
//! ping_interval_secs = 15
//!
//! [auth]
//! refresh_leeway_secs = 10
//!
//! [client]
//! unsaved_changes_warning = true
//! verbose = false
//! ```

use std::path::PathBuf;
use std::time::Duration;

use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

/// Path the sync endpoint lives under on every deployment.
pub const SYNC_PATH: &str = "/api/sync";

// =============================================================================
// Deployment Configuration
// =============================================================================

/// Which deployment this client talks to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Deployment origin (`https://…`, `http://…`, `wss://…` or `ws://…`).
    #[serde(default)]
    pub url: Option<String>,

    /// Identifier for this client installation, used in logs.
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

fn default_client_id() -> String {
    Uuid::new_v4().to_string()
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        DeploymentConfig {
            url: None,
            client_id: default_client_id(),
        }
    }
}

// =============================================================================
// Connection Settings
// =============================================================================

/// Socket and reconnect settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Time allowed for one WebSocket handshake (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// First reconnect delay (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Reconnect delay cap (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Keepalive ping interval (seconds).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_initial_backoff() -> u64 {
    100
}
fn default_max_backoff() -> u64 {
    16
}
fn default_ping_interval() -> u64 {
    15
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            connect_timeout_secs: default_connect_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            ping_interval_secs: default_ping_interval(),
        }
    }
}

// =============================================================================
// Auth Settings
// =============================================================================

/// Token refresh settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    /// How long before a JWT's `exp` a fresh token is fetched (seconds).
    #[serde(default = "default_refresh_leeway")]
    pub refresh_leeway_secs: u64,
}

fn default_refresh_leeway() -> u64 {
    10
}

impl Default for AuthSettings {
    fn default() -> Self {
        AuthSettings {
            refresh_leeway_secs: default_refresh_leeway(),
        }
    }
}

// =============================================================================
// Client Settings
// =============================================================================

/// Behaviour of the client handle itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Warn on close while mutations are still unconfirmed.
    #[serde(default = "default_true")]
    pub unsaved_changes_warning: bool,

    /// Log every message sent and received at debug level.
    #[serde(default)]
    pub verbose: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ClientSettings {
    fn default() -> Self {
        ClientSettings {
            unsaved_changes_warning: true,
            verbose: false,
        }
    }
}

// =============================================================================
// Main Client Configuration
// =============================================================================

/// Complete client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub deployment: DeploymentConfig,

    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub client: ClientSettings,
}

impl ClientConfig {
    /// Creates a new config with defaults and a generated client ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults pointed at one deployment.
    pub fn for_deployment(url: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.deployment.url = Some(url.into());
        config
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (livequery.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading client config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load client config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Client config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.deployment.client_id.is_empty() {
            return Err(SyncError::InvalidConfig("client_id must not be empty".into()));
        }

        if let Some(ref url) = self.deployment.url {
            deployment_to_ws_url(url)?;
        }

        if self.connection.connect_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "connect_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.connection.initial_backoff_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "initial_backoff_ms must be greater than 0".into(),
            ));
        }

        if self.connection.initial_backoff_ms > self.connection.max_backoff_secs * 1000 {
            return Err(SyncError::InvalidConfig(
                "initial_backoff_ms must not exceed max_backoff_secs".into(),
            ));
        }

        if self.connection.ping_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "ping_interval_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("LIVEQUERY_DEPLOYMENT_URL") {
            debug!(url = %url, "Overriding deployment URL from environment");
            self.deployment.url = Some(url);
        }

        if let Ok(id) = std::env::var("LIVEQUERY_CLIENT_ID") {
            self.deployment.client_id = id;
        }

        if let Ok(leeway) = std::env::var("LIVEQUERY_REFRESH_LEEWAY_SECS") {
            match leeway.parse::<u64>() {
                Ok(secs) => self.auth.refresh_leeway_secs = secs,
                Err(_) => warn!(value = %leeway, "Ignoring invalid refresh leeway in environment"),
            }
        }

        if let Ok(flag) = std::env::var("LIVEQUERY_UNSAVED_CHANGES_WARNING") {
            if let Some(enabled) = parse_flag(&flag) {
                self.client.unsaved_changes_warning = enabled;
            }
        }

        if let Ok(flag) = std::env::var("LIVEQUERY_VERBOSE") {
            if let Some(enabled) = parse_flag(&flag) {
                self.client.verbose = enabled;
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "livequery", "livequery")
            .map(|dirs| dirs.config_dir().join("livequery.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// WebSocket endpoint for the configured deployment.
    pub fn sync_url(&self) -> SyncResult<Url> {
        let url = self
            .deployment
            .url
            .as_deref()
            .ok_or(SyncError::MissingDeploymentUrl)?;
        deployment_to_ws_url(url)
    }

    /// Reconnect backoff policy. Never gives up.
    pub fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(self.connection.initial_backoff_ms),
            max_interval: Duration::from_secs(self.connection.max_backoff_secs),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.connect_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.connection.ping_interval_secs)
    }

    pub fn refresh_leeway(&self) -> Duration {
        Duration::from_secs(self.auth.refresh_leeway_secs)
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            warn!(value = %other, "Ignoring invalid boolean in environment");
            None
        }
    }
}

/// Maps a deployment origin to its sync WebSocket endpoint.
///
/// `https`/`wss` become `wss`, `http`/`ws` become `ws`; the path is always
/// [`SYNC_PATH`].
pub fn deployment_to_ws_url(deployment: &str) -> SyncResult<Url> {
    let mut url = Url::parse(deployment)?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(SyncError::InvalidUrl(format!(
                "Deployment URL must use http(s) or ws(s), got: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::InvalidUrl(format!("Cannot use scheme {} for {}", scheme, deployment)))?;
    url.set_path(SYNC_PATH);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert!(!config.deployment.client_id.is_empty());
        assert!(config.deployment.url.is_none());
        assert_eq!(config.auth.refresh_leeway_secs, 10);
        assert!(config.client.unsaved_changes_warning);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ClientConfig::for_deployment("https://happy-otter-123.example.cloud");
        assert!(config.validate().is_ok());

        config.deployment.url = Some("ftp://nope".to_string());
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.deployment.url = None;
        config.connection.ping_interval_secs = 0;
        assert!(config.validate().is_err());

        config.connection.ping_interval_secs = 15;
        config.connection.initial_backoff_ms = 20_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deployment_to_ws_url() {
        let url = deployment_to_ws_url("https://happy-otter-123.example.cloud").unwrap();
        assert_eq!(url.as_str(), "wss://happy-otter-123.example.cloud/api/sync");

        let url = deployment_to_ws_url("http://127.0.0.1:3210/").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:3210/api/sync");

        let url = deployment_to_ws_url("wss://host.example/other?x=1").unwrap();
        assert_eq!(url.as_str(), "wss://host.example/api/sync");

        assert!(deployment_to_ws_url("not a url").is_err());
    }

    #[test]
    fn test_sync_url_requires_deployment() {
        let config = ClientConfig::default();
        assert!(matches!(config.sync_url(), Err(SyncError::MissingDeploymentUrl)));
    }

    #[test]
    fn test_toml_serialization() {
        let config = ClientConfig::for_deployment("https://a.example");
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[deployment]"));
        assert!(toml_str.contains("[connection]"));

        let parsed: ClientConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.deployment.url.as_deref(), Some("https://a.example"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: ClientConfig = toml::from_str("[auth]\nrefresh_leeway_secs = 30\n").unwrap();
        assert_eq!(parsed.auth.refresh_leeway_secs, 30);
        assert_eq!(parsed.connection.connect_timeout_secs, 10);
        assert!(!parsed.deployment.client_id.is_empty());
    }

    #[test]
    fn test_backoff_policy() {
        let config = ClientConfig::default();
        let backoff = config.create_backoff();
        assert_eq!(backoff.initial_interval, Duration::from_millis(100));
        assert_eq!(backoff.max_interval, Duration::from_secs(16));
        assert!(backoff.max_elapsed_time.is_none());
    }
}
