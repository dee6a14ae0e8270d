//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     QUOTE_SYNC_SERVER_URL=https://api.example.com/v1                   │
//! │     QUOTE_SYNC_RELAY_URL=ws://127.0.0.1:8766/bus                       │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/quote-sync/sync.toml (Linux)                             │
//! │     ~/Library/Application Support/com.quote.quote-sync/sync.toml       │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [session]
//! namespace = "quote"
//! session_id = "default"
//!
//! [sync]
//! server_url = "https://api.example.com/v1"
//! auto_save_interval_ms = 5000
//! respect_user_auto_save_preference = true
//! sync_on_visibility_change = true
//! max_offline_time_ms = 300000
//! enable_cross_process_sync = true
//!
//! [bus]
//! relay_url = "ws://127.0.0.1:8766/bus"
//!
//! [storage]
//! database_path = "/var/lib/quote/cache.db"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use quote_core::validation::validate_namespace;
use quote_core::DEFAULT_NAMESPACE;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Session Settings
// =============================================================================

/// Identity of this editing session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Prefix for every persisted key.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Name of the bus session; processes with the same id see each
    /// other's broadcasts through the relay.
    #[serde(default = "default_session_id")]
    pub session_id: String,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_session_id() -> String {
    "default".to_string()
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            namespace: default_namespace(),
            session_id: default_session_id(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Base URL of the server of record (`GET/PUT {base}/{type}/{id}`).
    #[serde(default)]
    pub server_url: Option<String>,

    /// Auto-save interval (milliseconds).
    #[serde(default = "default_auto_save_interval")]
    pub auto_save_interval_ms: u64,

    /// Quiet period after an edit before it is auto-saved (milliseconds).
    #[serde(default = "default_auto_save_debounce")]
    pub auto_save_debounce_ms: u64,

    /// Longest an edit may wait under continuous typing (milliseconds).
    #[serde(default = "default_auto_save_max_wait")]
    pub auto_save_max_wait_ms: u64,

    /// Whether the user's auto-save preference pauses the scheduler.
    #[serde(default = "default_true")]
    pub respect_user_auto_save_preference: bool,

    /// The user's auto-save preference.
    #[serde(default = "default_true")]
    pub user_auto_save_enabled: bool,

    /// Save and push when the process becomes hidden; pull when visible.
    #[serde(default = "default_true")]
    pub sync_on_visibility_change: bool,

    /// Offline duration after which a full re-sync runs on reconnect
    /// (milliseconds).
    #[serde(default = "default_max_offline_time")]
    pub max_offline_time_ms: u64,

    /// Whether to broadcast to sibling processes at all.
    #[serde(default = "default_true")]
    pub enable_cross_process_sync: bool,

    /// Interval of the background sync-all loop (milliseconds).
    #[serde(default = "default_sync_interval")]
    pub sync_interval_ms: u64,

    /// HTTP request timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// A persisted `syncing` status older than this is treated as
    /// abandoned (seconds).
    #[serde(default = "default_push_in_flight_timeout")]
    pub push_in_flight_timeout_secs: u64,

    /// Initial backoff after a failed background sync or relay connect
    /// (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_auto_save_interval() -> u64 {
    5_000
}
fn default_auto_save_debounce() -> u64 {
    750
}
fn default_auto_save_max_wait() -> u64 {
    10_000
}
fn default_max_offline_time() -> u64 {
    300_000
}
fn default_sync_interval() -> u64 {
    30_000
}
fn default_request_timeout() -> u64 {
    15
}
fn default_push_in_flight_timeout() -> u64 {
    60
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            server_url: None,
            auto_save_interval_ms: default_auto_save_interval(),
            auto_save_debounce_ms: default_auto_save_debounce(),
            auto_save_max_wait_ms: default_auto_save_max_wait(),
            respect_user_auto_save_preference: true,
            user_auto_save_enabled: true,
            sync_on_visibility_change: true,
            max_offline_time_ms: default_max_offline_time(),
            enable_cross_process_sync: true,
            sync_interval_ms: default_sync_interval(),
            request_timeout_secs: default_request_timeout(),
            push_in_flight_timeout_secs: default_push_in_flight_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

// =============================================================================
// Bus Settings
// =============================================================================

/// Broadcast bus settings.
///
/// ```text
/// relay_url set    → RelayTransport (WebSocket to a RelayServer)
/// relay_url unset  → LocalChannel (in-process only)
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// WebSocket URL of the relay (`ws://host:port/bus`).
    #[serde(default)]
    pub relay_url: Option<String>,

    /// Relay server bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Relay server port.
    #[serde(default = "default_relay_port")]
    pub port: u16,

    /// Buffered events per subscriber before the slowest one lags.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_relay_port() -> u16 {
    8766
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for BusSettings {
    fn default() -> Self {
        BusSettings {
            relay_url: None,
            bind_addr: default_bind_addr(),
            port: default_relay_port(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl BusSettings {
    /// Returns the full relay bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

/// Local storage settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite file; an in-memory store is used when absent.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Byte quota for the store.
    #[serde(default)]
    pub quota_bytes: Option<u64>,
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Session identity.
    #[serde(default)]
    pub session: SessionSettings,

    /// Sync behavior settings.
    #[serde(default)]
    pub sync: SyncSettings,

    /// Broadcast bus settings.
    #[serde(default)]
    pub bus: BusSettings,

    /// Local storage settings.
    #[serde(default)]
    pub storage: StorageSettings,
}

impl SyncConfig {
    /// Creates a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
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
            warn!("Failed to load sync config: {}. Using defaults.", e);
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

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        validate_namespace(&self.session.namespace)
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        if self.session.session_id.trim().is_empty() {
            return Err(SyncError::InvalidConfig("session_id must not be empty".into()));
        }

        if let Some(ref raw) = self.sync.server_url {
            let url = url::Url::parse(raw)?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(SyncError::InvalidUrl(format!(
                    "Server URL must start with http:// or https://, got: {}",
                    raw
                )));
            }
        }

        if let Some(ref raw) = self.bus.relay_url {
            let url = url::Url::parse(raw)?;
            if !matches!(url.scheme(), "ws" | "wss") {
                return Err(SyncError::InvalidUrl(format!(
                    "Relay URL must start with ws:// or wss://, got: {}",
                    raw
                )));
            }
        }

        if self.sync.auto_save_interval_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "auto_save_interval_ms must be greater than 0".into(),
            ));
        }

        if self.sync.auto_save_debounce_ms > self.sync.auto_save_max_wait_ms {
            return Err(SyncError::InvalidConfig(
                "auto_save_debounce_ms must not exceed auto_save_max_wait_ms".into(),
            ));
        }

        if self.sync.sync_interval_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "sync_interval_ms must be greater than 0".into(),
            ));
        }

        if self.bus.channel_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "channel_capacity must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("QUOTE_SYNC_SERVER_URL") {
            debug!(url = %url, "Overriding server URL from environment");
            self.sync.server_url = Some(url);
        }

        if let Ok(url) = std::env::var("QUOTE_SYNC_RELAY_URL") {
            debug!(url = %url, "Overriding relay URL from environment");
            self.bus.relay_url = Some(url);
        }

        if let Ok(namespace) = std::env::var("QUOTE_SYNC_NAMESPACE") {
            self.session.namespace = namespace;
        }

        if let Ok(session_id) = std::env::var("QUOTE_SYNC_SESSION_ID") {
            self.session.session_id = session_id;
        }

        if let Ok(path) = std::env::var("QUOTE_SYNC_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }

        if let Ok(ms) = std::env::var("QUOTE_SYNC_AUTO_SAVE_INTERVAL_MS") {
            match ms.parse::<u64>() {
                Ok(v) => self.sync.auto_save_interval_ms = v,
                Err(_) => warn!(value = %ms, "Invalid auto-save interval in environment"),
            }
        }

        if let Ok(flag) = std::env::var("QUOTE_SYNC_CROSS_PROCESS") {
            match flag.to_lowercase().as_str() {
                "1" | "true" | "on" => self.sync.enable_cross_process_sync = true,
                "0" | "false" | "off" => self.sync.enable_cross_process_sync = false,
                _ => warn!(value = %flag, "Unknown cross-process flag in environment"),
            }
        }

        if let Ok(port) = std::env::var("QUOTE_SYNC_RELAY_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                debug!(port = p, "Overriding relay port from environment");
                self.bus.port = p;
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "quote", "quote-sync")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the store namespace.
    pub fn namespace(&self) -> &str {
        &self.session.namespace
    }

    /// Returns the server URL if configured.
    pub fn server_url(&self) -> Option<&str> {
        self.sync.server_url.as_deref()
    }

    /// Returns the relay URL if configured.
    pub fn relay_url(&self) -> Option<&str> {
        self.bus.relay_url.as_deref()
    }

    /// Returns true if the scheduler should run its interval saves.
    pub fn auto_save_enabled(&self) -> bool {
        !self.sync.respect_user_auto_save_preference || self.sync.user_auto_save_enabled
    }

    pub fn auto_save_interval(&self) -> Duration {
        Duration::from_millis(self.sync.auto_save_interval_ms)
    }

    pub fn auto_save_debounce(&self) -> Duration {
        Duration::from_millis(self.sync.auto_save_debounce_ms)
    }

    pub fn auto_save_max_wait(&self) -> Duration {
        Duration::from_millis(self.sync.auto_save_max_wait_ms)
    }

    pub fn max_offline_time(&self) -> Duration {
        Duration::from_millis(self.sync.max_offline_time_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync.sync_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.request_timeout_secs)
    }

    pub fn push_in_flight_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.push_in_flight_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.sync.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.sync.max_backoff_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.namespace(), "quote");
        assert_eq!(config.sync.auto_save_interval_ms, 5_000);
        assert_eq!(config.sync.max_offline_time_ms, 300_000);
        assert!(config.sync.enable_cross_process_sync);
        assert!(config.auto_save_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.sync.server_url = Some("ftp://example.com".into());
        assert!(config.validate().unwrap_err().is_config_error());

        config.sync.server_url = Some("https://example.com/api".into());
        assert!(config.validate().is_ok());

        config.bus.relay_url = Some("http://localhost:8766".into());
        assert!(config.validate().is_err());

        config.bus.relay_url = Some("ws://localhost:8766/bus".into());
        assert!(config.validate().is_ok());

        config.sync.auto_save_debounce_ms = 20_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_user_preference() {
        let mut config = SyncConfig::default();
        config.sync.user_auto_save_enabled = false;
        assert!(!config.auto_save_enabled());

        config.sync.respect_user_auto_save_preference = false;
        assert!(config.auto_save_enabled());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(
            &path,
            r#"
            [session]
            namespace = "acme"

            [sync]
            auto_save_interval_ms = 2000
            "#,
        )
        .unwrap();

        let config = SyncConfig::load(Some(path)).unwrap();
        assert_eq!(config.namespace(), "acme");
        assert_eq!(config.auto_save_interval(), Duration::from_secs(2));
        // Untouched fields keep defaults
        assert_eq!(config.sync.auto_save_debounce_ms, 750);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.toml");

        let mut config = SyncConfig::default();
        config.storage.database_path = Some(dir.path().join("cache.db"));
        config.save(Some(path.clone())).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[sync]"));
        assert!(contents.contains("[bus]"));

        let parsed: SyncConfig = toml::from_str(&contents).unwrap();
        assert_eq!(parsed.storage.database_path, config.storage.database_path);
    }
}
