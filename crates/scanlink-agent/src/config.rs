//! # Agent Configuration
//!
//! Configuration management for the edge agent.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     SCANLINK_HUB_URL=https://hub.example.com/api                       │
//! │     SCANLINK_API_KEY=...                                               │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/scanlink/scanlink.toml (Linux)                           │
//! │     or the path given on the command line                              │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The loaded config is immutable: it is wrapped in an `Arc` by the
//! supervisor and handed to each worker at construction.
//!
//! ## Configuration File Format
//! ```toml
//! [device]
//! name = "Dock door 3"
//!
//! [storage]
//! database_path = "/var/lib/scanlink/events.db"
//! capacity = 100000
//!
//! [hub]
//! url = "https://hub.example.com/api"
//! api_key = "..."
//!
//! [connectivity]
//! probe_interval_secs = 15
//! debounce_count = 2
//!
//! [[forwarder.channels]]
//! kind = "usb_hid"
//! device = "/dev/hidg0"
//!
//! [[forwarder.channels]]
//! kind = "file"
//! path = "/var/log/scanlink/scans.log"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{AgentError, AgentResult};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
///
/// There is no id here: the device id is derived from hardware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Human-readable device name, used in logs only.
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "ScanLink Edge".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

/// Event store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite file. Defaults to the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Ceiling on outstanding (undelivered, non-failed) events.
    #[serde(default = "default_capacity")]
    pub capacity: u64,
}

fn default_capacity() -> u64 {
    100_000
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            database_path: None,
            capacity: default_capacity(),
        }
    }
}

// =============================================================================
// Hub Settings
// =============================================================================

/// Registry / hub endpoint settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubSettings {
    /// Base URL of the registry and hub API.
    #[serde(default)]
    pub url: Option<String>,

    /// Fleet API key presented on registration.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Timeout for register / provision / deliver calls (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    10
}

// =============================================================================
// Connectivity Settings
// =============================================================================

/// Connectivity monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivitySettings {
    /// Interval between probes of each layer (seconds).
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// Consecutive consistent results before a layer changes state.
    #[serde(default = "default_debounce_count")]
    pub debounce_count: u32,

    /// Local segment probe target (`host:port`). Defaults to the default
    /// gateway from the routing table.
    #[serde(default)]
    pub local_target: Option<String>,

    /// Internet probe targets (`host:port`); any one answering is enough.
    #[serde(default = "default_internet_targets")]
    pub internet_targets: Vec<String>,

    #[serde(default = "default_local_timeout")]
    pub local_timeout_ms: u64,

    #[serde(default = "default_internet_timeout")]
    pub internet_timeout_ms: u64,

    #[serde(default = "default_hub_timeout")]
    pub hub_timeout_ms: u64,
}

fn default_probe_interval() -> u64 {
    15
}
fn default_debounce_count() -> u32 {
    2
}
fn default_internet_targets() -> Vec<String> {
    vec!["1.1.1.1:53".to_string(), "8.8.8.8:53".to_string()]
}
fn default_local_timeout() -> u64 {
    1_000
}
fn default_internet_timeout() -> u64 {
    3_000
}
fn default_hub_timeout() -> u64 {
    5_000
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        ConnectivitySettings {
            probe_interval_secs: default_probe_interval(),
            debounce_count: default_debounce_count(),
            local_target: None,
            internet_targets: default_internet_targets(),
            local_timeout_ms: default_local_timeout(),
            internet_timeout_ms: default_internet_timeout(),
            hub_timeout_ms: default_hub_timeout(),
        }
    }
}

impl ConnectivitySettings {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

// =============================================================================
// Registration Settings
// =============================================================================

/// Registration driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationSettings {
    /// First retry delay after a transient failure (seconds).
    #[serde(default = "default_registration_base")]
    pub backoff_base_secs: u64,

    /// Longest retry delay (seconds).
    #[serde(default = "default_registration_cap")]
    pub backoff_cap_secs: u64,

    /// Re-evaluation floor when nothing else wakes the driver (seconds).
    #[serde(default = "default_registration_floor")]
    pub timer_floor_secs: u64,
}

fn default_registration_base() -> u64 {
    5
}
fn default_registration_cap() -> u64 {
    300
}
fn default_registration_floor() -> u64 {
    60
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        RegistrationSettings {
            backoff_base_secs: default_registration_base(),
            backoff_cap_secs: default_registration_cap(),
            timer_floor_secs: default_registration_floor(),
        }
    }
}

// =============================================================================
// Delivery Settings
// =============================================================================

/// Delivery engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySettings {
    /// Events examined per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Per-event retry base delay (seconds).
    #[serde(default = "default_retry_base")]
    pub retry_base_secs: u64,

    /// Per-event retry cap (seconds).
    #[serde(default = "default_retry_cap")]
    pub retry_cap_secs: u64,

    /// Cycle floor when nothing else wakes the engine (seconds).
    #[serde(default = "default_delivery_floor")]
    pub timer_floor_secs: u64,
}

fn default_batch_size() -> u32 {
    50
}
fn default_retry_base() -> u64 {
    2
}
fn default_retry_cap() -> u64 {
    300
}
fn default_delivery_floor() -> u64 {
    30
}

impl Default for DeliverySettings {
    fn default() -> Self {
        DeliverySettings {
            batch_size: default_batch_size(),
            retry_base_secs: default_retry_base(),
            retry_cap_secs: default_retry_cap(),
            timer_floor_secs: default_delivery_floor(),
        }
    }
}

// =============================================================================
// Forwarder Settings
// =============================================================================

/// One local output channel.
///
/// The list order in the config file is the fan-out order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelConfig {
    /// USB HID keyboard gadget.
    UsbHid {
        #[serde(default = "default_hid_device")]
        device: PathBuf,
    },

    /// Serial port. `port = None` picks the first USB serial adapter.
    Serial {
        #[serde(default)]
        port: Option<String>,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },

    /// HTTP endpoint on the local network.
    Network { url: String },

    /// X11 clipboard via xclip / xsel.
    Clipboard,

    /// Append-only file sink.
    File { path: PathBuf },
}

fn default_hid_device() -> PathBuf {
    PathBuf::from("/dev/hidg0")
}

fn default_baud_rate() -> u32 {
    9600
}

/// Output forwarder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between channel availability checks (seconds).
    #[serde(default = "default_availability_interval")]
    pub availability_interval_secs: u64,

    /// Upper bound on a single channel send (milliseconds).
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,

    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,
}

fn default_true() -> bool {
    true
}
fn default_availability_interval() -> u64 {
    60
}
fn default_send_timeout() -> u64 {
    2_000
}
fn default_channels() -> Vec<ChannelConfig> {
    vec![
        ChannelConfig::UsbHid {
            device: default_hid_device(),
        },
        ChannelConfig::Serial {
            port: None,
            baud_rate: default_baud_rate(),
        },
        ChannelConfig::Clipboard,
    ]
}

impl Default for ForwarderSettings {
    fn default() -> Self {
        ForwarderSettings {
            enabled: true,
            availability_interval_secs: default_availability_interval(),
            send_timeout_ms: default_send_timeout(),
            channels: default_channels(),
        }
    }
}

// =============================================================================
// Supervisor Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSettings {
    /// How long in-flight calls may run after a shutdown signal (seconds).
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_shutdown_grace() -> u64 {
    10
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        SupervisorSettings {
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

// =============================================================================
// Main Agent Configuration
// =============================================================================

/// Complete agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub hub: HubSettings,

    #[serde(default)]
    pub connectivity: ConnectivitySettings,

    #[serde(default)]
    pub registration: RegistrationSettings,

    #[serde(default)]
    pub delivery: DeliverySettings,

    #[serde(default)]
    pub forwarder: ForwarderSettings,

    #[serde(default)]
    pub supervisor: SupervisorSettings,
}

impl AgentConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (scanlink.toml)
    /// 3. Environment variables
    ///
    /// Fails with a configuration error if the result cannot run the agent.
    pub fn load(config_path: Option<PathBuf>) -> AgentResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading agent config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = Self::from_toml_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parses a TOML document without environment overrides or validation.
    pub fn from_toml_str(contents: &str) -> AgentResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> AgentResult<()> {
        let url = self
            .hub
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or(AgentError::MissingSetting("hub.url"))?;

        let parsed = Url::parse(url)?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(AgentError::InvalidUrl(format!(
                "Hub URL must start with http:// or https://, got: {}",
                url
            )));
        }

        if self
            .hub
            .api_key
            .as_deref()
            .map_or(true, |k| k.trim().is_empty())
        {
            return Err(AgentError::MissingSetting("hub.api_key"));
        }

        if self.storage.capacity == 0 {
            return Err(AgentError::InvalidConfig(
                "storage.capacity must be greater than 0".into(),
            ));
        }

        if self.delivery.batch_size == 0 {
            return Err(AgentError::InvalidConfig(
                "delivery.batch_size must be greater than 0".into(),
            ));
        }

        if self.connectivity.debounce_count == 0 {
            return Err(AgentError::InvalidConfig(
                "connectivity.debounce_count must be greater than 0".into(),
            ));
        }

        if self.connectivity.probe_interval_secs == 0 {
            return Err(AgentError::InvalidConfig(
                "connectivity.probe_interval_secs must be greater than 0".into(),
            ));
        }

        for channel in &self.forwarder.channels {
            if let ChannelConfig::Network { url } = channel {
                Url::parse(url).map_err(|e| {
                    AgentError::InvalidConfig(format!("forwarder network url '{}': {}", url, e))
                })?;
            }
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("SCANLINK_HUB_URL") {
            debug!(url = %url, "Overriding hub URL from environment");
            self.hub.url = Some(url);
        }

        if let Ok(key) = std::env::var("SCANLINK_API_KEY") {
            debug!("Overriding hub API key from environment");
            self.hub.api_key = Some(key);
        }

        if let Ok(path) = std::env::var("SCANLINK_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.storage.database_path = Some(PathBuf::from(path));
        }

        if let Ok(name) = std::env::var("SCANLINK_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Ok(capacity) = std::env::var("SCANLINK_STORE_CAPACITY") {
            match capacity.parse::<u64>() {
                Ok(c) => self.storage.capacity = c,
                Err(_) => warn!(value = %capacity, "Ignoring non-numeric SCANLINK_STORE_CAPACITY"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "scanlink", "scanlink")
            .map(|dirs| dirs.config_dir().join("scanlink.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the event database path, falling back to the platform data
    /// directory and finally the working directory.
    pub fn database_path(&self) -> PathBuf {
        if let Some(path) = &self.storage.database_path {
            return path.clone();
        }

        directories::ProjectDirs::from("com", "scanlink", "scanlink")
            .map(|dirs| dirs.data_dir().join("events.db"))
            .unwrap_or_else(|| PathBuf::from("scanlink-events.db"))
    }

    /// Returns the hub base URL. Empty only on an unvalidated config.
    pub fn hub_url(&self) -> &str {
        self.hub.url.as_deref().unwrap_or_default()
    }

    pub fn api_key(&self) -> &str {
        self.hub.api_key.as_deref().unwrap_or_default()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.hub.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.supervisor.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.hub.url = Some("https://hub.example.com/api".to_string());
        config.hub.api_key = Some("fleet-key".to_string());
        config
    }

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.connectivity.probe_interval_secs, 15);
        assert_eq!(config.connectivity.debounce_count, 2);
        assert_eq!(config.registration.backoff_base_secs, 5);
        assert_eq!(config.registration.backoff_cap_secs, 300);
        assert_eq!(config.delivery.batch_size, 50);
        assert_eq!(config.forwarder.channels.len(), 3);
    }

    #[test]
    fn test_missing_credentials_are_fatal() {
        let config = AgentConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.is_config_error());

        let mut config = valid();
        config.hub.api_key = Some("   ".to_string());
        assert!(matches!(
            config.validate(),
            Err(AgentError::MissingSetting("hub.api_key"))
        ));
    }

    #[test]
    fn test_config_validation() {
        let mut config = valid();
        assert!(config.validate().is_ok());

        config.hub.url = Some("ws://hub.example.com".to_string());
        assert!(config.validate().is_err());

        config = valid();
        config.storage.capacity = 0;
        assert!(config.validate().is_err());

        config = valid();
        config.connectivity.debounce_count = 0;
        assert!(config.validate().is_err());

        config = valid();
        config.forwarder.channels = vec![ChannelConfig::Network {
            url: "not a url".to_string(),
        }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let config = AgentConfig::from_toml_str(
            r#"
            [hub]
            url = "http://10.0.0.5:8080"
            api_key = "k"

            [delivery]
            batch_size = 10

            [[forwarder.channels]]
            kind = "file"
            path = "/tmp/scans.log"

            [[forwarder.channels]]
            kind = "serial"
            port = "/dev/ttyACM0"
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.delivery.batch_size, 10);
        assert_eq!(config.delivery.retry_cap_secs, 300);
        assert_eq!(
            config.forwarder.channels,
            vec![
                ChannelConfig::File {
                    path: PathBuf::from("/tmp/scans.log")
                },
                ChannelConfig::Serial {
                    port: Some("/dev/ttyACM0".to_string()),
                    baud_rate: 9600
                },
            ]
        );
    }

    #[test]
    fn test_explicit_database_path_wins() {
        let mut config = valid();
        config.storage.database_path = Some(PathBuf::from("/data/events.db"));
        assert_eq!(config.database_path(), PathBuf::from("/data/events.db"));
    }
}
