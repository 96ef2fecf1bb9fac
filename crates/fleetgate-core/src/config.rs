//! Configuration management for the fleetgate ingestion backend

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listener configuration (one socket per protocol)
    pub listeners: ListenerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Session TTLs and sweeping
    pub sessions: SessionConfig,

    /// Device auto-provisioning policy
    pub provisioning: ProvisioningConfig,

    /// Firmware bootloading
    #[serde(default)]
    pub firmware: FirmwareConfig,

    /// Panic-notification gateway
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Listening sockets, one per protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Host to bind all sockets to
    #[serde(default = "default_host")]
    pub host: String,

    /// AVL/Bluetooth UDP port
    #[serde(default = "default_avl_port")]
    pub avl_port: u16,

    /// Legacy AVL UDP port, still answered for old gateways
    #[serde(default = "default_avl_legacy_port")]
    pub avl_legacy_port: Option<u16>,

    /// Concox TCP port
    #[serde(default = "default_concox_port")]
    pub concox_port: u16,

    /// Meiligao UDP port
    #[serde(default = "default_meiligao_port")]
    pub meiligao_port: u16,

    /// Wialon text TCP port
    #[serde(default = "default_wialon_port")]
    pub wialon_port: u16,

    /// Satellite uplink TCP port
    #[serde(default = "default_satellite_port")]
    pub satellite_port: u16,

    /// Poll interval for idle detection on TCP connections, seconds
    #[serde(default = "default_read_tick_secs")]
    pub read_tick_secs: u64,

    /// Total silence after which a TCP connection is closed, seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Drain window granted to in-flight handlers on shutdown, seconds
    #[serde(default = "default_drain_secs")]
    pub drain_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

/// Session TTLs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// TTL for AVL sessions, seconds (refreshed on every valid packet)
    #[serde(default = "default_avl_ttl_secs")]
    pub avl_ttl_secs: u64,

    /// TTL for stream-protocol sessions, seconds
    #[serde(default = "default_stream_ttl_secs")]
    pub stream_ttl_secs: u64,

    /// How often expired sessions are swept, seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Device auto-provisioning policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// Create devices on first valid login from an unknown IMEI
    #[serde(default = "default_auto_provision")]
    pub auto_provision: bool,

    /// Harness profile assigned to auto-provisioned devices
    #[serde(default = "default_harness")]
    pub default_harness: String,

    /// Shared login token checked by the Wialon engine when set
    #[serde(default)]
    pub shared_token: Option<String>,
}

/// Firmware bootloading configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirmwareConfig {
    /// Path to the vendor hex-row firmware image; bootloading is
    /// disabled when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Panic-notification gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Webhook URL messages are POSTed to; notifications are disabled
    /// when unset
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Bearer token sent with each webhook call
    #[serde(default)]
    pub token: Option<String>,

    /// Per-call timeout, seconds; must stay short so ingestion never
    /// stalls behind the gateway
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            token: None,
            timeout_secs: default_notify_timeout_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json or text)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_avl_port() -> u16 {
    60000
}

const fn default_avl_legacy_port() -> Option<u16> {
    Some(61000)
}

const fn default_concox_port() -> u16 {
    55300
}

const fn default_meiligao_port() -> u16 {
    62000
}

const fn default_wialon_port() -> u16 {
    20332
}

const fn default_satellite_port() -> u16 {
    15557
}

const fn default_read_tick_secs() -> u64 {
    2
}

const fn default_idle_timeout_secs() -> u64 {
    360
}

const fn default_drain_secs() -> u64 {
    5
}

const fn default_max_connections() -> u32 {
    50
}

const fn default_min_connections() -> u32 {
    5
}

const fn default_connect_timeout() -> u64 {
    30
}

const fn default_idle_timeout() -> u64 {
    600
}

const fn default_avl_ttl_secs() -> u64 {
    36_000 // 10 h
}

const fn default_stream_ttl_secs() -> u64 {
    3_600
}

const fn default_sweep_interval_secs() -> u64 {
    60
}

const fn default_auto_provision() -> bool {
    true
}

fn default_harness() -> String {
    "default".to_string()
}

const fn default_notify_timeout_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Config {
    /// Load configuration from an optional file plus `FLEETGATE_*`
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded or parsed.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(path) => builder.add_source(config::File::from(path)),
            None => builder.add_source(config::File::with_name("fleetgate").required(false)),
        };

        let config = builder
            .add_source(config::Environment::with_prefix("FLEETGATE").separator("__"))
            .build()
            .map_err(|e| crate::Error::Configuration {
                message: e.to_string(),
            })?;

        config
            .try_deserialize()
            .map_err(|e| crate::Error::Configuration {
                message: e.to_string(),
            })
    }
}

impl Default for Config {
    fn default() -> Self {
        let database_url = std::env::var("FLEETGATE_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .unwrap_or_else(|_| "postgresql://localhost/fleetgate".to_string());

        Self {
            listeners: ListenerConfig {
                host: default_host(),
                avl_port: default_avl_port(),
                avl_legacy_port: default_avl_legacy_port(),
                concox_port: default_concox_port(),
                meiligao_port: default_meiligao_port(),
                wialon_port: default_wialon_port(),
                satellite_port: default_satellite_port(),
                read_tick_secs: default_read_tick_secs(),
                idle_timeout_secs: default_idle_timeout_secs(),
                drain_secs: default_drain_secs(),
            },
            database: DatabaseConfig {
                url: database_url,
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout: default_connect_timeout(),
                idle_timeout: default_idle_timeout(),
            },
            sessions: SessionConfig {
                avl_ttl_secs: default_avl_ttl_secs(),
                stream_ttl_secs: default_stream_ttl_secs(),
                sweep_interval_secs: default_sweep_interval_secs(),
            },
            provisioning: ProvisioningConfig {
                auto_provision: default_auto_provision(),
                default_harness: default_harness(),
                shared_token: None,
            },
            firmware: FirmwareConfig::default(),
            notifier: NotifierConfig::default(),
            logging: LoggingConfig {
                level: default_log_level(),
                format: default_log_format(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.listeners.host, "0.0.0.0");
        assert_eq!(config.listeners.avl_port, 60000);
        assert_eq!(config.listeners.avl_legacy_port, Some(61000));
        assert_eq!(config.listeners.concox_port, 55300);
        assert_eq!(config.listeners.meiligao_port, 62000);
        assert_eq!(config.listeners.wialon_port, 20332);
        assert_eq!(config.listeners.satellite_port, 15557);
        assert_eq!(config.listeners.read_tick_secs, 2);
        assert_eq!(config.listeners.idle_timeout_secs, 360);

        assert!(config.database.url.contains("postgresql"));
        assert_eq!(config.database.max_connections, 50);

        assert_eq!(config.sessions.avl_ttl_secs, 36_000);
        assert_eq!(config.sessions.stream_ttl_secs, 3_600);

        assert!(config.provisioning.auto_provision);
        assert_eq!(config.provisioning.default_harness, "default");
        assert!(config.provisioning.shared_token.is_none());

        assert!(config.firmware.path.is_none());
        assert!(config.notifier.webhook_url.is_none());
        assert_eq!(config.notifier.timeout_secs, 5);

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_config_serialization_round_trip() {
        let config = Config::default();

        let serialized = serde_json::to_string(&config).unwrap();
        let deserialized: Config = serde_json::from_str(&serialized).unwrap();

        assert_eq!(deserialized.listeners.avl_port, config.listeners.avl_port);
        assert_eq!(
            deserialized.sessions.avl_ttl_secs,
            config.sessions.avl_ttl_secs
        );
        assert_eq!(
            deserialized.provisioning.auto_provision,
            config.provisioning.auto_provision
        );
    }

    #[test]
    fn test_partial_config_deserialization() {
        let json_str = r#"{
            "listeners": {"host": "127.0.0.1", "concox_port": 5023},
            "database": {"url": "postgresql://test"},
            "sessions": {},
            "provisioning": {"auto_provision": false},
            "logging": {}
        }"#;

        let config: Config = serde_json::from_str(json_str).unwrap();

        assert_eq!(config.listeners.host, "127.0.0.1");
        assert_eq!(config.listeners.concox_port, 5023);
        assert_eq!(config.listeners.avl_port, 60000); // default
        assert_eq!(config.database.url, "postgresql://test");
        assert!(!config.provisioning.auto_provision);
        assert_eq!(config.provisioning.default_harness, "default"); // default
        assert_eq!(config.logging.level, "info"); // default
    }

    #[test]
    fn test_ttl_sanity() {
        let config = Config::default();
        assert!(config.sessions.avl_ttl_secs > config.sessions.stream_ttl_secs);
        assert!(config.listeners.idle_timeout_secs > config.listeners.read_tick_secs);
    }
}
