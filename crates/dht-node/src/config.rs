//! Configuration file management.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Complete node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DhtNodeConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// 0 = OS-assigned ephemeral port.
    #[serde(default)]
    pub listen_port: u16,
    /// Bind address, e.g. `0.0.0.0` or `::`.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Whether IPv6 bootstrap addresses are preferred over IPv4.
    #[serde(default)]
    pub ipv6_enabled: bool,
    /// Run the per-friend NAT hole-punching state machine.
    #[serde(default = "default_true")]
    pub holepunching_enabled: bool,
}

/// Seed nodes contacted on startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub seed_nodes: Vec<SeedNode>,
}

/// One bootstrap seed: a host/port plus its expected public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedNode {
    pub host: String,
    pub port: u16,
    pub public_key: String,
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Save file path. Empty = platform default data directory.
    #[serde(default)]
    pub save_path: String,
    /// How often the DHT state is flushed to disk, in seconds.
    #[serde(default = "default_save_interval")]
    pub save_interval_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing-subscriber` `EnvFilter` directive, e.g. "dht_core=debug,info".
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_save_interval() -> u64 {
    60
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            bind_address: default_bind_address(),
            ipv6_enabled: false,
            holepunching_enabled: true,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            save_path: String::new(),
            save_interval_secs: default_save_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl DhtNodeConfig {
    /// Load configuration from the default config file location, falling
    /// back to defaults if the file does not exist.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: DhtNodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_path(&self) -> PathBuf {
        if self.persistence.save_path.is_empty() {
            Self::default_data_dir().join("dht.save")
        } else {
            PathBuf::from(&self.persistence.save_path)
        }
    }

    fn config_path() -> PathBuf {
        if let Ok(dir) = std::env::var("MERIDIAN_DHT_DATA_DIR") {
            return PathBuf::from(dir).join("config.toml");
        }
        Self::default_data_dir().join("config.toml")
    }

    fn default_data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("MERIDIAN_DHT_DATA_DIR") {
            return PathBuf::from(dir);
        }
        std::env::var("HOME")
            .map(|h| PathBuf::from(h).join(".meridian-dht"))
            .unwrap_or_else(|_| PathBuf::from("/tmp/meridian-dht"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DhtNodeConfig::default();
        assert_eq!(config.network.listen_port, 0);
        assert!(config.network.holepunching_enabled);
        assert_eq!(config.persistence.save_interval_secs, 60);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn test_config_round_trip() {
        let config = DhtNodeConfig::default();
        let toml_str = toml::to_string(&config).expect("serialize");
        let parsed: DhtNodeConfig = toml::from_str(&toml_str).expect("parse");
        assert_eq!(parsed.network.bind_address, config.network.bind_address);
    }
}
