//! Configuration file support for natrouterd
//!
//! Loads and validates daemon settings from TOML files. Router parameters
//! (SSIDs, passwords, port mappings) live in the Persistent Store instead.
//! Default location: /etc/natrouter/natrouterd.toml

use router_common::{RouterError, RouterResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/natrouter/natrouterd.toml";

/// Persistent Store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON file backing the store
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Namespace of the router parameters
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

/// Linux interface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Upstream (station) interface name
    #[serde(default = "default_upstream_if")]
    pub upstream: String,

    /// Downstream (access point) interface name
    #[serde(default = "default_downstream_if")]
    pub downstream: String,

    /// Upstream join wait at boot in milliseconds
    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,

    /// Link/address poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

/// Helper daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Directory for generated hostapd/wpa_supplicant/dnsmasq files
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,

    /// Resolver file written by the upstream DHCP client
    #[serde(default = "default_resolv_conf")]
    pub resolv_conf: PathBuf,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log level (overridden by RUST_LOG)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Complete natrouterd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub interfaces: InterfaceConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

// Default functions
fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/natrouter/store.json")
}

fn default_namespace() -> String {
    router_common::keys::PARAM_NAMESPACE.to_string()
}

fn default_upstream_if() -> String {
    "wlan0".to_string()
}

fn default_downstream_if() -> String {
    "wlan1".to_string()
}

fn default_join_timeout() -> u64 {
    2000
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("/run/natrouter")
}

fn default_resolv_conf() -> PathBuf {
    PathBuf::from("/etc/resolv.conf")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            namespace: default_namespace(),
        }
    }
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            upstream: default_upstream_if(),
            downstream: default_downstream_if(),
            join_timeout_ms: default_join_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            run_dir: default_run_dir(),
            resolv_conf: default_resolv_conf(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> RouterResult<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                RouterError::invalid_config(
                    path.display().to_string(),
                    format!("failed to parse: {}", e),
                )
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(RouterError::invalid_config(
                path.display().to_string(),
                e.to_string(),
            )),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> RouterResult<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    /// Upstream join wait as Duration
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.interfaces.join_timeout_ms)
    }

    /// Poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.interfaces.poll_interval_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> RouterResult<()> {
        if self.interfaces.join_timeout_ms == 0 {
            return Err(RouterError::invalid_config(
                "interfaces.join_timeout_ms",
                "must be > 0",
            ));
        }

        if self.interfaces.poll_interval_ms == 0 {
            return Err(RouterError::invalid_config(
                "interfaces.poll_interval_ms",
                "must be > 0",
            ));
        }

        if self.interfaces.upstream.is_empty() || self.interfaces.downstream.is_empty() {
            return Err(RouterError::invalid_config(
                "interfaces",
                "interface names must not be empty",
            ));
        }

        if self.interfaces.upstream == self.interfaces.downstream {
            return Err(RouterError::invalid_config(
                "interfaces",
                "upstream and downstream must be different interfaces",
            ));
        }

        if self.store.namespace.is_empty() {
            return Err(RouterError::invalid_config("store.namespace", "must not be empty"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.store.namespace, "nat_router");
        assert_eq!(config.interfaces.upstream, "wlan0");
        assert_eq!(config.interfaces.downstream, "wlan1");
        assert_eq!(config.join_timeout(), Duration::from_millis(2000));
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[interfaces]\nupstream = \"wlp2s0\"\n\n[logging]\nlevel = \"debug\"").unwrap();

        let config = DaemonConfig::load_or_default(file.path()).unwrap();
        assert_eq!(config.interfaces.upstream, "wlp2s0");
        assert_eq!(config.interfaces.downstream, "wlan1");
        assert_eq!(config.interfaces.join_timeout_ms, 2000);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.store.path, PathBuf::from("/var/lib/natrouter/store.json"));
    }

    #[test]
    fn test_malformed_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[interfaces\nupstream = ").unwrap();
        assert!(matches!(
            DaemonConfig::load_or_default(file.path()),
            Err(RouterError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut config = DaemonConfig::default();
        config.interfaces.join_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_same_interface() {
        let mut config = DaemonConfig::default();
        config.interfaces.downstream = "wlan0".to_string();
        assert!(config.validate().is_err());
    }
}
