//! Configuration management for Ghosty

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Complete Ghosty configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GhostyConfig {
    /// Names (or paths) of the external executables
    pub tools: ToolSettings,
    /// Interface identity settings
    pub identity: IdentitySettings,
    /// Tunnel client settings
    pub tunnel: TunnelSettings,
    /// Anonymity network settings
    pub anonymity: AnonymitySettings,
    /// Background host sampling
    pub monitor: MonitorSettings,
}

/// External executables invoked by the managers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    /// Hardware address changer
    pub macchanger: String,
    /// Link state utility
    pub ip: String,
    /// Tunnel client
    pub openvpn: String,
    /// Anonymity network daemon
    pub tor: String,
    /// Primary service manager
    pub systemctl: String,
    /// Fallback service control
    pub service: String,
    /// Circuit rotation helper
    pub tornet: String,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            macchanger: "macchanger".to_string(),
            ip: "ip".to_string(),
            openvpn: "openvpn".to_string(),
            tor: "tor".to_string(),
            systemctl: "systemctl".to_string(),
            service: "service".to_string(),
            tornet: "tornet".to_string(),
        }
    }
}

/// Interface identity settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    /// Directory exposing one entry per network interface
    pub sysfs_net_dir: PathBuf,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            sysfs_net_dir: PathBuf::from("/sys/class/net"),
        }
    }
}

/// Tunnel client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    /// Wait after spawning before sampling the client's liveness, in milliseconds
    pub startup_grace_ms: u64,
    /// Graceful termination window before a forced kill, in milliseconds
    pub stop_timeout_ms: u64,
    /// Wait after a successful connect before the next activation step, in milliseconds
    pub establish_settle_ms: u64,
    /// Arguments appended to every client invocation
    pub extra_args: Vec<String>,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            startup_grace_ms: 2_000,
            stop_timeout_ms: 10_000,
            establish_settle_ms: 8_000,
            extra_args: vec![
                "--script-security".to_string(),
                "2".to_string(),
                "--up".to_string(),
                "/etc/openvpn/update-resolv-conf".to_string(),
                "--down".to_string(),
                "/etc/openvpn/update-resolv-conf".to_string(),
            ],
        }
    }
}

impl TunnelSettings {
    /// Startup grace period
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    /// Graceful termination timeout
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Post-connect settle period
    pub fn establish_settle(&self) -> Duration {
        Duration::from_millis(self.establish_settle_ms)
    }
}

/// Anonymity network settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnonymitySettings {
    /// System service unit name
    pub service_name: String,
    /// Wait after starting the service before re-checking it, in milliseconds
    pub service_settle_ms: u64,
    /// Wait between service start and rotation start in a full start, in milliseconds
    pub full_settle_ms: u64,
    /// Seconds between circuit rotations
    pub rotation_interval_secs: u64,
    /// Number of rotations, 0 meaning unbounded
    pub rotation_count: u64,
    /// Graceful termination window for the rotation tool, in milliseconds
    pub rotation_stop_timeout_ms: u64,
    /// Control port of the anonymity service
    pub control_addr: SocketAddr,
    /// Control port password, if the service requires one
    pub control_password: Option<String>,
}

impl Default for AnonymitySettings {
    fn default() -> Self {
        Self {
            service_name: "tor".to_string(),
            service_settle_ms: 5_000,
            full_settle_ms: 8_000,
            rotation_interval_secs: 5,
            rotation_count: 0,
            rotation_stop_timeout_ms: 5_000,
            control_addr: SocketAddr::from(([127, 0, 0, 1], 9051)),
            control_password: None,
        }
    }
}

impl AnonymitySettings {
    /// Service settle period
    pub fn service_settle(&self) -> Duration {
        Duration::from_millis(self.service_settle_ms)
    }

    /// Settle period between service start and rotation start
    pub fn full_settle(&self) -> Duration {
        Duration::from_millis(self.full_settle_ms)
    }

    /// Rotation tool termination timeout
    pub fn rotation_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.rotation_stop_timeout_ms)
    }
}

/// Background host sampling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Interval between samples, in milliseconds
    pub sample_interval_ms: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            sample_interval_ms: 10_000,
        }
    }
}

impl MonitorSettings {
    /// Sampling interval
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

impl GhostyConfig {
    /// Load configuration from a TOML or JSON file (by extension)
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: GhostyConfig = if is_json(path) {
            serde_json::from_str(&content)
                .map_err(|e| ConfigError::Parse(format!("JSON: {}", e)))?
        } else {
            toml::from_str(&content).map_err(|e| ConfigError::Parse(format!("TOML: {}", e)))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML or JSON file (by extension)
    pub fn save_to_file(&self, path: &Path) -> ConfigResult<()> {
        let content = if is_json(path) {
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        };

        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Default config file locations, most specific first
    pub fn default_config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".ghosty").join("config.toml"));
            paths.push(home.join(".ghosty").join("config.json"));
        }

        paths.push(PathBuf::from("/etc/ghosty/config.toml"));
        paths.push(PathBuf::from("/etc/ghosty/config.json"));

        paths
    }

    /// Load the first config found in the default locations, or the defaults
    pub fn load_default() -> ConfigResult<Self> {
        for path in Self::default_config_paths() {
            if path.exists() {
                return Self::load_from_file(&path);
            }
        }

        Ok(Self::default())
    }

    /// Validate configuration
    pub fn validate(&self) -> ConfigResult<()> {
        let tools = [
            ("macchanger", &self.tools.macchanger),
            ("ip", &self.tools.ip),
            ("openvpn", &self.tools.openvpn),
            ("tor", &self.tools.tor),
            ("systemctl", &self.tools.systemctl),
            ("service", &self.tools.service),
            ("tornet", &self.tools.tornet),
        ];
        for (name, value) in tools {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("tools.{} must not be empty", name)));
            }
        }

        if self.tunnel.stop_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "tunnel.stop_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.anonymity.service_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "anonymity.service_name must not be empty".to_string(),
            ));
        }

        if self.anonymity.rotation_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "anonymity.rotation_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.anonymity.rotation_stop_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "anonymity.rotation_stop_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.monitor.sample_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "monitor.sample_interval_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Write an example configuration file
    pub fn create_example_config(path: &Path) -> ConfigResult<()> {
        let mut config = Self::default();
        config.anonymity.control_password = Some("change-me".to_string());
        config.save_to_file(path)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension() == Some(std::ffi::OsStr::new("json"))
}
