//! Server configuration management

use crate::usb::DesiredBoundStore;
use anyhow::{Context, Result, anyhow};
use protocol::BusId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// System-wide configuration file
pub const SYSTEM_CONFIG_PATH: &str = "/etc/usbctl/config.toml";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub devices: DeviceSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Listen address, `host:port`
    pub bind_addr: String,
    pub poll_interval_secs: u64,
    /// Idle window before a stream heartbeat
    pub heartbeat_secs: u64,
    /// Deadline for receiving a complete request
    pub request_timeout_secs: u64,
    /// Deadline for a single response or frame write
    pub write_timeout_secs: u64,
    pub max_subscribers: usize,
    pub log_level: String,
    /// Append logs to this file instead of stderr
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:11980".to_string(),
            poll_interval_secs: 3,
            heartbeat_secs: 30,
            request_timeout_secs: 15,
            write_timeout_secs: 15,
            max_subscribers: crate::network::DEFAULT_MAX_SUBSCRIBERS,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub max_devices: usize,
    /// usbip-host driver directory in sysfs
    pub driver_dir: PathBuf,
    /// Resolve unknown vendors with lsusb
    pub enrich_with_lsusb: bool,
    pub command_timeout_secs: u64,
    /// Busids to keep bound across restarts
    pub bound: Vec<String>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            max_devices: crate::usb::DEFAULT_MAX_DEVICES,
            driver_dir: PathBuf::from(crate::usb::DEFAULT_DRIVER_DIR),
            enrich_with_lsusb: true,
            command_timeout_secs: 10,
            bound: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        tracing::info!("Loaded configuration from: {}", path.display());
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Per-user configuration path
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("usbctl").join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        let level = self.server.log_level.to_ascii_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.server.log_level,
                VALID_LOG_LEVELS.join(", ")
            ));
        }

        self.bind_addr()?;

        for (name, value) in [
            ("server.poll_interval_secs", self.server.poll_interval_secs),
            ("server.heartbeat_secs", self.server.heartbeat_secs),
            ("server.request_timeout_secs", self.server.request_timeout_secs),
            ("server.write_timeout_secs", self.server.write_timeout_secs),
            ("server.max_subscribers", self.server.max_subscribers as u64),
            ("devices.max_devices", self.devices.max_devices as u64),
            ("devices.command_timeout_secs", self.devices.command_timeout_secs),
        ] {
            if value == 0 {
                return Err(anyhow!("{} must be greater than zero", name));
            }
        }

        self.desired_bound()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind_addr
            .parse()
            .with_context(|| format!("Invalid bind address '{}'", self.server.bind_addr))
    }

    /// Replace the port of the listen address
    pub fn set_port(&mut self, port: u16) -> Result<()> {
        let mut addr = self.bind_addr()?;
        addr.set_port(port);
        self.server.bind_addr = addr.to_string();
        Ok(())
    }

    /// Replace the host part of the listen address, keeping the port
    pub fn set_host(&mut self, host: &str) -> Result<()> {
        let port = self.bind_addr()?.port();
        let ip: std::net::IpAddr = host
            .parse()
            .with_context(|| format!("Invalid bind address '{}'", host))?;
        self.server.bind_addr = SocketAddr::new(ip, port).to_string();
        Ok(())
    }

    /// Replace the log level, rejecting anything but a plain level name
    pub fn set_log_level(&mut self, level: &str) -> Result<()> {
        let lower = level.to_ascii_lowercase();
        if !VALID_LOG_LEVELS.contains(&lower.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                level,
                VALID_LOG_LEVELS.join(", ")
            ));
        }
        self.server.log_level = lower;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.server.poll_interval_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.server.heartbeat_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.server.write_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.devices.command_timeout_secs)
    }

    /// The configured bound set, every entry validated
    pub fn desired_bound(&self) -> Result<BTreeSet<BusId>> {
        self.devices
            .bound
            .iter()
            .map(|raw| {
                BusId::parse(raw)
                    .with_context(|| format!("Invalid busid '{}' in devices.bound", raw))
            })
            .collect()
    }
}

/// A configuration together with where it came from
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: ServerConfig,
    /// Where the configuration is saved to; `None` keeps it in memory only
    pub path: Option<PathBuf>,
    /// Whether `path` existed and was read
    pub from_file: bool,
}

/// Resolve and load the configuration
///
/// An explicit path (tilde-expanded) is used as-is; if it does not exist yet
/// the defaults are used and the path becomes the save target. Otherwise the
/// per-user file and then [`SYSTEM_CONFIG_PATH`] are tried.
pub fn load_config(explicit: Option<&str>) -> Result<LoadedConfig> {
    let candidates: Vec<PathBuf> = match explicit {
        Some(path) => vec![PathBuf::from(shellexpand::tilde(path).as_ref())],
        None => ServerConfig::default_path()
            .into_iter()
            .chain(std::iter::once(PathBuf::from(SYSTEM_CONFIG_PATH)))
            .collect(),
    };

    if let Some(path) = candidates.iter().find(|p| p.exists()) {
        let config = ServerConfig::load(path)?;
        return Ok(LoadedConfig {
            config,
            path: Some(path.clone()),
            from_file: true,
        });
    }

    Ok(LoadedConfig {
        config: ServerConfig::default(),
        path: candidates.into_iter().next(),
        from_file: false,
    })
}

/// Desired bound set stored in the configuration file's `devices.bound`
///
/// Every persist rewrites the whole file so other settings survive. Runtime
/// overrides are not part of the held configuration and are never written.
pub struct TomlBoundStore {
    path: PathBuf,
    config: Mutex<ServerConfig>,
}

impl TomlBoundStore {
    pub fn new(path: PathBuf, config: ServerConfig) -> Self {
        Self {
            path,
            config: Mutex::new(config),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DesiredBoundStore for TomlBoundStore {
    fn load(&self) -> BTreeSet<BusId> {
        let Ok(config) = self.config.lock() else {
            return BTreeSet::new();
        };
        config
            .devices
            .bound
            .iter()
            .filter_map(|raw| match BusId::parse(raw) {
                Ok(busid) => Some(busid),
                Err(e) => {
                    tracing::warn!("Ignoring bound entry '{}': {}", raw, e);
                    None
                }
            })
            .collect()
    }

    fn persist(&self, desired: &BTreeSet<BusId>) -> Result<()> {
        let mut config = self
            .config
            .lock()
            .map_err(|_| anyhow!("Configuration lock poisoned"))?;
        config.devices.bound = desired.iter().map(|b| b.to_string()).collect();
        config.save(&self.path)?;
        tracing::info!(
            "Saved {} bound device(s) to {}",
            desired.len(),
            self.path.display()
        );
        Ok(())
    }
}
