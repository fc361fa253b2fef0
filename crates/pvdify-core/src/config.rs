//! pvdifyd.toml configuration parser.
//!
//! The file is optional: every field has a default, and a handful of
//! `PVDIFY_*` environment variables override the file after it is read.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    pub listen: String,
    pub state_dir: PathBuf,
    pub database: PathBuf,
    pub dev: bool,
    pub log: LogConfig,
    pub ports: PortsConfig,
    pub units: UnitsConfig,
    pub runtime: RuntimeConfig,
    pub tunnel: TunnelConfig,
    pub reconcile: ReconcileConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// `json` or `text`.
    pub format: String,
}

/// Host port pool handed out to apps, inclusive on both ends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PortsConfig {
    pub start: u16,
    pub end: u16,
}

/// Supervisor unit rendering and placement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UnitsConfig {
    /// Directory the templated unit files are written to.
    pub dir: PathBuf,
    /// Prefix of every unit and container name.
    pub namespace: String,
    /// Service user the containers run as.
    pub user: String,
    pub container_port: u16,
    pub memory: String,
    pub cpu: String,
    /// Talk to the per-user systemd instance (`systemctl --user`).
    pub user_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Path or name of the podman binary.
    pub podman: String,
    pub stop_timeout_secs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TunnelConfig {
    pub enabled: bool,
    /// Ingress rule file consumed by the tunnel daemon.
    pub config: PathBuf,
    pub credentials: String,
    pub tunnel_id: String,
}

/// Retry policy for background actuation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconcileConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9443".to_string(),
            state_dir: PathBuf::from("/var/lib/pvdify"),
            database: PathBuf::from("/var/lib/pvdify/pvdifyd.redb"),
            dev: false,
            log: LogConfig::default(),
            ports: PortsConfig::default(),
            units: UnitsConfig::default(),
            runtime: RuntimeConfig::default(),
            tunnel: TunnelConfig::default(),
            reconcile: ReconcileConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            start: 3000,
            end: 3999,
        }
    }
}

impl Default for UnitsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/etc/systemd/system"),
            namespace: "pvdify".to_string(),
            user: "pvdify".to_string(),
            container_port: 3000,
            memory: "512M".to_string(),
            cpu: "0.5".to_string(),
            user_mode: false,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            podman: "podman".to_string(),
            stop_timeout_secs: 10,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            config: PathBuf::from("/var/lib/pvdify/tunnels/pvdify-apps.yml"),
            credentials: String::new(),
            tunnel_id: String::new(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 1000,
            max_backoff_secs: 60,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl DaemonConfig {
    /// Load the config file (if it exists), then apply process environment overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply `PVDIFY_*` overrides using the given variable lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("PVDIFY_LISTEN").filter(|v| !v.is_empty()) {
            self.listen = v;
        }
        if let Some(v) = lookup("PVDIFY_STATE_DIR").filter(|v| !v.is_empty()) {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PVDIFY_DB").filter(|v| !v.is_empty()) {
            self.database = PathBuf::from(v);
        }
        if let Some(v) = lookup("PVDIFY_LOG_LEVEL").filter(|v| !v.is_empty()) {
            self.log.level = v;
        }
        if lookup("PVDIFY_DEV").as_deref() == Some("true") {
            self.dev = true;
        }
    }

    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ports.start > self.ports.end {
            anyhow::bail!(
                "invalid port range {}-{}: start is after end",
                self.ports.start,
                self.ports.end
            );
        }
        if self.units.namespace.is_empty() {
            anyhow::bail!("units.namespace must not be empty");
        }
        if self.reconcile.max_attempts == 0 {
            anyhow::bail!("reconcile.max_attempts must be at least 1");
        }
        crate::validate::memory(&self.units.memory)?;
        crate::validate::cpu(&self.units.cpu)?;
        Ok(())
    }

    /// Subdirectories of `state_dir` the daemon writes into.
    pub fn state_subdirs(&self) -> Vec<PathBuf> {
        ["apps", "releases", "config", "tunnels"]
            .iter()
            .map(|d| self.state_dir.join(d))
            .collect()
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
