//! Configuration resolution for devtunnel.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Config file (explicit path, or the global `devtunnel/config.toml`)
//! 3. Environment variables (`DEVTUNNEL_*`)
//! 4. CLI arguments (applied by the binary, highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::version::OsVersion;

/// Complete devtunnel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Daemon-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Address the control interface binds to.
    pub bind: String,
    /// Port of the control interface.
    pub port: u16,
    /// Also supervise devices reachable over the network.
    pub wifi: bool,
    /// Explicit tunnel helper executable; discovered on `PATH` when unset.
    pub helper_path: Option<PathBuf>,
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 5555,
            wifi: false,
            helper_path: None,
            log_level: "info".to_string(),
        }
    }
}

/// Timing and eligibility knobs for the reconciler and device supervisors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Interval between device directory polls.
    pub tick_interval_ms: u64,
    /// Delay before relaunching a helper that failed or exited.
    pub backoff_ms: u64,
    /// Grace period between SIGTERM and SIGKILL when stopping a helper.
    pub terminate_grace_ms: u64,
    /// Upper bound on one device directory query.
    pub directory_timeout_ms: u64,
    /// Give up on a helper that has not printed its endpoint in time.
    /// Unset means wait indefinitely.
    pub handshake_timeout_ms: Option<u64>,
    /// Devices below this OS version are not supervised.
    pub min_os_version: String,
    /// Devices at or above this OS version use the lockdown tunnel.
    pub lockdown_os_version: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            backoff_ms: 3000,
            terminate_grace_ms: 5000,
            directory_timeout_ms: 10_000,
            handshake_timeout_ms: None,
            min_os_version: "17".to_string(),
            lockdown_os_version: "17.4".to_string(),
        }
    }
}

impl SupervisorConfig {
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub const fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub const fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub const fn directory_timeout(&self) -> Duration {
        Duration::from_millis(self.directory_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }

    pub fn min_os_version(&self) -> Result<OsVersion> {
        OsVersion::parse(&self.min_os_version)
    }

    pub fn lockdown_os_version(&self) -> Result<OsVersion> {
        OsVersion::parse(&self.lockdown_os_version)
    }
}

impl Config {
    /// Check the values that cannot be expressed in the type system.
    pub fn validate(&self) -> Result<()> {
        self.supervisor.min_os_version()?;
        self.supervisor.lockdown_os_version()?;
        for (name, value) in [
            ("tick_interval_ms", self.supervisor.tick_interval_ms),
            ("backoff_ms", self.supervisor.backoff_ms),
            ("directory_timeout_ms", self.supervisor.directory_timeout_ms),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
///
/// An explicit `path` must exist; the global config file is optional.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => load_config_file(path)?,
        None => match global_config_path() {
            Some(global) if global.exists() => load_config_file(&global)?,
            _ => Config::default(),
        },
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("devtunnel").join("config.toml"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    toml::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Apply `DEVTUNNEL_*` overrides read through `lookup`.
///
/// Values that fail to parse are ignored.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("DEVTUNNEL_BIND") {
        config.daemon.bind = val;
    }
    if let Some(n) = lookup("DEVTUNNEL_PORT").and_then(|v| v.parse().ok()) {
        config.daemon.port = n;
    }
    if let Some(flag) = lookup("DEVTUNNEL_WIFI").and_then(|v| parse_flag(&v)) {
        config.daemon.wifi = flag;
    }
    if let Some(val) = lookup("DEVTUNNEL_HELPER_PATH") {
        config.daemon.helper_path = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("DEVTUNNEL_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Some(n) = lookup("DEVTUNNEL_TICK_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        config.supervisor.tick_interval_ms = n;
    }
    if let Some(n) = lookup("DEVTUNNEL_BACKOFF_MS").and_then(|v| v.parse().ok()) {
        config.supervisor.backoff_ms = n;
    }
    if let Some(n) = lookup("DEVTUNNEL_DIRECTORY_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.supervisor.directory_timeout_ms = n;
    }
    if let Some(n) = lookup("DEVTUNNEL_HANDSHAKE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.supervisor.handshake_timeout_ms = Some(n);
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
