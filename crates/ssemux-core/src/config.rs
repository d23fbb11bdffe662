//! Configuration resolution for ssemux.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/ssemux/settings.json`)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (applied by the binary, highest priority)
//!
//! Files are partial: a file only needs the keys it overrides.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Complete ssemux configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// HTTP listener and logging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// Per-session behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Unread writes buffered per session before producers wait.
    pub channel_capacity: usize,
    /// Heartbeat period once a reader is attached. 0 disables heartbeats.
    pub heartbeat_interval_secs: u64,
    /// Unattached sessions idle this long are evicted. 0 disables eviction.
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            heartbeat_interval_secs: 15,
            idle_timeout_secs: 300,
            sweep_interval_secs: 30,
        }
    }
}

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Config {
    /// Reject values the session layer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.session.channel_capacity == 0 {
            return Err(Error::Config(
                "session.channel_capacity must be at least 1".into(),
            ));
        }
        if self.session.sweep_interval_secs == 0 {
            return Err(Error::Config(
                "session.sweep_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global) = global_config_path().filter(|p| p.exists()) {
        merge_value(&mut merged, read_config_file(&global)?);
    }
    if let Some(path) = explicit {
        merge_value(&mut merged, read_config_file(path)?);
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;
    apply_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("ssemux").join("settings.json"))
}

fn read_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Deep-merge `overlay` into `base`; objects merge key by key, anything
/// else replaces.
fn merge_value(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_value(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `SSEMUX_*` overrides. Unparseable values are ignored.
fn apply_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(addr) = var("SSEMUX_ADDR").and_then(|v| v.parse().ok()) {
        config.server.addr = addr;
    }
    if let Some(level) = var("SSEMUX_LOG_LEVEL") {
        config.server.log_level = level;
    }
    if let Some(n) = var("SSEMUX_CHANNEL_CAPACITY").and_then(|v| v.parse().ok()) {
        config.session.channel_capacity = n;
    }
    if let Some(n) = var("SSEMUX_HEARTBEAT_SECS").and_then(|v| v.parse().ok()) {
        config.session.heartbeat_interval_secs = n;
    }
    if let Some(n) = var("SSEMUX_IDLE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.session.idle_timeout_secs = n;
    }
}
