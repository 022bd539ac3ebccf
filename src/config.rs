use crate::audio::AudioDeviceConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub audio: AudioDeviceConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Controller runtime tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound of worker threads per leaf controller
    pub worker_threads: usize,
    /// Idle worker threads exit after this long
    pub keep_alive_secs: u64,
    /// Nominal PCM frame period
    pub frame_ms: u32,
    /// Record consumer waits this many frame periods before substituting silence
    pub record_timeout_multiplier: f64,
    pub offload_retry_limit: u32,
    /// Length of the tone file rendered for offload playback
    pub tone_file_secs: u32,
    /// Serial used in command ids; the host name when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_serial: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: 10,
            keep_alive_secs: 30,
            frame_ms: 20,
            record_timeout_multiplier: 1.1,
            offload_retry_limit: 5,
            tone_file_secs: 60,
            device_serial: None,
        }
    }
}

impl EngineConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn serial(&self) -> String {
        self.device_serial
            .clone()
            .unwrap_or_else(crate::function::id::default_serial)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub listen_port: u16,
    /// Name announced in the hello; the device serial when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_name: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_port: 8888,
            peer_name: None,
        }
    }
}

impl AppConfig {
    /// Load config from file or create default
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            log::info!("Config loaded from: {}", path.display());
            Ok(config)
        } else {
            let config = Self::default();
            let toml_str = toml::to_string_pretty(&config)?;
            fs::write(path, toml_str)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            log::info!("Default config created at: {}", path.display());
            Ok(config)
        }
    }

    /// Name this node announces to peers
    pub fn peer_name(&self) -> String {
        self.transport
            .peer_name
            .clone()
            .unwrap_or_else(|| self.engine.serial())
    }
}
