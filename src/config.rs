//! Configuration for the MIDI directory
//!
//! Loaded from YAML. Every field has a default, so a missing or empty file
//! yields a working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::decoder::{IncompleteSysex, MalformedPolicy};
use crate::error::{Error, Result};

/// Name used for native clients and the config directory
pub const APP_NAME: &str = "midi-directory";

/// Smallest accepted polling period
pub const MIN_POLL_INTERVAL_MS: u64 = 50;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    /// Client name announced to the native MIDI layer; also the display
    /// name prefix of every endpoint
    pub client_name: String,
    pub sysex: SysexConfig,
    /// Handling of malformed bytes within a packet
    pub malformed: MalformedPolicy,
    pub polling: PollingConfig,
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            client_name: APP_NAME.to_string(),
            sysex: SysexConfig::default(),
            malformed: MalformedPolicy::default(),
            polling: PollingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SysexConfig {
    /// Fate of a SysEx message cut short by another status byte
    pub incomplete: IncompleteSysex,
}

/// When the topology poller runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PollingMode {
    /// Poll only if the transport cannot push changes
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PollingConfig {
    pub mode: PollingMode,
    pub interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            mode: PollingMode::Auto,
            interval_ms: default_poll_interval_ms(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Whether a poller is needed for a transport with the given push support
    pub fn enabled(&self, transport_pushes: bool) -> bool {
        match self.mode {
            PollingMode::Auto => !transport_pushes,
            PollingMode::Always => true,
            PollingMode::Never => false,
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    /// Directory for daily rolling log files
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).await?;
        let config = Self::from_yaml(&contents)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load if the file exists, otherwise fall back to defaults
    pub async fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !fs::try_exists(path).await? {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path).await
    }

    /// Parse and validate a YAML document; empty documents are allowed
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: AppConfig = if contents.trim().is_empty() {
            AppConfig::default()
        } else {
            serde_yaml::from_str(contents)?
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_name.trim().is_empty() {
            return Err(Error::Config("client_name cannot be empty".into()));
        }
        if self.polling.interval_ms < MIN_POLL_INTERVAL_MS {
            return Err(Error::Config(format!(
                "polling.interval_ms must be at least {} (got {})",
                MIN_POLL_INTERVAL_MS, self.polling.interval_ms
            )));
        }
        Ok(())
    }

    /// `<config dir>/midi-directory/config.yaml`, if the platform has one
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join("config.yaml"))
    }
}
