//! Session, transport and audio configuration
//!
//! Loaded from TOML, either at an explicit path or from the platform
//! config directory. Missing files fall back to defaults.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{Error, NetworkError, Result};

/// Top-level application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub transport: TransportConfig,
    pub audio: AudioConfig,
}

/// Per-session conversation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Instruction text sent once when the channel opens
    pub system_instruction: String,
    /// Prebuilt voice name for synthesized replies
    pub voice_id: String,
    pub uplink_rate_hz: u32,
    pub downlink_rate_hz: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            system_instruction: String::new(),
            voice_id: DEFAULT_VOICE_ID.to_string(),
            uplink_rate_hz: DEFAULT_UPLINK_RATE_HZ,
            downlink_rate_hz: DEFAULT_DOWNLINK_RATE_HZ,
        }
    }
}

impl SessionConfig {
    pub fn with_instruction(system_instruction: impl Into<String>) -> Self {
        Self {
            system_instruction: system_instruction.into(),
            ..Default::default()
        }
    }
}

/// Streaming endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    pub endpoint: String,
    pub model: String,
    /// Falls back to the `GEMINI_API_KEY` / `API_KEY` environment variables
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub open_timeout_ms: u64,
    pub close_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            open_timeout_ms: DEFAULT_OPEN_TIMEOUT_MS,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
        }
    }
}

impl TransportConfig {
    /// Resolve the API key from config or environment
    pub fn resolve_api_key(&self) -> std::result::Result<String, NetworkError> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Ok(key.clone());
        }
        API_KEY_ENV_VARS
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
            .ok_or(NetworkError::MissingApiKey)
    }

    /// Full WebSocket URL including the key query parameter
    pub fn url(&self) -> std::result::Result<String, NetworkError> {
        let key = self.resolve_api_key()?;
        Ok(format!("{}?key={}", self.endpoint, key))
    }

    pub fn open_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.open_timeout_ms)
    }

    pub fn close_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.close_timeout_ms)
    }
}

/// Device settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Samples per capture frame
    pub frame_size: usize,
    /// Input device name (None for default)
    pub input_device: Option<String>,
    /// Output device name (None for default)
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            input_device: None,
            output_device: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the given path, or the platform config file, or defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path().filter(|p| p.exists()),
        };

        match path {
            Some(p) => {
                tracing::info!("Loading config from {}", p.display());
                Self::load(&p)
            }
            None => {
                tracing::info!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Platform config file location
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "live-voice-session")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Save configuration as TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.session.uplink_rate_hz == 0 || self.session.downlink_rate_hz == 0 {
            return Err(Error::Config("sample rates must be non-zero".into()));
        }
        if self.audio.frame_size == 0 {
            return Err(Error::Config("frame_size must be non-zero".into()));
        }
        if self.transport.open_timeout_ms == 0 || self.transport.close_timeout_ms == 0 {
            return Err(Error::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}
