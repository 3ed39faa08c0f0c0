use crate::coordinator::{SendMode, DEFAULT_FAILURE_NOTICE};
use crate::llm::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variables checked for the API credential, in order
pub const API_KEY_ENV_VARS: [&str; 2] = ["GEMINI_API_KEY", "GOOGLE_AI_API_KEY"];

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// API key for the Gemini API; falls back to the environment
    pub api_key: Option<String>,

    /// Model to chat with
    pub model: String,

    /// API base URL
    pub base_url: String,

    /// Whether replies are streamed or fetched in one piece
    pub send_mode: SendMode,

    /// Text shown when a request fails
    pub failure_notice: String,

    pub request_timeout_secs: u64,

    /// How long to wait for the session to come up before giving up
    pub init_timeout_secs: u64,

    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub system_instruction: Option<String>,

    /// Default tracing filter when RUST_LOG is unset
    pub log_filter: String,

    /// UI preferences
    pub ui: UiConfig,

    /// Application home directory
    #[serde(skip)]
    pub home: PathBuf,
}

/// UI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub title: String,
    pub show_timestamps: bool,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            title: "Gemini Chat".to_string(),
            show_timestamps: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            send_mode: SendMode::default(),
            failure_notice: DEFAULT_FAILURE_NOTICE.to_string(),
            request_timeout_secs: 60,
            init_timeout_secs: 15,
            temperature: None,
            max_output_tokens: None,
            system_instruction: None,
            log_filter: "info".to_string(),
            ui: UiConfig::default(),
            home: default_home(),
        }
    }
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".gemchat")
}

impl Config {
    /// Load configuration from `~/.gemchat/config.toml`, creating the directory if needed
    pub fn load() -> Result<Self> {
        let home = dirs::home_dir().context("Could not find home directory")?.join(".gemchat");
        fs::create_dir_all(&home).context("Failed to create .gemchat directory")?;

        let mut config = Self::load_from(&home.join("config.toml"))?;
        config.home = home;
        Ok(config)
    }

    /// Load configuration from a specific file; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        if let Some(parent) = path.parent() {
            config.home = parent.to_path_buf();
        }
        Ok(config)
    }

    pub fn config_path(&self) -> PathBuf {
        self.home.join("config.toml")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    /// Save configuration to its file
    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.home).context("Failed to create config directory")?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(self.config_path(), content).context("Failed to write config file")?;
        Ok(())
    }

    /// Check if an API key is configured
    pub fn has_api_key(&self) -> bool {
        self.get_api_key().is_some()
    }

    /// Get API key from config or environment
    pub fn get_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| {
                API_KEY_ENV_VARS
                    .iter()
                    .find_map(|var| std::env::var(var).ok().filter(|key| !key.trim().is_empty()))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.send_mode, SendMode::Streaming);
        assert_eq!(config.failure_notice, DEFAULT_FAILURE_NOTICE);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "model = \"gemini-1.5-pro\"\nsend_mode = \"atomic\"\n\n[ui]\nshow_timestamps = false\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.model, "gemini-1.5-pro");
        assert_eq!(config.send_mode, SendMode::Atomic);
        assert!(!config.ui.show_timestamps);
        assert_eq!(config.ui.title, "Gemini Chat");
        assert_eq!(config.request_timeout_secs, 60);
        assert_eq!(config.home, dir.path());
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            temperature: Some(0.2),
            system_instruction: Some("Answer tersely.".to_string()),
            home: dir.path().to_path_buf(),
            ..Config::default()
        };
        config.save().unwrap();

        let loaded = Config::load_from(&config.config_path()).unwrap();
        assert_eq!(loaded.temperature, Some(0.2));
        assert_eq!(loaded.system_instruction.as_deref(), Some("Answer tersely."));
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "model = [").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn configured_key_wins_over_environment() {
        let config = Config {
            api_key: Some("from-file".to_string()),
            ..Config::default()
        };
        assert_eq!(config.get_api_key().as_deref(), Some("from-file"));
        assert!(config.has_api_key());
    }
}
