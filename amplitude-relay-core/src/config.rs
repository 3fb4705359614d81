//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/amplitude-relay/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/amplitude-relay/` (~/.config/amplitude-relay/)
//! - Data: `$XDG_DATA_HOME/amplitude-relay/` (~/.local/share/amplitude-relay/)
//! - State/Logs: `$XDG_STATE_HOME/amplitude-relay/` (~/.local/state/amplitude-relay/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "amplitude-relay";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Amplitude endpoint and device context
    #[serde(default)]
    pub amplitude: AmplitudeConfig,

    /// Credential store settings
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Amplitude HTTP API configuration
///
/// The API key itself is never read from here; it lives in the credential store.
#[derive(Debug, Deserialize, Clone)]
pub struct AmplitudeConfig {
    /// API host (events go to `/2/httpapi`, identify to `/identify`)
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Inactivity gap after which in-session events start a new session
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// Reported platform
    #[serde(default = "default_platform")]
    pub platform: String,

    /// Reported OS name
    #[serde(default = "default_os_name")]
    pub os_name: String,

    /// Host application version
    pub app_version: Option<String>,

    /// Stable device id; when unset, one is generated once and kept in
    /// `$XDG_DATA_HOME/amplitude-relay/device_id`
    pub device_id: Option<String>,
}

impl Default for AmplitudeConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            timeout_secs: default_timeout(),
            session_timeout_secs: default_session_timeout(),
            platform: default_platform(),
            os_name: default_os_name(),
            app_version: None,
            device_id: None,
        }
    }
}

impl AmplitudeConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        let url = self.server_url.trim();
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(Error::Config(
                "amplitude.server_url must be an http(s) URL".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "amplitude.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.session_timeout_secs == 0 {
            return Err(Error::Config(
                "amplitude.session_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if matches!(&self.device_id, Some(id) if id.trim().len() < 5) {
            return Err(Error::Config(
                "amplitude.device_id must be at least 5 characters".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_server_url() -> String {
    "https://api2.amplitude.com".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_session_timeout() -> u64 {
    300
}

fn default_platform() -> String {
    std::env::consts::OS.to_string()
}

fn default_os_name() -> String {
    std::env::consts::OS.to_string()
}

/// Credential store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CredentialsConfig {
    /// Service name the API key is stored under
    #[serde(default = "default_credential_service")]
    pub service: String,

    /// Override path for the credential file
    pub path: Option<PathBuf>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            service: default_credential_service(),
            path: None,
        }
    }
}

impl CredentialsConfig {
    /// Resolved credential file path
    pub fn store_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| Config::data_dir().join("credentials.json"))
    }
}

fn default_credential_service() -> String {
    "AmplitudeAPIKey".to_string()
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        Self::parse(&content)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.amplitude.validate()?;
        if config.credentials.service.trim().is_empty() {
            return Err(Error::Config(
                "credentials.service must not be empty".to_string(),
            ));
        }

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/amplitude-relay/config.toml`
    pub fn config_path() -> PathBuf {
        xdg_config_home().join(APP_DIR).join("config.toml")
    }

    /// Returns the data directory path (credential file)
    ///
    /// `$XDG_DATA_HOME/amplitude-relay/`
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join(APP_DIR)
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/amplitude-relay/`
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join(APP_DIR)
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/amplitude-relay/amplitude-relay.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("amplitude-relay.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
