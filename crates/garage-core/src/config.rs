//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/garage/config.toml)
//! 3. Environment variables (GARAGE_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::sync::{SyncSettings, DEFAULT_MAX_RETRIES};

/// Environment variable prefix
const ENV_PREFIX: &str = "GARAGE";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the local database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Base URL of the remote backend (optional)
    #[serde(default)]
    pub remote_url: Option<String>,

    /// API key sent to the remote backend
    #[serde(default)]
    pub remote_api_key: Option<String>,

    /// Whether to talk to the remote backend at all
    #[serde(default)]
    pub sync_enabled: bool,

    /// Seconds between automatic drains
    #[serde(default = "default_auto_sync_interval")]
    pub auto_sync_interval_secs: u64,

    /// Transient failures before a queued change is marked failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Upper bound on a single remote request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Log file path (default: stderr)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            remote_url: None,
            remote_api_key: None,
            sync_enabled: false,
            auto_sync_interval_secs: default_auto_sync_interval(),
            max_retries: default_max_retries(),
            request_timeout_secs: default_request_timeout(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (GARAGE_DATA_DIR, GARAGE_REMOTE_URL, ...)
    /// 2. Config file (~/.config/garage/config.toml or GARAGE_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load from `--config` if given, otherwise from the default location
    pub fn load_with_cli_override(config_path: Option<&PathBuf>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Some(val) = env_var("DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }

        // Empty string clears the remote
        if let Some(val) = env_var("REMOTE_URL") {
            self.remote_url = if val.is_empty() { None } else { Some(val) };
        }

        if let Some(val) = env_var("REMOTE_API_KEY") {
            self.remote_api_key = if val.is_empty() { None } else { Some(val) };
        }

        if let Some(val) = env_var("SYNC_ENABLED") {
            self.sync_enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }

        if let Some(secs) = env_parse("AUTO_SYNC_INTERVAL") {
            self.auto_sync_interval_secs = secs;
        }

        if let Some(retries) = env_parse("MAX_RETRIES") {
            self.max_retries = retries;
        }

        if let Some(secs) = env_parse("REQUEST_TIMEOUT") {
            self.request_timeout_secs = secs;
        }

        if let Some(val) = env_var("LOG_FILE") {
            self.log_file = if val.is_empty() { None } else { Some(PathBuf::from(val)) };
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with GARAGE_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Some(path) = env_var("CONFIG") {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("garage")
            .join("config.toml")
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("garage.db")
    }

    /// Remote URL, if sync is enabled and one is configured
    pub fn active_remote_url(&self) -> Option<&str> {
        if !self.sync_enabled {
            return None;
        }
        self.remote_url.as_deref().filter(|url| !url.is_empty())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Settings consumed by the sync manager
    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            max_retries: self.max_retries.max(1),
            auto_sync_interval: Duration::from_secs(self.auto_sync_interval_secs.max(1)),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let val = env_var(name)?;
    match val.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring {}_{}={:?}: not a number", ENV_PREFIX, name, val);
            None
        }
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("garage")
}

fn default_auto_sync_interval() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_request_timeout() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|p| p.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "GARAGE_DATA_DIR",
        "GARAGE_REMOTE_URL",
        "GARAGE_REMOTE_API_KEY",
        "GARAGE_SYNC_ENABLED",
        "GARAGE_AUTO_SYNC_INTERVAL",
        "GARAGE_MAX_RETRIES",
        "GARAGE_REQUEST_TIMEOUT",
        "GARAGE_LOG_FILE",
        "GARAGE_CONFIG",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.sync_enabled);
        assert!(config.remote_url.is_none());
        assert_eq!(config.auto_sync_interval_secs, 30);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.request_timeout_secs, 10);
        assert!(config.data_dir.ends_with("garage"));
        assert!(config.sqlite_path().ends_with("garage.db"));
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("GARAGE_DATA_DIR", "/tmp/garage-test");
        config.apply_env_overrides();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/garage-test"));
    }

    #[test]
    fn test_env_override_sync_enabled() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("GARAGE_SYNC_ENABLED", "true");
        config.apply_env_overrides();
        assert!(config.sync_enabled);

        env::set_var("GARAGE_SYNC_ENABLED", "1");
        config.sync_enabled = false;
        config.apply_env_overrides();
        assert!(config.sync_enabled);

        env::set_var("GARAGE_SYNC_ENABLED", "false");
        config.apply_env_overrides();
        assert!(!config.sync_enabled);
    }

    #[test]
    fn test_env_override_remote_url() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("GARAGE_REMOTE_URL", "https://db.example.com");
        config.apply_env_overrides();
        assert_eq!(config.remote_url.as_deref(), Some("https://db.example.com"));

        // Empty string clears it
        env::set_var("GARAGE_REMOTE_URL", "");
        config.apply_env_overrides();
        assert!(config.remote_url.is_none());
    }

    #[test]
    fn test_env_override_numbers() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("GARAGE_AUTO_SYNC_INTERVAL", "5");
        env::set_var("GARAGE_MAX_RETRIES", "7");
        env::set_var("GARAGE_REQUEST_TIMEOUT", "not-a-number");
        config.apply_env_overrides();

        assert_eq!(config.auto_sync_interval_secs, 5);
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.request_timeout_secs, 10);

        let settings = config.sync_settings();
        assert_eq!(settings.max_retries, 7);
        assert_eq!(settings.auto_sync_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_active_remote_requires_sync_enabled() {
        let mut config = Config {
            remote_url: Some("https://db.example.com".to_string()),
            ..Config::default()
        };
        assert!(config.active_remote_url().is_none());

        config.sync_enabled = true;
        assert_eq!(config.active_remote_url(), Some("https://db.example.com"));
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            remote_url = "https://db.example.com"
            sync_enabled = true
            max_retries = 5
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.remote_url.as_deref(), Some("https://db.example.com"));
        assert!(config.sync_enabled);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.auto_sync_interval_secs, 30);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let config = Config {
            data_dir: temp_dir.path().join("data"),
            remote_url: Some("https://db.example.com".to_string()),
            sync_enabled: true,
            log_file: Some(temp_dir.path().join("garage.log")),
            ..Config::default()
        };
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_with_cli_override(Some(&path)).unwrap();
        assert_eq!(loaded.data_dir, config.data_dir);
        assert_eq!(loaded.remote_url, config.remote_url);
        assert_eq!(loaded.log_file, config.log_file);
        assert!(loaded.data_dir.exists());
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = TempDir::new().unwrap();
        env::set_var("GARAGE_DATA_DIR", temp_dir.path().join("data"));

        let config = Config::load_from_path(&temp_dir.path().join("missing.toml")).unwrap();
        assert!(!config.sync_enabled);
        assert!(config.remote_url.is_none());
    }
}
