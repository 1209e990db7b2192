//! Tracker configuration. Values come from `config.toml` inside the application directory, every
//! option has a default so an empty or missing file is valid.

use std::{
    io::ErrorKind,
    path::Path,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const API_KEY_ENV: &str = "BEATKEEPER_API_KEY";
pub const DEFAULT_API_URL: &str = "https://api.wakatime.com/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_key: Option<String>,
    pub api_url: String,
    pub debounce_interval_seconds: u64,
    /// Upper bound on time credited by a single heartbeat. Falls back to the debounce interval.
    pub max_heartbeat_seconds: Option<u64>,
    pub sync_interval_seconds: u64,
    pub max_backoff_seconds: u64,
    pub max_batch_size: usize,
    pub max_sync_attempts: u32,
    pub request_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    /// Host identifier put in front of the user agent, e.g. `blender/4.1.0`.
    pub plugin: Option<String>,
    /// Tag appended to project names derived from file names, e.g. `blender`.
    pub project_tag: Option<String>,
    pub totals_retention_days: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: DEFAULT_API_URL.into(),
            debounce_interval_seconds: 120,
            max_heartbeat_seconds: None,
            sync_interval_seconds: 60,
            max_backoff_seconds: 300,
            max_batch_size: 25,
            max_sync_attempts: 5,
            request_timeout_seconds: 20,
            idle_timeout_seconds: 120,
            plugin: None,
            project_tag: None,
            totals_retention_days: 31,
        }
    }
}

impl Config {
    /// Loads configuration from `dir/config.toml` and applies environment overrides.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE_NAME);
        let mut config = Self::from_file(&path)?;
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            debug!("Using api key from {API_KEY_ENV}");
            config.api_key = Some(key);
        }
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No config found at {path:?}, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Checks values that would make the tracker misbehave. A missing api key is allowed here:
    /// it only disables sync, see [Config::require_api_key].
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("debounce_interval_seconds", self.debounce_interval_seconds),
            ("sync_interval_seconds", self.sync_interval_seconds),
            ("max_backoff_seconds", self.max_backoff_seconds),
            ("max_batch_size", self.max_batch_size as u64),
            ("max_sync_attempts", self.max_sync_attempts as u64),
            ("request_timeout_seconds", self.request_timeout_seconds),
            ("idle_timeout_seconds", self.idle_timeout_seconds),
        ];
        if let Some(option) = positive
            .iter()
            .find(|(_, value)| *value == 0)
            .map(|(option, _)| *option)
        {
            return Err(ConfigError::NotPositive { option });
        }
        if self.max_heartbeat_seconds == Some(0) {
            return Err(ConfigError::NotPositive {
                option: "max_heartbeat_seconds",
            });
        }
        let url = self.api_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::InvalidApiUrl(self.api_url.clone()));
        }
        Ok(())
    }

    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingApiKey)
    }

    pub fn debounce_interval(&self) -> Duration {
        Duration::from_secs(self.debounce_interval_seconds)
    }

    pub fn max_heartbeat(&self) -> Duration {
        Duration::from_secs(
            self.max_heartbeat_seconds
                .unwrap_or(self.debounce_interval_seconds),
        )
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use anyhow::Result;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn missing_file_gives_defaults() -> Result<()> {
        let dir = tempdir()?;
        let config = Config::from_file(&dir.path().join(CONFIG_FILE_NAME))?;
        assert_eq!(config, Config::default());
        assert_eq!(config.max_heartbeat(), config.debounce_interval());
        Ok(())
    }

    #[test]
    fn partial_file_keeps_other_defaults() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            "api_key = \"waka_123\"\nsync_interval_seconds = 15\nproject_tag = \"blender\"\n",
        )?;
        let config = Config::from_file(&path)?;
        assert_eq!(config.require_api_key()?, "waka_123");
        assert_eq!(config.sync_interval(), Duration::from_secs(15));
        assert_eq!(config.project_tag.as_deref(), Some("blender"));
        assert_eq!(config.max_batch_size, 25);
        Ok(())
    }

    #[test]
    fn invalid_toml_is_reported() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "sync_interval_seconds = \"soon\"")?;
        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
        Ok(())
    }

    #[test]
    fn validation_rejects_zero_and_bad_urls() {
        let config = Config {
            max_batch_size: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositive {
                option: "max_batch_size"
            })
        ));

        let config = Config {
            api_url: "ftp://example.com".into(),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidApiUrl(_))
        ));

        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn blank_api_key_counts_as_missing() {
        let config = Config {
            api_key: Some("   ".into()),
            ..Config::default()
        };
        assert!(matches!(
            config.require_api_key(),
            Err(ConfigError::MissingApiKey)
        ));
    }
}
