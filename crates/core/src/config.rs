//! Coordinator Configuration
//!
//! Download directory, polling cadence, and install-path switches.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SideloadError};

/// Configuration of the download & install coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SideloadConfig {
    /// Directory downloaded artifacts are written to
    pub download_dir: PathBuf,
    /// Milliseconds between download status polls
    pub download_poll_ms: u64,
    /// Milliseconds between install-session polls
    pub session_poll_ms: u64,
    /// HTTP timeout for artifact downloads, in seconds
    pub http_timeout_secs: u64,
    /// Prefer the privileged install path when available
    pub use_privileged: bool,
    /// Explicit adb binary path (falls back to PATH lookup)
    pub adb_path: Option<PathBuf>,
    /// Device serial to target when several are connected
    pub device_serial: Option<String>,
}

impl Default for SideloadConfig {
    fn default() -> Self {
        Self {
            download_dir: Self::data_dir()
                .map(|dir| dir.join("downloads"))
                .unwrap_or_else(|| PathBuf::from("downloads")),
            download_poll_ms: 1000,
            session_poll_ms: 500,
            http_timeout_secs: 300,
            use_privileged: false,
            adb_path: None,
            device_serial: None,
        }
    }
}

impl SideloadConfig {
    /// Get the configuration directory path
    pub fn config_dir() -> Option<PathBuf> {
        ProjectDirs::from("dev", "sideload", "Sideload")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the configuration file path
    pub fn config_file() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Get the data directory path
    pub fn data_dir() -> Option<PathBuf> {
        ProjectDirs::from("dev", "sideload", "Sideload").map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Interval between download status polls
    pub fn download_poll(&self) -> Duration {
        Duration::from_millis(self.download_poll_ms)
    }

    /// Interval between install-session polls
    pub fn session_poll(&self) -> Duration {
        Duration::from_millis(self.session_poll_ms)
    }

    /// Load configuration from the default file
    pub async fn load() -> Result<Self> {
        let config_file = Self::config_file()
            .ok_or_else(|| SideloadError::Config("Cannot determine config path".into()))?;

        if config_file.exists() {
            Self::load_from(&config_file).await
        } else {
            info!("Config file not found, using defaults");
            let config = SideloadConfig::default();
            config.save().await?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub async fn load_from(path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", path);
        let contents = tokio::fs::read_to_string(path).await?;
        let config: SideloadConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to the default file
    pub async fn save(&self) -> Result<()> {
        let config_file = Self::config_file()
            .ok_or_else(|| SideloadError::Config("Cannot determine config path".into()))?;
        self.save_to(&config_file).await
    }

    /// Save configuration to a specific file
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = toml::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;

        debug!("Config saved to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SideloadConfig::default();
        assert_eq!(config.download_poll_ms, 1000);
        assert_eq!(config.session_poll_ms, 500);
        assert!(!config.use_privileged);
        assert!(config.adb_path.is_none());
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = SideloadConfig::default();
        config.download_poll_ms = 250;
        config.use_privileged = true;
        config.device_serial = Some("emulator-5554".to_string());
        config.save_to(&path).await.unwrap();

        let loaded = SideloadConfig::load_from(&path).await.unwrap();
        assert_eq!(loaded.download_poll_ms, 250);
        assert!(loaded.use_privileged);
        assert_eq!(loaded.device_serial.as_deref(), Some("emulator-5554"));
        assert_eq!(loaded.download_poll(), Duration::from_millis(250));
    }
}
