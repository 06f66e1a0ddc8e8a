//! Persistent host configuration.
//!
//! Stored as TOML under the platform config directory
//! (`~/.config/picoswitch/config.toml` on Linux). Every field has a default,
//! so a missing file is not an error; command-line flags override whatever
//! was loaded.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for the config directory.
const APP_NAME: &str = "picoswitch";

/// Host controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    /// Configuration format version.
    pub version: u8,

    /// Name of the container to start/stop and watch.
    pub container: String,

    /// Container runtime binary (`podman` or `docker`). Auto-detected when
    /// unset, preferring podman.
    #[serde(default)]
    pub runtime: Option<String>,

    /// Compose file to drive instead of start/stop-by-name.
    #[serde(default)]
    pub compose_file: Option<PathBuf>,

    /// Serial device path. Auto-detected when unset.
    #[serde(default)]
    pub port: Option<PathBuf>,

    /// Serial baud rate.
    #[serde(default = "default_baud")]
    pub baud: u32,

    /// Seconds between runtime polls while a transition is in flight.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Seconds after which a stuck transition force-settles to its target
    /// state.
    #[serde(default = "default_settle_timeout")]
    pub settle_timeout_secs: u64,
}

fn default_baud() -> u32 {
    115_200
}

fn default_poll_interval() -> u64 {
    2
}

fn default_settle_timeout() -> u64 {
    45
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            version: 1,
            container: "llama-server".to_string(),
            runtime: None,
            compose_file: None,
            port: None,
            baud: default_baud(),
            poll_interval_secs: default_poll_interval(),
            settle_timeout_secs: default_settle_timeout(),
        }
    }
}

impl HostConfig {
    /// Load configuration from the default location.
    ///
    /// A missing file yields the default configuration.
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text =
            std::fs::read_to_string(path).map_err(|e| Error::ConfigLoad(e.to_string()))?;
        toml::from_str(&text).map_err(|e| Error::ConfigLoad(e.to_string()))
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()
            .ok_or_else(|| Error::Config("no config directory on this platform".into()))?;
        self.save_to(&path)
    }

    /// Save configuration to an explicit path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Settle timeout as a [`Duration`].
    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.settle_timeout_secs.max(1))
    }

    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_NAME).join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.container, "llama-server");
        assert_eq!(config.baud, 115_200);
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.settle_timeout(), Duration::from_secs(45));
        assert!(config.runtime.is_none());
        assert!(config.port.is_none());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = HostConfig::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(loaded, HostConfig::default());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("picoswitch").join("config.toml");

        let mut config = HostConfig::default();
        config.container = "embedder".to_string();
        config.runtime = Some("docker".to_string());
        config.poll_interval_secs = 5;

        config.save_to(&path).unwrap();
        let loaded = HostConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "version = 1\ncontainer = \"whisper\"\n").unwrap();

        let loaded = HostConfig::load_from(&path).unwrap();
        assert_eq!(loaded.container, "whisper");
        assert_eq!(loaded.baud, 115_200);
        assert_eq!(loaded.settle_timeout_secs, 45);
    }

    #[test]
    fn test_garbage_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not even toml {{{").unwrap();
        assert!(matches!(
            HostConfig::load_from(&path),
            Err(Error::ConfigLoad(_))
        ));
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let mut config = HostConfig::default();
        config.poll_interval_secs = 0;
        config.settle_timeout_secs = 0;
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.settle_timeout(), Duration::from_secs(1));
    }
}
