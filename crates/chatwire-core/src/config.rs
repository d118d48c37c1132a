use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::decoder::DEFAULT_MAX_RECORD_BYTES;
use crate::error::{Error, Result};

/// Top-level configuration, read from `~/.config/chatwire/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ChatwireConfig {
    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub persist: PersistSettings,

    #[serde(default)]
    pub admission: AdmissionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    pub idle_timeout_ms: u64,
    pub notification_capacity: usize,
    pub max_record_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 60_000,
            notification_capacity: 64,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistSettings {
    pub checkpoint_interval_ms: u64,
    /// Defaults to `~/.chatwire/checkpoints.db` when unset.
    pub database_path: Option<PathBuf>,
}

impl Default for PersistSettings {
    fn default() -> Self {
        Self {
            checkpoint_interval_ms: 500,
            database_path: None,
        }
    }
}

impl PersistSettings {
    pub fn resolved_database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdmissionSettings {
    pub limit: u32,
    pub window_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            limit: 10,
            window_ms: 60_000,
            sweep_interval_ms: 60_000,
        }
    }
}

pub fn default_database_path() -> Result<PathBuf> {
    let home_dir = dirs::home_dir()
        .ok_or_else(|| Error::Configuration("Could not determine home directory".to_string()))?;
    Ok(home_dir.join(".chatwire").join("checkpoints.db"))
}

impl ChatwireConfig {
    /// Get the path to the configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| {
            Error::Configuration("Could not determine config directory".to_string())
        })?;
        Ok(config_dir.join("chatwire").join("config.toml"))
    }

    /// Load configuration from the default location, or defaults if absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`.
    ///
    /// A missing file yields defaults. A file that does not parse is logged
    /// and also yields defaults, so a typo never keeps the pipeline down.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        match toml::from_str(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!(
                    "Failed to parse config file at {:?}: {}. Using defaults.",
                    path,
                    e
                );
                Ok(Self::default())
            }
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, contents)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ChatwireConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, ChatwireConfig::default());
        assert_eq!(config.admission.limit, 10);
        assert_eq!(config.admission.window_ms, 60_000);
    }

    #[test]
    fn test_partial_file_fills_remaining_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[stream]\nidle_timeout_ms = 1500\n\n[admission]\nlimit = 3\n",
        )
        .unwrap();

        let config = ChatwireConfig::load_from(&path).unwrap();

        assert_eq!(config.stream.idle_timeout_ms, 1500);
        assert_eq!(config.stream.notification_capacity, 64);
        assert_eq!(config.admission.limit, 3);
        assert_eq!(config.admission.window_ms, 60_000);
        assert_eq!(config.persist, PersistSettings::default());
    }

    #[test]
    fn test_unparsable_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[stream\nidle_timeout_ms = ").unwrap();

        let config = ChatwireConfig::load_from(&path).unwrap();
        assert_eq!(config, ChatwireConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = ChatwireConfig::default();
        config.persist.database_path = Some(dir.path().join("db.sqlite"));
        config.persist.checkpoint_interval_ms = 250;

        config.save_to(&path).unwrap();

        assert_eq!(ChatwireConfig::load_from(&path).unwrap(), config);
    }
}
