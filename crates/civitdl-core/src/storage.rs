//! Storage layer for the configuration file (asset state lives in SQLite)

use crate::error::CivitdlError;
use civitdl_types::Config;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

const CONFIG_FILE: &str = "config.json";
const STATE_DB_FILE: &str = "state.db";

/// Storage manager for the civitdl data directory
#[derive(Clone, Debug)]
pub struct ConfigStorage {
    data_dir: PathBuf,
}

impl ConfigStorage {
    /// Create a new storage instance, creating the data directory if needed
    pub async fn new(data_dir: PathBuf) -> Result<Self, CivitdlError> {
        fs::create_dir_all(&data_dir).await?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.data_dir.join(STATE_DB_FILE)
    }

    /// Load the configuration, falling back to defaults when no file exists
    pub async fn load_config(&self) -> Result<Config, CivitdlError> {
        let path = self.config_path();
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
            Err(e) => return Err(e.into()),
        };

        if content.trim().is_empty() {
            warn!("Config file {:?} is empty, using defaults", path);
            return Ok(Config::default());
        }

        let config: Config = serde_json::from_str(&content)?;
        config.validate().map_err(CivitdlError::InvalidConfig)?;
        Ok(config)
    }

    /// Validate and persist the configuration
    pub async fn save_config(&self, config: &Config) -> Result<(), CivitdlError> {
        config.validate().map_err(CivitdlError::InvalidConfig)?;
        let content = serde_json::to_string_pretty(config)?;

        let tmp = self.data_dir.join(format!("{}.tmp", CONFIG_FILE));
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, self.config_path()).await?;
        Ok(())
    }

    /// Remove the configuration file, restoring defaults
    pub async fn reset_config(&self) -> Result<Config, CivitdlError> {
        match fs::remove_file(self.config_path()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let storage = ConfigStorage::new(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(storage.load_config().await.unwrap(), Config::default());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let storage = ConfigStorage::new(dir.path().join("nested")).await.unwrap();

        let mut config = Config::default();
        config.concurrency = 8;
        config.api_key = Some("secret".to_string());
        storage.save_config(&config).await.unwrap();

        assert_eq!(storage.load_config().await.unwrap(), config);
        assert!(!dir.path().join("nested/config.json.tmp").exists());

        storage.reset_config().await.unwrap();
        assert_eq!(storage.load_config().await.unwrap(), Config::default());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let storage = ConfigStorage::new(dir.path().to_path_buf()).await.unwrap();

        let mut config = Config::default();
        config.concurrency = 0;
        assert!(matches!(
            storage.save_config(&config).await,
            Err(CivitdlError::InvalidConfig(_))
        ));

        tokio::fs::write(storage.config_path(), r#"{"max_attempts": 0}"#)
            .await
            .unwrap();
        assert!(storage.load_config().await.is_err());
    }
}
