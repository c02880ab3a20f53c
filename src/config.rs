//! Per-repository configuration stored as `blockmap.toml`

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CONFIG_FILE_NAME: &str = "blockmap.toml";

/// Default block size (1 MiB)
pub const DEFAULT_BLOCK_SIZE: u32 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Block size in bytes; fixed once the first version is stored
    pub block_size: u32,
    /// Version map file name, relative to the repository root
    pub map_file: String,
    /// Payload directory, relative to the repository root
    pub payload_dir: String,
    /// Hash blocks on the rayon pool
    pub parallel_hashing: bool,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            map_file: "blockmap.idx".to_string(),
            payload_dir: "payload".to_string(),
            parallel_hashing: true,
        }
    }
}

impl RepoConfig {
    /// Load the repository config, falling back to defaults when none exists
    pub fn load<P: AsRef<Path>>(repo: P) -> Result<Self> {
        let config_path = Self::config_path(repo);

        if config_path.exists() {
            debug!("Loading config from {}", config_path.display());
            let content = fs::read_to_string(&config_path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            debug!("Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save<P: AsRef<Path>>(&self, repo: P) -> Result<()> {
        self.validate()?;
        let config_path = Self::config_path(repo);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content)?;
        debug!("Config saved to {}", config_path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::Configuration {
                reason: "block_size must be greater than zero".to_string(),
            });
        }
        if self.map_file.trim().is_empty() {
            return Err(Error::Configuration {
                reason: "map_file must not be empty".to_string(),
            });
        }
        if self.payload_dir.trim().is_empty() {
            return Err(Error::Configuration {
                reason: "payload_dir must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn config_path<P: AsRef<Path>>(repo: P) -> PathBuf {
        repo.as_ref().join(CONFIG_FILE_NAME)
    }

    pub fn map_path<P: AsRef<Path>>(&self, repo: P) -> PathBuf {
        repo.as_ref().join(&self.map_file)
    }

    pub fn payload_path<P: AsRef<Path>>(&self, repo: P) -> PathBuf {
        repo.as_ref().join(&self.payload_dir)
    }

    /// Payload file holding the blocks a version stored, in slot order
    pub fn version_payload_path<P: AsRef<Path>>(&self, repo: P, version: u32) -> PathBuf {
        self.payload_path(repo)
            .join(format!("version-{:06}.blk", version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_uses_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config = RepoConfig::load(temp_dir.path())?;
        assert_eq!(config, RepoConfig::default());
        Ok(())
    }

    #[test]
    fn test_config_round_trip() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config = RepoConfig {
            block_size: 4096,
            parallel_hashing: false,
            ..RepoConfig::default()
        };
        config.save(temp_dir.path())?;
        assert_eq!(RepoConfig::load(temp_dir.path())?, config);
        Ok(())
    }

    #[test]
    fn test_partial_config_fills_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(RepoConfig::config_path(temp_dir.path()), "block_size = 512\n")?;
        let config = RepoConfig::load(temp_dir.path())?;
        assert_eq!(config.block_size, 512);
        assert_eq!(config.map_file, "blockmap.idx");
        Ok(())
    }

    #[test]
    fn test_zero_block_size_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(RepoConfig::config_path(temp_dir.path()), "block_size = 0\n")?;
        let result = RepoConfig::load(temp_dir.path());
        assert!(matches!(result, Err(Error::Configuration { .. })));
        Ok(())
    }

    #[test]
    fn test_malformed_config_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(RepoConfig::config_path(temp_dir.path()), "block_size = \"big\"\n")?;
        assert!(matches!(
            RepoConfig::load(temp_dir.path()),
            Err(Error::TomlParse(_))
        ));
        Ok(())
    }

    #[test]
    fn test_payload_paths() {
        let config = RepoConfig::default();
        assert_eq!(
            config.version_payload_path("/repo", 3),
            PathBuf::from("/repo/payload/version-000003.blk")
        );
    }
}
