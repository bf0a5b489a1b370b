use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use udisk_cas::FsyncPolicy;
use udisk_chunker::DEFAULT_CHUNK_SIZE;
use udisk_namespace::NodeStoreKind;
use udisk_transfer::{
    TransferConfig, DEFAULT_LARGE_THRESHOLD, DEFAULT_MAX_OBJECT_SIZE, DEFAULT_SMALL_THRESHOLD,
};

/// Where node bodies are kept between runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStoreSetting {
    /// Rebuilt from the metadata database on every start
    #[default]
    Memory,
    Disk,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsyncSetting {
    #[default]
    Always,
    Batch,
    Async,
    Never,
}

const FSYNC_BATCH_SIZE: u32 = 64;

impl From<FsyncSetting> for FsyncPolicy {
    fn from(setting: FsyncSetting) -> Self {
        match setting {
            FsyncSetting::Always => FsyncPolicy::Always,
            FsyncSetting::Batch => FsyncPolicy::Batch(FSYNC_BATCH_SIZE),
            FsyncSetting::Async => FsyncPolicy::Async,
            FsyncSetting::Never => FsyncPolicy::Never,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub storage_path: PathBuf,
    #[serde(default)]
    pub node_store: NodeStoreSetting,
    #[serde(default)]
    pub fsync: FsyncSetting,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_small_threshold")]
    pub small_threshold: u64,
    #[serde(default = "default_large_threshold")]
    pub large_threshold: u64,
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_small_threshold() -> u64 {
    DEFAULT_SMALL_THRESHOLD
}

fn default_large_threshold() -> u64 {
    DEFAULT_LARGE_THRESHOLD
}

fn default_max_object_size() -> u64 {
    DEFAULT_MAX_OBJECT_SIZE
}

fn default_pool_size() -> u32 {
    8
}

impl Config {
    /// Defaults rooted at `storage_path`
    pub fn with_storage(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            node_store: NodeStoreSetting::default(),
            fsync: FsyncSetting::default(),
            chunk_size: default_chunk_size(),
            small_threshold: default_small_threshold(),
            large_threshold: default_large_threshold(),
            max_object_size: default_max_object_size(),
            pool_size: default_pool_size(),
        }
    }

    /// Save configuration to `config_path`
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Load configuration from `config_path`
    pub fn load_from(config_path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load `config_path` if it exists, otherwise the defaults
    pub fn load_or_default(config_path: &Path) -> Result<Config> {
        if config_path.exists() {
            Self::load_from(config_path)
        } else {
            Ok(Self::with_storage(default_storage_path()?))
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be greater than zero");
        }
        if self.small_threshold > self.large_threshold {
            anyhow::bail!(
                "small_threshold ({}) exceeds large_threshold ({})",
                self.small_threshold,
                self.large_threshold
            );
        }
        if self.max_object_size == 0 {
            anyhow::bail!("max_object_size must be greater than zero");
        }
        if self.pool_size == 0 {
            anyhow::bail!("pool_size must be greater than zero");
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage_path.join("index.sqlite")
    }

    pub fn objects_path(&self) -> PathBuf {
        self.storage_path.join("cas")
    }

    pub fn staging_path(&self) -> PathBuf {
        self.storage_path.join("staging")
    }

    pub fn node_store_kind(&self) -> NodeStoreKind {
        match self.node_store {
            NodeStoreSetting::Memory => NodeStoreKind::Memory,
            NodeStoreSetting::Disk => NodeStoreKind::Disk(self.storage_path.join("nodes")),
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            staging_root: self.staging_path(),
            chunk_size: self.chunk_size,
            small_threshold: self.small_threshold,
            large_threshold: self.large_threshold,
            max_object_size: self.max_object_size,
        }
    }
}

/// Get the path to the config file
pub fn get_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Home directory not found")?;
    Ok(home.join(".udisk").join("config.toml"))
}

/// Get the default storage path
pub fn default_storage_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Home directory not found")?;
    Ok(home.join(".udisk").join("storage"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_serialization() {
        let mut config = Config::with_storage("/tmp/udisk");
        config.node_store = NodeStoreSetting::Disk;
        config.fsync = FsyncSetting::Batch;

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("node_store = \"disk\""));
        assert!(toml_str.contains("fsync = \"batch\""));
        assert!(toml_str.contains("chunk_size = 5242880"));

        let deserialized: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized, config);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: Config = toml::from_str("storage_path = \"/srv/udisk\"").unwrap();
        assert_eq!(config.node_store, NodeStoreSetting::Memory);
        assert_eq!(config.fsync, FsyncSetting::Always);
        assert_eq!(config.chunk_size, 5 * 1024 * 1024);
        assert_eq!(config.small_threshold, 1024 * 1024);
        assert_eq!(config.large_threshold, 100 * 1024 * 1024);
        assert_eq!(config.max_object_size, 64 * 1024 * 1024 * 1024);
        assert_eq!(config.pool_size, 8);
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("conf").join("config.toml");

        let mut config = Config::with_storage(temp_dir.path().join("storage"));
        config.chunk_size = 1024;
        config.save_to(&config_path).unwrap();

        let loaded = Config::load_from(&config_path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.transfer_config().chunk_size, 1024);
        assert_eq!(loaded.database_path(), temp_dir.path().join("storage").join("index.sqlite"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(&config_path, "storage_path = \"/x\"\nchunk_size = 0\n").unwrap();
        assert!(Config::load_from(&config_path).is_err());

        std::fs::write(&config_path, "storage_path = \"/x\"\nsmall_threshold = 10\nlarge_threshold = 5\n").unwrap();
        assert!(Config::load_from(&config_path).is_err());

        std::fs::write(&config_path, "storage_path = \"/x\"\nmax_object_size = 0\n").unwrap();
        assert!(Config::load_from(&config_path).is_err());
    }

    #[test]
    fn test_node_store_kind() {
        let mut config = Config::with_storage("/data");
        assert_eq!(config.node_store_kind(), NodeStoreKind::Memory);
        config.node_store = NodeStoreSetting::Disk;
        assert_eq!(config.node_store_kind(), NodeStoreKind::Disk(PathBuf::from("/data/nodes")));
    }
}
