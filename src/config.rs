use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub use crate::memory::index::IndexConfig;
pub use crate::storage::file::FileStorageConfig;

/// Configuration of a whole `ChunkSpace`.
///
/// ```toml
/// memoize_resolutions = true
///
/// [index]
/// initial_capacity = 16
/// load_factor = 0.75
/// max_capacity = 4294967295
///
/// [storage]
/// storage_path = "storage/chunks"
/// compression = "LZ4"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceConfig {
    pub index: IndexConfig,
    /// Durable storage used by `ChunkSpace::open`.
    pub storage: FileStorageConfig,
    /// Remember resolutions that landed on an ancestor at the requested triple.
    pub memoize_resolutions: bool,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            index: IndexConfig::default(),
            storage: FileStorageConfig::default(),
            memoize_resolutions: true,
        }
    }
}

impl SpaceConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SpaceConfig =
            toml::from_str(text).map_err(|e| StoreError::Config(format!("failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.index.validate()
    }
}
