use super::compression::{CompressionAlgorithm, Compressor};
use super::{ChunkStorage, StorageError};
use crate::memory::entry::ChunkKey;
use bincode::{deserialize, serialize};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileStorageConfig {
    pub storage_path: PathBuf,
    pub compression: CompressionAlgorithm,
}

impl Default for FileStorageConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("storage/chunks"),
            compression: CompressionAlgorithm::LZ4,
        }
    }
}

/// On-disk envelope of one chunk.
#[derive(Serialize, Deserialize)]
struct StoredBlock {
    checksum: u32,
    compression: CompressionAlgorithm,
    payload: Vec<u8>,
}

impl StoredBlock {
    fn verify(&self) -> bool {
        self.checksum == crc32fast::hash(&self.payload)
    }
}

/// One file per triple under `storage_path`, written through a temporary
/// file and renamed into place so a crash never leaves a torn block.
pub struct FileStorage {
    config: FileStorageConfig,
    compressor: Compressor,
}

impl FileStorage {
    pub fn new(config: FileStorageConfig) -> io::Result<Self> {
        fs::create_dir_all(&config.storage_path)?;
        Ok(Self {
            compressor: Compressor::new(config.compression),
            config,
        })
    }

    pub fn storage_path(&self) -> &Path {
        &self.config.storage_path
    }

    fn block_path(&self, key: &ChunkKey) -> PathBuf {
        self.config.storage_path.join(format!(
            "chunk_{:016x}_{:016x}_{:016x}.bin",
            key.universe, key.time, key.object
        ))
    }

    fn read_block(path: &Path) -> Result<Option<StoredBlock>, StorageError> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;
        Ok(Some(deserialize(&buffer)?))
    }
}

impl ChunkStorage for FileStorage {
    fn get(&self, key: &ChunkKey) -> Result<Option<Vec<u8>>, StorageError> {
        let Some(block) = Self::read_block(&self.block_path(key))? else {
            return Ok(None);
        };
        if !block.verify() {
            warn!(key = %key, "checksum mismatch on stored chunk");
            return Err(StorageError::ChecksumMismatch(*key));
        }
        let payload = Compressor::new(block.compression).decompress(&block.payload)?;
        Ok(Some(payload))
    }

    fn put(&self, key: &ChunkKey, payload: &[u8]) -> Result<(), StorageError> {
        let compressed = self.compressor.compress(payload);
        let block = StoredBlock {
            checksum: crc32fast::hash(&compressed),
            compression: self.compressor.algorithm(),
            payload: compressed,
        };
        let encoded = serialize(&block)?;

        let path = self.block_path(key);
        let tmp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &path)?;

        debug!(key = %key, bytes = encoded.len(), "chunk block written");
        Ok(())
    }

    fn remove(&self, key: &ChunkKey) -> Result<(), StorageError> {
        match fs::remove_file(self.block_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn storage_in(dir: &Path, compression: CompressionAlgorithm) -> FileStorage {
        FileStorage::new(FileStorageConfig {
            storage_path: dir.to_path_buf(),
            compression,
        })
        .unwrap()
    }

    #[test]
    fn test_file_storage_roundtrip() -> Result<(), StorageError> {
        let temp_dir = tempdir().unwrap();
        let storage = storage_in(temp_dir.path(), CompressionAlgorithm::LZ4);
        let key = ChunkKey::new(1, 100, 7);

        assert!(storage.get(&key)?.is_none());
        storage.put(&key, b"some chunk payload")?;
        assert_eq!(storage.get(&key)?.as_deref(), Some(&b"some chunk payload"[..]));

        storage.remove(&key)?;
        assert!(storage.get(&key)?.is_none());
        storage.remove(&key)?;
        Ok(())
    }

    #[test]
    fn test_blocks_written_uncompressed_stay_readable() -> Result<(), StorageError> {
        let temp_dir = tempdir().unwrap();
        let key = ChunkKey::new(0, 5, 9);
        storage_in(temp_dir.path(), CompressionAlgorithm::None).put(&key, b"plain")?;

        let reader = storage_in(temp_dir.path(), CompressionAlgorithm::LZ4);
        assert_eq!(reader.get(&key)?.as_deref(), Some(&b"plain"[..]));
        Ok(())
    }

    #[test]
    fn test_corrupted_block_is_detected() -> Result<(), StorageError> {
        let temp_dir = tempdir().unwrap();
        let storage = storage_in(temp_dir.path(), CompressionAlgorithm::None);
        let key = ChunkKey::new(0, 1, 2);
        storage.put(&key, b"0123456789")?;

        let path = storage.block_path(&key);
        let mut bytes = fs::read(&path)?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes)?;

        assert!(matches!(
            storage.get(&key),
            Err(StorageError::ChecksumMismatch(k)) if k == key
        ));
        Ok(())
    }
}
