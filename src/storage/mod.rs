//! Durable storage boundary for chunks.
//!
//! The in-memory engine only ever sees opaque encoded blocks keyed by triple;
//! what a backend does with them (files, remote blobs, nothing) is its own
//! business.

pub mod compression;
pub mod file;

use crate::memory::entry::ChunkKey;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use thiserror::Error;

pub use file::FileStorage;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("Invalid checksum for chunk {0}")]
    ChecksumMismatch(ChunkKey),
    #[error("Decompression error: {0}")]
    Compression(String),
}

/// Backend a chunk space loads misses from and flushes dirty chunks to.
pub trait ChunkStorage: Send + Sync {
    fn get(&self, key: &ChunkKey) -> Result<Option<Vec<u8>>, StorageError>;

    /// Stores `payload` durably. Returning `Ok` is the durability acknowledgement.
    fn put(&self, key: &ChunkKey, payload: &[u8]) -> Result<(), StorageError>;

    fn remove(&self, key: &ChunkKey) -> Result<(), StorageError>;
}

/// Volatile backend, mostly for tests and ephemeral spaces.
#[derive(Default)]
pub struct MemoryStorage {
    blocks: RwLock<HashMap<ChunkKey, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.blocks.read().contains_key(key)
    }
}

impl ChunkStorage for MemoryStorage {
    fn get(&self, key: &ChunkKey) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blocks.read().get(key).cloned())
    }

    fn put(&self, key: &ChunkKey, payload: &[u8]) -> Result<(), StorageError> {
        self.blocks.write().insert(*key, payload.to_vec());
        Ok(())
    }

    fn remove(&self, key: &ChunkKey) -> Result<(), StorageError> {
        self.blocks.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_roundtrip() -> Result<(), StorageError> {
        let storage = MemoryStorage::new();
        let key = ChunkKey::new(0, 10, 3);

        assert!(storage.get(&key)?.is_none());
        storage.put(&key, b"payload")?;
        assert_eq!(storage.get(&key)?.as_deref(), Some(&b"payload"[..]));
        assert_eq!(storage.len(), 1);

        storage.remove(&key)?;
        assert!(storage.is_empty());
        Ok(())
    }
}
