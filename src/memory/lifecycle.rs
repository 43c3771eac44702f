//! Ties the index, the resolver and durable storage together: flushing dirty
//! chunks, releasing traces and evicting what nobody holds anymore.

use super::chunk::Chunk;
use super::entry::{ChunkKey, NULL};
use super::index::TemporalIndex;
use super::resolver::{ResolutionTrace, Resolver};
use crate::config::SpaceConfig;
use crate::error::Result;
use crate::storage::{ChunkStorage, FileStorage, MemoryStorage, StorageError};
use std::sync::Arc;
use tracing::debug;

/// Flush position of a key: state chunks, then time trees, then universe
/// maps, then the global universe tree. Nothing reaches storage before the
/// chunks it names.
fn flush_rank(key: &ChunkKey) -> u8 {
    if key.is_state() {
        0
    } else if key.universe != NULL {
        1
    } else if key.object != NULL {
        2
    } else {
        3
    }
}

pub struct ChunkSpace {
    config: SpaceConfig,
    index: Arc<TemporalIndex>,
    resolver: Resolver,
    storage: Arc<dyn ChunkStorage>,
}

impl ChunkSpace {
    pub fn new(config: SpaceConfig, storage: Arc<dyn ChunkStorage>) -> Result<Self> {
        config.validate()?;
        let index = Arc::new(TemporalIndex::new(config.index.clone())?);
        let resolver = Resolver::new(Arc::clone(&index), Arc::clone(&storage), config.memoize_resolutions);
        Ok(Self {
            config,
            index,
            resolver,
            storage,
        })
    }

    /// A space backed by files under `config.storage.storage_path`.
    pub fn open(config: SpaceConfig) -> Result<Self> {
        let storage = FileStorage::new(config.storage.clone()).map_err(StorageError::from)?;
        Self::new(config, Arc::new(storage))
    }

    /// A space whose durable side is process memory.
    pub fn in_memory(config: SpaceConfig) -> Result<Self> {
        Self::new(config, Arc::new(MemoryStorage::default()))
    }

    pub fn config(&self) -> &SpaceConfig {
        &self.config
    }

    pub fn index(&self) -> &TemporalIndex {
        &self.index
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn storage(&self) -> &Arc<dyn ChunkStorage> {
        &self.storage
    }

    /// Triples whose chunks changed since they were last flushed. Harvesting
    /// does not clear anything.
    pub fn dirty_keys(&self) -> Result<Vec<ChunkKey>> {
        self.index.dirty_keys()
    }

    /// Writes every dirty chunk to storage and marks each one persisted only
    /// once its write succeeded. State chunks go first and the trees naming
    /// them after, so a failed write never leaves a durable tree pointing at a
    /// missing chunk. The failed chunk and every chunk after it stay dirty.
    /// Returns the number of chunks written.
    pub fn flush(&self) -> Result<usize> {
        let mut dirty = self.index.dirty_keys()?;
        dirty.sort_by_key(flush_rank);
        let mut written = 0;
        for key in dirty {
            let Some(chunk) = self.index.get(&key)? else {
                continue;
            };
            let (bytes, generation) = chunk.encode()?;
            self.storage.put(&key, &bytes)?;
            chunk.mark_persisted(generation);
            written += 1;
        }
        debug!(written, "chunks flushed");
        Ok(written)
    }

    /// Gives back the retentions held by `trace`. Chunks left without holders
    /// are evicted when clean, state chunk first, then its time tree, then the
    /// universe map. Returns the number of evicted chunks.
    ///
    /// The caller must not keep using the trace's chunks afterwards.
    pub fn release(&self, trace: ResolutionTrace) -> Result<usize> {
        let _exclusive = self.resolver.exclusive();
        let resolved = trace.resolved;
        let tree_key = ChunkKey::time_tree(resolved.universe, resolved.object);
        let map_key = ChunkKey::universe_map(resolved.object);

        let mut evicted = 0;
        if trace.chunk.release() <= 0 && self.evict(&resolved, &trace.chunk)? {
            evicted += 1;
        }
        if let Some(tree) = &trace.time_tree {
            if tree.release() <= 0 && self.evict(&tree_key, tree)? {
                evicted += 1;
            }
        }
        if let Some(map) = &trace.universe_map {
            if map.release() <= 0 && self.evict(&map_key, map)? {
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    /// Callers hold the resolver's exclusive gate.
    fn evict(&self, key: &ChunkKey, chunk: &Arc<Chunk>) -> Result<bool> {
        let evicted = self
            .index
            .remove_if(key, chunk, |chunk| chunk.retained() <= 0 && !chunk.is_dirty())?;
        if evicted {
            if key.is_state() {
                self.resolver.forget_aliases_to(key)?;
            }
            debug!(key = %key, "chunk evicted");
        }
        Ok(evicted)
    }

    /// Evicts every clean chunk nobody retains, except the global universe
    /// tree. Returns the number of evicted chunks.
    pub fn sweep(&self) -> Result<usize> {
        let global = ChunkKey::global_universe_tree();
        let _exclusive = self.resolver.exclusive();
        let mut evicted = 0;
        for (key, chunk, alias) in self.index.entries()? {
            if alias || key == global {
                continue;
            }
            if self.evict(&key, &chunk)? {
                evicted += 1;
            }
        }
        debug!(evicted, "sweep finished");
        Ok(evicted)
    }

    pub fn compact(&self) -> Result<()> {
        self.index.compact()
    }

    /// Drops every chunk from memory, dirty or not, and starts over with an
    /// empty index. Flush first to keep unsaved changes.
    pub fn clear(&self) -> Result<()> {
        let _exclusive = self.resolver.exclusive();
        self.index.clear()?;
        self.resolver.reset();
        Ok(())
    }

    /// Drops every chunk from memory and retires the space.
    pub fn delete(&self) -> Result<()> {
        let _exclusive = self.resolver.exclusive();
        self.index.delete()?;
        self.resolver.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::storage::StorageError;
    use parking_lot::Mutex;
    use std::thread;

    #[derive(Default)]
    struct RecordingStorage {
        inner: MemoryStorage,
        puts: Mutex<Vec<ChunkKey>>,
    }

    impl ChunkStorage for RecordingStorage {
        fn get(&self, key: &ChunkKey) -> std::result::Result<Option<Vec<u8>>, StorageError> {
            self.inner.get(key)
        }

        fn put(&self, key: &ChunkKey, bytes: &[u8]) -> std::result::Result<(), StorageError> {
            self.puts.lock().push(*key);
            self.inner.put(key, bytes)
        }

        fn remove(&self, key: &ChunkKey) -> std::result::Result<(), StorageError> {
            self.inner.remove(key)
        }
    }

    fn space() -> ChunkSpace {
        ChunkSpace::in_memory(SpaceConfig::default()).unwrap()
    }

    #[test]
    fn test_new_chunks_are_dirty_until_flushed() {
        let space = space();
        space.resolver().create(0, 10, 1).unwrap();

        let mut dirty = space.dirty_keys().unwrap();
        dirty.sort();
        assert_eq!(
            dirty,
            vec![
                ChunkKey::state(0, 10, 1),
                ChunkKey::time_tree(0, 1),
                ChunkKey::universe_map(1),
            ]
        );
        assert_eq!(space.flush().unwrap(), 3);
        assert!(space.dirty_keys().unwrap().is_empty());
        assert_eq!(space.flush().unwrap(), 0);
    }

    #[test]
    fn test_flush_writes_chunks_before_trees_naming_them() {
        let storage = Arc::new(RecordingStorage::default());
        let space = ChunkSpace::new(SpaceConfig::default(), storage.clone()).unwrap();
        space.resolver().create(0, 10, 1).unwrap();
        space.flush().unwrap();
        space.resolver().create(0, 20, 1).unwrap();
        let branch = space.resolver().fork(0).unwrap();
        space.resolver().create(branch, 30, 1).unwrap();
        storage.puts.lock().clear();

        space.flush().unwrap();
        let puts = storage.puts.lock().clone();
        assert_eq!(puts.len(), 6);
        let ranks: Vec<u8> = puts.iter().map(flush_rank).collect();
        let mut sorted = ranks.clone();
        sorted.sort();
        assert_eq!(ranks, sorted);
        assert_eq!(puts.last(), Some(&ChunkKey::global_universe_tree()));
    }

    #[test]
    fn test_dirty_chunk_survives_release() {
        let space = space();
        let trace = space.resolver().create(0, 10, 1).unwrap();
        assert_eq!(space.release(trace).unwrap(), 0);
        assert_eq!(space.index().size().unwrap(), 3);
    }

    #[test]
    fn test_release_evicts_clean_chunks_and_reloads() {
        let space = space();
        let trace = space.resolver().create(0, 10, 1).unwrap();
        trace.chunk.set_long(0, 9).unwrap();
        space.flush().unwrap();

        assert_eq!(space.release(trace).unwrap(), 3);
        assert_eq!(space.index().size().unwrap(), 0);

        let again = space.resolver().lookup(0, 10, 1).unwrap().into_trace().unwrap();
        assert_eq!(again.chunk.get_long(0).unwrap(), Some(9));
        assert!(!again.chunk.is_dirty());
    }

    #[test]
    fn test_shared_chunk_stays_while_held() {
        let space = space();
        let writer = space.resolver().create(0, 10, 1).unwrap();
        space.flush().unwrap();
        let reader = space.resolver().lookup(0, 10, 1).unwrap().into_trace().unwrap();

        assert_eq!(space.release(writer).unwrap(), 0);
        assert_eq!(space.release(reader).unwrap(), 3);
    }

    #[test]
    fn test_sweep_keeps_global_tree() {
        let space = space();
        space.resolver().fork(0).unwrap();
        let trace = space.resolver().create(0, 10, 1).unwrap();
        space.flush().unwrap();
        assert_eq!(space.sweep().unwrap(), 0);

        for chunk in trace.chunks() {
            chunk.release();
        }
        assert_eq!(space.sweep().unwrap(), 3);
        assert_eq!(space.index().size().unwrap(), 1);
        assert_eq!(space.resolver().parent(1).unwrap(), Some(0));
    }

    #[test]
    fn test_eviction_drops_aliases_to_the_chunk() {
        let space = space();
        let created = space.resolver().create(0, 10, 1).unwrap();
        space.flush().unwrap();
        assert_eq!(space.release(created).unwrap(), 3);

        let memo = space.resolver().lookup(0, 15, 1).unwrap().into_trace().unwrap();
        assert_eq!(memo.resolved, ChunkKey::state(0, 10, 1));
        assert_eq!(space.index().size().unwrap(), 4);

        assert_eq!(space.release(memo).unwrap(), 3);
        assert_eq!(space.index().size().unwrap(), 0);
    }

    #[test]
    fn test_clear_leaves_no_untracked_aliases() {
        let space = Arc::new(space());
        let created = space.resolver().create(0, 10, 1).unwrap();
        space.flush().unwrap();
        space.release(created).unwrap();

        let reader = {
            let space = Arc::clone(&space);
            thread::spawn(move || {
                for _ in 0..300 {
                    if let Some(trace) = space.resolver().lookup(0, 15, 1).unwrap().into_trace() {
                        space.release(trace).unwrap();
                    }
                }
            })
        };
        for _ in 0..300 {
            space.clear().unwrap();
        }
        reader.join().unwrap();

        space.sweep().unwrap();
        assert_eq!(space.index().size().unwrap(), 0);
    }

    #[test]
    fn test_clear_and_delete() {
        let space = space();
        space.resolver().create(0, 10, 1).unwrap();
        space.flush().unwrap();
        space.clear().unwrap();
        assert_eq!(space.index().size().unwrap(), 0);
        assert!(space.resolver().lookup(0, 10, 1).unwrap().is_resolved());

        space.delete().unwrap();
        assert!(matches!(space.dirty_keys(), Err(StoreError::Deleted)));
        assert!(matches!(space.resolver().lookup(0, 10, 1), Err(StoreError::Deleted)));
    }
}
