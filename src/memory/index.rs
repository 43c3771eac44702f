//! Temporal index: `(universe, time, object)` -> chunk.
//!
//! A separate-chaining hash table laid out in one contiguous [`Segment`].
//! Bucket heads and chain links are record indices, so growing or compacting
//! the table is a copy into a freshly allocated segment followed by a swap.
//! Chunks themselves live in an arena addressed by the handles stored in the
//! records; handle `0` marks a free or dropped record.
//!
//! ## Concurrency
//!
//! The table sits behind one `RwLock`. Mutators (`get_or_put`,
//! `put_and_replace`, `remove`, `rehash`, `compact`, `clear`, `delete`) take
//! the write lock, readers take the read lock. A replacement segment is fully
//! built before it is swapped in, so readers only ever see a complete table.

use super::chunk::{Chunk, ChunkKind};
use super::entry::ChunkKey;
use super::segment::{Segment, NO_SLOT};
use crate::error::{Result, StoreError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Record capacity of a new or cleared table.
    pub initial_capacity: u32,
    /// Fraction of the capacity that may hold live entries before growing.
    pub load_factor: f32,
    /// Largest capacity the table may grow to. Growth past it fails with
    /// `StoreError::Allocation` and leaves the table as it was.
    pub max_capacity: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 16,
            load_factor: 0.75,
            max_capacity: u32::MAX,
        }
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.load_factor > 0.0 && self.load_factor <= 1.0) {
            return Err(StoreError::Config(format!(
                "load_factor must be in (0, 1], got {}",
                self.load_factor
            )));
        }
        if self.max_capacity < self.initial_capacity.max(1) {
            return Err(StoreError::Config(format!(
                "max_capacity {} is below the initial capacity {}",
                self.max_capacity, self.initial_capacity
            )));
        }
        Ok(())
    }
}

struct ArenaEntry {
    chunk: Arc<Chunk>,
    /// Set for memoized resolutions that point at a chunk owned by another key.
    alias: bool,
}

#[derive(Default)]
struct ChunkArena {
    slots: Vec<Option<ArenaEntry>>,
    free: Vec<usize>,
}

impl ChunkArena {
    fn insert(&mut self, entry: ArenaEntry) -> u64 {
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(entry);
                index
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        index as u64 + 1
    }

    fn get(&self, handle: u64) -> Option<&ArenaEntry> {
        let index = handle.checked_sub(1)? as usize;
        self.slots.get(index)?.as_ref()
    }

    fn replace(&mut self, handle: u64, entry: ArenaEntry) -> Option<ArenaEntry> {
        let index = handle.checked_sub(1)? as usize;
        self.slots.get_mut(index)?.replace(entry)
    }

    fn take(&mut self, handle: u64) -> Option<ArenaEntry> {
        let index = handle.checked_sub(1)? as usize;
        let taken = self.slots.get_mut(index)?.take();
        if taken.is_some() {
            self.free.push(index);
        }
        taken
    }
}

struct Table {
    segment: Segment,
    threshold: u32,
    arena: ChunkArena,
}

fn threshold_for(capacity: u32, load_factor: f32) -> u32 {
    (capacity as f32 * load_factor) as u32
}

/// Capacity for a table that must hold `length` records.
fn bounded(length: u64, config: &IndexConfig) -> Result<u32> {
    u32::try_from(length)
        .ok()
        .filter(|&length| length <= config.max_capacity)
        .ok_or(StoreError::Allocation {
            requested: length as usize,
        })
}

impl Table {
    fn allocate(config: &IndexConfig) -> Result<Table> {
        let capacity = config.initial_capacity.max(1);
        Ok(Table {
            segment: Segment::allocate(capacity)?,
            threshold: threshold_for(capacity, config.load_factor),
            arena: ChunkArena::default(),
        })
    }

    fn find(&self, key: &ChunkKey) -> Option<u32> {
        if self.segment.element_count() == 0 {
            return None;
        }
        let bucket = key.bucket(self.segment.element_data_size());
        let mut m = self.segment.head(bucket);
        while m != NO_SLOT {
            let slot = m as u32;
            if self.segment.key(slot) == *key {
                return Some(slot);
            }
            m = self.segment.next(slot);
        }
        None
    }

    fn entry(&self, slot: u32) -> Option<&ArenaEntry> {
        self.arena.get(self.segment.handle(slot))
    }

    /// Grows to `max(1, capacity * 2)`, keeping every record at its index and
    /// rebuilding all chains from the keys. On failure the table is untouched.
    fn rehash(&mut self, config: &IndexConfig) -> Result<()> {
        let capacity = self.segment.element_data_size();
        let length = bounded((capacity as u64 * 2).max(1), config)?;

        let mut grown = Segment::allocate(length)?;
        grown.copy_from(&self.segment, capacity);
        for slot in 0..length {
            grown.set_next(slot, NO_SLOT);
            grown.set_head(slot, NO_SLOT);
        }
        for slot in 0..capacity {
            if grown.handle(slot) != 0 {
                let bucket = grown.key(slot).bucket(length);
                grown.set_next(slot, grown.head(bucket));
                grown.set_head(bucket, slot as i32);
            }
        }

        self.segment = grown;
        self.threshold = threshold_for(length, config.load_factor);
        debug!(from = capacity, to = length, "temporal index rehashed");
        Ok(())
    }

    /// Repacks live records into a table sized from the live count and
    /// forgets dropped records. The size is capped at `max_capacity`.
    fn compact(&mut self, config: &IndexConfig) -> Result<()> {
        let dropped = self.segment.dropped_count();
        if dropped == 0 {
            return Ok(());
        }
        let count = self.segment.element_count();
        let capacity = self.segment.element_data_size();
        let length = bounded((count as u64 * 2).clamp(1, config.max_capacity as u64), config)?;

        let mut packed = Segment::allocate(length)?;
        let mut current = 0u32;
        for slot in 0..capacity {
            let handle = self.segment.handle(slot);
            if handle == 0 {
                continue;
            }
            let key = self.segment.key(slot);
            packed.set_key(current, &key);
            packed.set_handle(current, handle);
            let bucket = key.bucket(length);
            packed.set_next(current, packed.head(bucket));
            packed.set_head(bucket, current as i32);
            current += 1;
        }
        packed.set_element_count(current);
        packed.set_dropped_count(0);

        self.segment = packed;
        self.threshold = threshold_for(length, config.load_factor);
        debug!(
            live = current,
            dropped,
            from = capacity,
            to = length,
            "temporal index compacted"
        );
        Ok(())
    }

    fn insert_new(&mut self, key: &ChunkKey, entry: ArenaEntry, config: &IndexConfig) -> Result<()> {
        let count = self.segment.element_count();
        let dropped = self.segment.dropped_count();
        if dropped > 0 && count + dropped >= self.segment.element_data_size() {
            self.compact(config)?;
        }
        let dropped = self.segment.dropped_count();
        if count + 1 > self.threshold || count + dropped >= self.segment.element_data_size() {
            self.rehash(config)?;
        }

        // Capacity may have changed above; the bucket is taken from the final table.
        let bucket = key.bucket(self.segment.element_data_size());
        let slot = count + dropped;
        let handle = self.arena.insert(entry);

        self.segment.set_key(slot, key);
        self.segment.set_handle(slot, handle);
        self.segment.set_next(slot, self.segment.head(bucket));
        self.segment.set_head(bucket, slot as i32);
        self.segment.set_element_count(count + 1);
        Ok(())
    }

    /// Unlinks `key` if its entry passes `accept`, leaving the record
    /// dropped until the next compaction.
    fn remove_where(
        &mut self,
        key: &ChunkKey,
        accept: impl FnOnce(&ArenaEntry) -> bool,
    ) -> Option<ArenaEntry> {
        if self.segment.element_count() == 0 {
            return None;
        }
        let bucket = key.bucket(self.segment.element_data_size());
        let mut m = self.segment.head(bucket);
        let mut last = NO_SLOT;
        while m != NO_SLOT {
            if self.segment.key(m as u32) == *key {
                break;
            }
            last = m;
            m = self.segment.next(m as u32);
        }
        if m == NO_SLOT {
            return None;
        }
        let slot = m as u32;
        if !self.entry(slot).map_or(false, accept) {
            return None;
        }

        let next = self.segment.next(slot);
        if last == NO_SLOT {
            self.segment.set_head(bucket, next);
        } else {
            self.segment.set_next(last as u32, next);
        }
        self.segment.set_next(slot, NO_SLOT);

        let handle = self.segment.handle(slot);
        self.segment.set_handle(slot, 0);
        self.segment
            .set_element_count(self.segment.element_count() - 1);
        self.segment
            .set_dropped_count(self.segment.dropped_count() + 1);
        self.arena.take(handle)
    }

    fn live_slots(&self) -> impl Iterator<Item = (ChunkKey, &ArenaEntry)> + '_ {
        (0..self.segment.element_data_size()).filter_map(move |slot| {
            self.entry(slot).map(|entry| (self.segment.key(slot), entry))
        })
    }
}

pub struct TemporalIndex {
    config: IndexConfig,
    table: RwLock<Option<Table>>,
}

impl TemporalIndex {
    pub fn new(config: IndexConfig) -> Result<Self> {
        config.validate()?;
        let table = Table::allocate(&config)?;
        Ok(Self {
            config,
            table: RwLock::new(Some(table)),
        })
    }

    fn read<R>(&self, f: impl FnOnce(&Table) -> R) -> Result<R> {
        let guard = self.table.read();
        let table = guard.as_ref().ok_or(StoreError::Deleted)?;
        Ok(f(table))
    }

    fn write<R>(&self, f: impl FnOnce(&mut Table) -> Result<R>) -> Result<R> {
        let mut guard = self.table.write();
        let table = guard.as_mut().ok_or(StoreError::Deleted)?;
        f(table)
    }

    fn check_kind(key: &ChunkKey, chunk: &Chunk) -> Result<()> {
        let expected = ChunkKind::for_key(key)?;
        if chunk.kind() != expected {
            return Err(StoreError::KindMismatch {
                expected,
                found: chunk.kind(),
            });
        }
        Ok(())
    }

    /// Exact-match lookup.
    pub fn get(&self, key: &ChunkKey) -> Result<Option<Arc<Chunk>>> {
        self.read(|table| {
            table
                .find(key)
                .and_then(|slot| table.entry(slot))
                .map(|entry| Arc::clone(&entry.chunk))
        })
    }

    /// Returns the chunk already stored at `key`, or stores `candidate` and
    /// returns it. A losing candidate is simply dropped by the caller.
    pub fn get_or_put(&self, key: &ChunkKey, candidate: Arc<Chunk>) -> Result<Arc<Chunk>> {
        Self::check_kind(key, &candidate)?;
        let config = &self.config;
        self.write(|table| {
            if let Some(existing) = table.find(key).and_then(|slot| table.entry(slot)) {
                return Ok(Arc::clone(&existing.chunk));
            }
            table.insert_new(
                key,
                ArenaEntry {
                    chunk: Arc::clone(&candidate),
                    alias: false,
                },
                config,
            )?;
            Ok(candidate)
        })
    }

    /// Stores `payload` at `key`, replacing whatever was there. Returns the
    /// replaced chunk, if any.
    pub fn put_and_replace(&self, key: &ChunkKey, payload: Arc<Chunk>) -> Result<Option<Arc<Chunk>>> {
        Self::check_kind(key, &payload)?;
        self.force_put(key, payload)
    }

    /// Stores `chunk` at `key` as a memoized view of a chunk owned by another
    /// key, unless `key` is already taken. Aliases are skipped by `dirty_keys`.
    pub(crate) fn put_alias(&self, key: &ChunkKey, chunk: Arc<Chunk>) -> Result<bool> {
        Self::check_kind(key, &chunk)?;
        let config = &self.config;
        self.write(|table| {
            if table.find(key).is_some() {
                return Ok(false);
            }
            table.insert_new(key, ArenaEntry { chunk, alias: true }, config)?;
            Ok(true)
        })
    }

    fn force_put(&self, key: &ChunkKey, chunk: Arc<Chunk>) -> Result<Option<Arc<Chunk>>> {
        let config = &self.config;
        self.write(|table| {
            let entry = ArenaEntry { chunk, alias: false };
            match table.find(key) {
                Some(slot) => {
                    let handle = table.segment.handle(slot);
                    Ok(table.arena.replace(handle, entry).map(|old| old.chunk))
                }
                None => {
                    table.insert_new(key, entry, config)?;
                    Ok(None)
                }
            }
        })
    }

    /// Exact-match lookup that also reports whether the entry is an alias.
    pub(crate) fn get_entry(&self, key: &ChunkKey) -> Result<Option<(Arc<Chunk>, bool)>> {
        self.read(|table| {
            table
                .find(key)
                .and_then(|slot| table.entry(slot))
                .map(|entry| (Arc::clone(&entry.chunk), entry.alias))
        })
    }

    /// Unlinks `key` and releases the index's hold on its chunk. The record
    /// stays dropped until the next `compact`. Returns whether `key` was present.
    pub fn remove(&self, key: &ChunkKey) -> Result<bool> {
        self.write(|table| Ok(table.remove_where(key, |_| true).is_some()))
    }

    /// Removes `key` only while it is an alias.
    pub(crate) fn remove_alias(&self, key: &ChunkKey) -> Result<bool> {
        self.write(|table| Ok(table.remove_where(key, |entry| entry.alias).is_some()))
    }

    /// Removes `key` only while it still holds `chunk` and `evictable` agrees,
    /// both checked under the write lock.
    pub(crate) fn remove_if(
        &self,
        key: &ChunkKey,
        chunk: &Arc<Chunk>,
        evictable: impl FnOnce(&Chunk) -> bool,
    ) -> Result<bool> {
        self.write(|table| {
            let removed = table.remove_where(key, |entry| {
                !entry.alias && Arc::ptr_eq(&entry.chunk, chunk) && evictable(&entry.chunk)
            });
            Ok(removed.is_some())
        })
    }

    /// Keys of every owned (non-alias) chunk that reports itself dirty.
    pub fn dirty_keys(&self) -> Result<Vec<ChunkKey>> {
        self.read(|table| {
            table
                .live_slots()
                .filter(|(_, entry)| !entry.alias && entry.chunk.is_dirty())
                .map(|(key, _)| key)
                .collect()
        })
    }

    /// Every live entry with its chunk and alias flag.
    pub(crate) fn entries(&self) -> Result<Vec<(ChunkKey, Arc<Chunk>, bool)>> {
        self.read(|table| {
            table
                .live_slots()
                .map(|(key, entry)| (key, Arc::clone(&entry.chunk), entry.alias))
                .collect()
        })
    }

    /// Live entries, excluding dropped records.
    pub fn size(&self) -> Result<usize> {
        self.read(|table| table.segment.element_count() as usize)
    }

    pub fn capacity(&self) -> Result<u32> {
        self.read(|table| table.segment.element_data_size())
    }

    pub fn dropped(&self) -> Result<u32> {
        self.read(|table| table.segment.dropped_count())
    }

    /// Doubles the capacity and re-chains every live entry.
    pub fn rehash(&self) -> Result<()> {
        self.write(|table| table.rehash(&self.config))
    }

    pub fn compact(&self) -> Result<()> {
        self.write(|table| table.compact(&self.config))
    }

    /// Releases every chunk and starts over at the initial capacity.
    pub fn clear(&self) -> Result<()> {
        let fresh = Table::allocate(&self.config)?;
        self.write(|table| {
            let released = table.segment.element_count();
            *table = fresh;
            debug!(released, "temporal index cleared");
            Ok(())
        })
    }

    /// Releases every chunk and retires the index; any later call fails with
    /// `StoreError::Deleted`.
    pub fn delete(&self) -> Result<()> {
        let mut guard = self.table.write();
        let table = guard.take().ok_or(StoreError::Deleted)?;
        debug!(released = table.segment.element_count(), "temporal index deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(initial_capacity: u32) -> TemporalIndex {
        TemporalIndex::new(IndexConfig {
            initial_capacity,
            load_factor: 0.75,
            ..IndexConfig::default()
        })
        .unwrap()
    }

    fn state() -> Arc<Chunk> {
        Arc::new(Chunk::new_state())
    }

    #[test]
    fn test_get_on_empty_table() {
        let index = index_with(16);
        assert!(index.get(&ChunkKey::new(1, 2, 3)).unwrap().is_none());
        assert_eq!(index.size().unwrap(), 0);
    }

    #[test]
    fn test_get_or_put_keeps_first_winner() {
        let index = index_with(16);
        let key = ChunkKey::new(1, 100, 7);
        let first = state();
        let stored = index.get_or_put(&key, Arc::clone(&first)).unwrap();
        assert!(Arc::ptr_eq(&stored, &first));

        let second = index.get_or_put(&key, state()).unwrap();
        assert!(Arc::ptr_eq(&second, &first));
        assert_eq!(index.size().unwrap(), 1);
    }

    #[test]
    fn test_put_and_replace_overwrites() {
        let index = index_with(16);
        let key = ChunkKey::new(1, 100, 7);
        let first = state();
        assert!(index.put_and_replace(&key, Arc::clone(&first)).unwrap().is_none());

        let second = state();
        let replaced = index.put_and_replace(&key, Arc::clone(&second)).unwrap();
        assert!(Arc::ptr_eq(&replaced.unwrap(), &first));
        assert!(Arc::ptr_eq(&index.get(&key).unwrap().unwrap(), &second));
        assert_eq!(index.size().unwrap(), 1);
    }

    #[test]
    fn test_wrong_kind_is_rejected() {
        let index = index_with(16);
        let tree = Arc::new(Chunk::new(ChunkKind::TimeTree));
        assert!(matches!(
            index.get_or_put(&ChunkKey::new(0, 5, 1), tree),
            Err(StoreError::KindMismatch {
                expected: ChunkKind::State,
                found: ChunkKind::TimeTree
            })
        ));
        assert!(matches!(
            index.put_and_replace(&ChunkKey::time_tree(0, 1), state()),
            Err(StoreError::KindMismatch { .. })
        ));
        assert_eq!(index.size().unwrap(), 0);
    }

    #[test]
    fn test_collisions_share_a_bucket() {
        let index = index_with(4);
        // All three hash to 0 ^ t ^ o == 8.
        let keys = [
            ChunkKey::new(0, 8, 0),
            ChunkKey::new(0, 0, 8),
            ChunkKey::new(8, 0, 0),
        ];
        for key in &keys {
            index.get_or_put(key, state()).unwrap();
        }
        for key in &keys {
            assert!(index.get(key).unwrap().is_some());
        }
        assert!(index.remove(&keys[1]).unwrap());
        assert!(index.get(&keys[0]).unwrap().is_some());
        assert!(index.get(&keys[1]).unwrap().is_none());
        assert!(index.get(&keys[2]).unwrap().is_some());
    }

    #[test]
    fn test_remove_head_of_chain_keeps_rest() {
        let index = index_with(4);
        let a = ChunkKey::new(0, 4, 0);
        let b = ChunkKey::new(0, 0, 4);
        index.get_or_put(&a, state()).unwrap();
        index.get_or_put(&b, state()).unwrap();
        // `b` was linked last, so it heads the bucket.
        assert!(index.remove(&b).unwrap());
        assert!(index.get(&a).unwrap().is_some());
        assert!(!index.remove(&b).unwrap());
    }

    #[test]
    fn test_remove_tracks_dropped_count() {
        let index = index_with(16);
        let key = ChunkKey::new(1, 100, 7);
        index.get_or_put(&key, state()).unwrap();
        assert!(index.remove(&key).unwrap());
        assert_eq!(index.size().unwrap(), 0);
        assert_eq!(index.dropped().unwrap(), 1);
        assert!(index.get(&key).unwrap().is_none());

        index.compact().unwrap();
        assert_eq!(index.dropped().unwrap(), 0);
        assert_eq!(index.capacity().unwrap(), 1);
    }

    #[test]
    fn test_growth_from_capacity_one() {
        let index = index_with(1);
        for object in 0..10 {
            index.get_or_put(&ChunkKey::new(0, 1, object), state()).unwrap();
        }
        assert_eq!(index.size().unwrap(), 10);
        assert!(index.capacity().unwrap() >= 10);
        for object in 0..10 {
            assert!(index.get(&ChunkKey::new(0, 1, object)).unwrap().is_some());
        }
    }

    #[test]
    fn test_rehash_doubles_capacity() {
        let index = index_with(16);
        index.get_or_put(&ChunkKey::new(0, 1, 1), state()).unwrap();
        index.rehash().unwrap();
        assert_eq!(index.capacity().unwrap(), 32);
        assert!(index.get(&ChunkKey::new(0, 1, 1)).unwrap().is_some());
    }

    #[test]
    fn test_churn_without_compact_never_overflows() {
        let index = index_with(16);
        for round in 0..20u64 {
            for object in 0..12 {
                index.get_or_put(&ChunkKey::new(round, 1, object), state()).unwrap();
            }
            for object in 0..12 {
                assert!(index.remove(&ChunkKey::new(round, 1, object)).unwrap());
            }
        }
        assert_eq!(index.size().unwrap(), 0);
    }

    #[test]
    fn test_dirty_keys_skip_clean_and_alias_entries() {
        let index = index_with(16);
        let dirty = ChunkKey::new(1, 100, 7);
        let clean = ChunkKey::new(1, 200, 7);
        let alias = ChunkKey::new(1, 150, 7);

        let dirty_chunk = state();
        index.get_or_put(&dirty, Arc::clone(&dirty_chunk)).unwrap();
        let clean_chunk = state();
        let (_, generation) = clean_chunk.snapshot();
        clean_chunk.mark_persisted(generation);
        index.get_or_put(&clean, clean_chunk).unwrap();
        assert!(index.put_alias(&alias, dirty_chunk).unwrap());
        assert!(!index.put_alias(&dirty, state()).unwrap());

        assert_eq!(index.dirty_keys().unwrap(), vec![dirty]);
        assert!(index.get_entry(&alias).unwrap().unwrap().1);
        assert!(!index.get_entry(&dirty).unwrap().unwrap().1);

        assert!(!index.remove_alias(&dirty).unwrap());
        assert!(index.remove_alias(&alias).unwrap());
        assert_eq!(index.size().unwrap(), 2);
    }

    #[test]
    fn test_clear_resets_to_initial_capacity() {
        let index = index_with(4);
        for object in 0..20 {
            index.get_or_put(&ChunkKey::new(0, 1, object), state()).unwrap();
        }
        index.clear().unwrap();
        assert_eq!(index.size().unwrap(), 0);
        assert_eq!(index.capacity().unwrap(), 4);
        assert!(index.get(&ChunkKey::new(0, 1, 3)).unwrap().is_none());

        index.get_or_put(&ChunkKey::new(0, 1, 3), state()).unwrap();
        assert_eq!(index.size().unwrap(), 1);
    }

    #[test]
    fn test_removed_chunk_is_released() {
        let index = index_with(16);
        let key = ChunkKey::new(0, 1, 1);
        let chunk = state();
        index.get_or_put(&key, Arc::clone(&chunk)).unwrap();
        assert_eq!(Arc::strong_count(&chunk), 2);
        index.remove(&key).unwrap();
        assert_eq!(Arc::strong_count(&chunk), 1);
    }

    #[test]
    fn test_remove_if_checks_identity() {
        let index = index_with(16);
        let key = ChunkKey::new(0, 1, 1);
        let held = state();
        index.get_or_put(&key, Arc::clone(&held)).unwrap();

        assert!(!index.remove_if(&key, &state(), |_| true).unwrap());
        assert!(!index.remove_if(&key, &held, |chunk| !chunk.is_dirty()).unwrap());
        assert!(index.remove_if(&key, &held, |_| true).unwrap());
        assert!(index.get(&key).unwrap().is_none());
    }

    #[test]
    fn test_delete_retires_index() {
        let index = index_with(16);
        let chunk = state();
        index.get_or_put(&ChunkKey::new(0, 1, 1), Arc::clone(&chunk)).unwrap();
        index.delete().unwrap();
        assert_eq!(Arc::strong_count(&chunk), 1);
        assert!(matches!(index.size(), Err(StoreError::Deleted)));
        assert!(matches!(index.get(&ChunkKey::new(0, 1, 1)), Err(StoreError::Deleted)));
        assert!(matches!(index.delete(), Err(StoreError::Deleted)));
    }

    #[test]
    fn test_invalid_load_factor_is_rejected() {
        let config = IndexConfig {
            initial_capacity: 16,
            load_factor: 1.5,
            ..IndexConfig::default()
        };
        assert!(matches!(TemporalIndex::new(config), Err(StoreError::Config(_))));

        let config = IndexConfig {
            initial_capacity: 16,
            max_capacity: 8,
            ..IndexConfig::default()
        };
        assert!(matches!(TemporalIndex::new(config), Err(StoreError::Config(_))));
    }

    #[test]
    fn test_capacity_overflow_is_an_allocation_error() {
        let config = IndexConfig::default();
        assert_eq!(bounded(8, &config).unwrap(), 8);
        assert!(matches!(
            bounded(u32::MAX as u64 * 2, &config),
            Err(StoreError::Allocation { .. })
        ));
    }

    #[test]
    fn test_failed_growth_leaves_table_unchanged() {
        let index = TemporalIndex::new(IndexConfig {
            initial_capacity: 4,
            load_factor: 1.0,
            max_capacity: 4,
        })
        .unwrap();
        let chunks: Vec<_> = (0..4).map(|_| state()).collect();
        for (object, chunk) in chunks.iter().enumerate() {
            index.get_or_put(&ChunkKey::new(0, 0, object as u64), Arc::clone(chunk)).unwrap();
        }

        let extra = ChunkKey::new(0, 0, 9);
        assert!(matches!(
            index.get_or_put(&extra, state()),
            Err(StoreError::Allocation { requested: 8 })
        ));
        assert!(matches!(index.rehash(), Err(StoreError::Allocation { .. })));

        assert_eq!(index.size().unwrap(), 4);
        assert_eq!(index.capacity().unwrap(), 4);
        assert!(index.get(&extra).unwrap().is_none());
        for (object, chunk) in chunks.iter().enumerate() {
            let found = index.get(&ChunkKey::new(0, 0, object as u64)).unwrap().unwrap();
            assert!(Arc::ptr_eq(&found, chunk));
        }

        assert!(index.remove(&ChunkKey::new(0, 0, 0)).unwrap());
        index.get_or_put(&extra, state()).unwrap();
        assert_eq!(index.size().unwrap(), 4);
        assert_eq!(index.capacity().unwrap(), 4);
    }
}
