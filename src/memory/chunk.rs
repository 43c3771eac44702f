//! Versioned payload stored behind one triple.
//!
//! A chunk is one of three kinds, picked by the shape of the key it lives at:
//! state chunks carry node attributes, time trees list the times an object has
//! state at in one universe, and universe maps relate universes to either a
//! parent universe (global tree) or an object's first local time.

use super::entry::{ChunkKey, NULL};
use super::long_array::{DirtyMark, LongArray};
use crate::error::{Result, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkKind {
    State,
    TimeTree,
    UniverseMap,
}

impl ChunkKind {
    /// The kind a chunk must have to be stored at `key`.
    pub fn for_key(key: &ChunkKey) -> Result<ChunkKind> {
        match (key.universe == NULL, key.time == NULL) {
            (false, false) => Ok(ChunkKind::State),
            (false, true) => Ok(ChunkKind::TimeTree),
            (true, true) => Ok(ChunkKind::UniverseMap),
            (true, false) => Err(StoreError::InvalidKey(format!(
                "{} has a concrete time but no universe",
                key
            ))),
        }
    }
}

/// Relationship attribute: an ordered list of target object ids.
#[derive(Debug)]
pub struct Relation {
    ids: LongArray,
}

impl Relation {
    pub(crate) fn new(owner: DirtyMark) -> Self {
        Self {
            ids: LongArray::new(owner),
        }
    }

    pub(crate) fn from_array(ids: LongArray) -> Self {
        Self { ids }
    }

    pub(crate) fn array(&self) -> &LongArray {
        &self.ids
    }

    pub fn size(&self) -> usize {
        self.ids.size()
    }

    pub fn get(&self, index: usize) -> Result<i64> {
        self.ids.get(index)
    }

    pub fn add(&mut self, id: i64) {
        let mut ids = self.ids.extract();
        ids.push(id);
        self.ids.init_with(&ids);
        self.ids.owner().declare_dirty();
    }

    /// Removes the first occurrence of `id`. Returns whether anything changed.
    pub fn remove(&mut self, id: i64) -> bool {
        let mut ids = self.ids.extract();
        match ids.iter().position(|&v| v == id) {
            Some(pos) => {
                ids.remove(pos);
                self.ids.init_with(&ids);
                self.ids.owner().declare_dirty();
                true
            }
            None => false,
        }
    }

    pub fn ids(&self) -> Vec<i64> {
        self.ids.extract()
    }
}

#[derive(Debug)]
pub enum Attribute {
    Long(i64),
    Double(f64),
    Bool(bool),
    Text(String),
    LongArray(LongArray),
    Relation(Relation),
}

#[derive(Debug)]
pub(super) enum ChunkBody {
    State(BTreeMap<u32, Attribute>),
    TimeTree(BTreeSet<u64>),
    UniverseMap(BTreeMap<u64, u64>),
}

#[derive(Debug)]
pub struct Chunk {
    kind: ChunkKind,
    pub(super) mark: DirtyMark,
    retained: AtomicI64,
    pub(super) body: Mutex<ChunkBody>,
}

impl Chunk {
    /// A fresh chunk, dirty until its first flush.
    pub fn new(kind: ChunkKind) -> Self {
        let body = match kind {
            ChunkKind::State => ChunkBody::State(BTreeMap::new()),
            ChunkKind::TimeTree => ChunkBody::TimeTree(BTreeSet::new()),
            ChunkKind::UniverseMap => ChunkBody::UniverseMap(BTreeMap::new()),
        };
        Self::from_parts(kind, DirtyMark::new_dirty(), body)
    }

    pub fn new_state() -> Self {
        Self::new(ChunkKind::State)
    }

    pub(super) fn from_parts(kind: ChunkKind, mark: DirtyMark, body: ChunkBody) -> Self {
        Self {
            kind,
            mark,
            retained: AtomicI64::new(0),
            body: Mutex::new(body),
        }
    }

    pub fn kind(&self) -> ChunkKind {
        self.kind
    }

    pub fn is_dirty(&self) -> bool {
        self.mark.is_dirty()
    }

    pub fn declare_dirty(&self) {
        self.mark.declare_dirty();
    }

    /// Clears dirtiness up to `generation`, as returned with a snapshot.
    pub fn mark_persisted(&self, generation: u64) {
        self.mark.mark_persisted(generation);
    }

    pub fn retain(&self) -> i64 {
        self.retained.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops one retention and returns the remaining count.
    pub fn release(&self) -> i64 {
        self.retained.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn retained(&self) -> i64 {
        self.retained.load(Ordering::Acquire)
    }

    fn mismatch(&self, expected: ChunkKind) -> StoreError {
        StoreError::KindMismatch {
            expected,
            found: self.kind,
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut BTreeMap<u32, Attribute>, &DirtyMark) -> R) -> Result<R> {
        match &mut *self.body.lock() {
            ChunkBody::State(attributes) => Ok(f(attributes, &self.mark)),
            _ => Err(self.mismatch(ChunkKind::State)),
        }
    }

    fn set_attribute(&self, id: u32, value: Attribute) -> Result<()> {
        self.with_state(|attributes, mark| {
            attributes.insert(id, value);
            mark.declare_dirty();
        })
    }

    pub fn set_long(&self, id: u32, value: i64) -> Result<()> {
        self.set_attribute(id, Attribute::Long(value))
    }

    pub fn get_long(&self, id: u32) -> Result<Option<i64>> {
        self.with_state(|attributes, _| match attributes.get(&id) {
            Some(Attribute::Long(v)) => Some(*v),
            _ => None,
        })
    }

    pub fn set_double(&self, id: u32, value: f64) -> Result<()> {
        self.set_attribute(id, Attribute::Double(value))
    }

    pub fn get_double(&self, id: u32) -> Result<Option<f64>> {
        self.with_state(|attributes, _| match attributes.get(&id) {
            Some(Attribute::Double(v)) => Some(*v),
            _ => None,
        })
    }

    pub fn set_bool(&self, id: u32, value: bool) -> Result<()> {
        self.set_attribute(id, Attribute::Bool(value))
    }

    pub fn get_bool(&self, id: u32) -> Result<Option<bool>> {
        self.with_state(|attributes, _| match attributes.get(&id) {
            Some(Attribute::Bool(v)) => Some(*v),
            _ => None,
        })
    }

    pub fn set_text(&self, id: u32, value: impl Into<String>) -> Result<()> {
        self.set_attribute(id, Attribute::Text(value.into()))
    }

    pub fn get_text(&self, id: u32) -> Result<Option<String>> {
        self.with_state(|attributes, _| match attributes.get(&id) {
            Some(Attribute::Text(v)) => Some(v.clone()),
            _ => None,
        })
    }

    pub fn remove_attribute(&self, id: u32) -> Result<bool> {
        self.with_state(|attributes, mark| {
            let removed = attributes.remove(&id).is_some();
            if removed {
                mark.declare_dirty();
            }
            removed
        })
    }

    pub fn attribute_ids(&self) -> Result<Vec<u32>> {
        self.with_state(|attributes, _| attributes.keys().copied().collect())
    }

    /// Runs `f` on the array attribute `id`, creating an unallocated array
    /// (or replacing an attribute of another type) first.
    pub fn long_array<R>(&self, id: u32, f: impl FnOnce(&mut LongArray) -> R) -> Result<R> {
        self.with_state(|attributes, mark| {
            let slot = attributes
                .entry(id)
                .or_insert_with(|| Attribute::LongArray(LongArray::new(mark.clone())));
            if !matches!(slot, Attribute::LongArray(_)) {
                *slot = Attribute::LongArray(LongArray::new(mark.clone()));
            }
            match slot {
                Attribute::LongArray(array) => f(array),
                _ => unreachable!("slot was just set to an array"),
            }
        })
    }

    /// Runs `f` on the relationship attribute `id`, creating it if needed.
    pub fn relation<R>(&self, id: u32, f: impl FnOnce(&mut Relation) -> R) -> Result<R> {
        self.with_state(|attributes, mark| {
            let slot = attributes
                .entry(id)
                .or_insert_with(|| Attribute::Relation(Relation::new(mark.clone())));
            if !matches!(slot, Attribute::Relation(_)) {
                *slot = Attribute::Relation(Relation::new(mark.clone()));
            }
            match slot {
                Attribute::Relation(relation) => f(relation),
                _ => unreachable!("slot was just set to a relation"),
            }
        })
    }

    /// Adds `time` to a time tree. Returns whether it was new.
    pub fn insert_time(&self, time: u64) -> Result<bool> {
        match &mut *self.body.lock() {
            ChunkBody::TimeTree(times) => {
                let inserted = times.insert(time);
                if inserted {
                    self.mark.declare_dirty();
                }
                Ok(inserted)
            }
            _ => Err(self.mismatch(ChunkKind::TimeTree)),
        }
    }

    /// Greatest recorded time `<= time`.
    pub fn floor_time(&self, time: u64) -> Result<Option<u64>> {
        match &*self.body.lock() {
            ChunkBody::TimeTree(times) => Ok(times.range(..=time).next_back().copied()),
            _ => Err(self.mismatch(ChunkKind::TimeTree)),
        }
    }

    pub fn times(&self) -> Result<Vec<u64>> {
        match &*self.body.lock() {
            ChunkBody::TimeTree(times) => Ok(times.iter().copied().collect()),
            _ => Err(self.mismatch(ChunkKind::TimeTree)),
        }
    }

    pub fn put_entry(&self, key: u64, value: u64) -> Result<()> {
        match &mut *self.body.lock() {
            ChunkBody::UniverseMap(entries) => {
                if entries.insert(key, value) != Some(value) {
                    self.mark.declare_dirty();
                }
                Ok(())
            }
            _ => Err(self.mismatch(ChunkKind::UniverseMap)),
        }
    }

    pub fn get_entry(&self, key: u64) -> Result<Option<u64>> {
        match &*self.body.lock() {
            ChunkBody::UniverseMap(entries) => Ok(entries.get(&key).copied()),
            _ => Err(self.mismatch(ChunkKind::UniverseMap)),
        }
    }

    pub fn entries(&self) -> Result<Vec<(u64, u64)>> {
        match &*self.body.lock() {
            ChunkBody::UniverseMap(entries) => Ok(entries.iter().map(|(&k, &v)| (k, v)).collect()),
            _ => Err(self.mismatch(ChunkKind::UniverseMap)),
        }
    }

    /// Deep copy with its own dirty mark, dirty from the start. Used when
    /// history is forked to a new triple.
    pub fn clone_for_write(&self) -> Chunk {
        let mark = DirtyMark::new_dirty();
        let body = match &*self.body.lock() {
            ChunkBody::State(attributes) => ChunkBody::State(
                attributes
                    .iter()
                    .map(|(&id, attribute)| {
                        let copy = match attribute {
                            Attribute::Long(v) => Attribute::Long(*v),
                            Attribute::Double(v) => Attribute::Double(*v),
                            Attribute::Bool(v) => Attribute::Bool(*v),
                            Attribute::Text(v) => Attribute::Text(v.clone()),
                            Attribute::LongArray(array) => Attribute::LongArray(array.clone_for(&mark)),
                            Attribute::Relation(relation) => {
                                Attribute::Relation(Relation::from_array(relation.array().clone_for(&mark)))
                            }
                        };
                        (id, copy)
                    })
                    .collect(),
            ),
            ChunkBody::TimeTree(times) => ChunkBody::TimeTree(times.clone()),
            ChunkBody::UniverseMap(entries) => ChunkBody::UniverseMap(entries.clone()),
        };
        Self::from_parts(self.kind, mark, body)
    }
}
