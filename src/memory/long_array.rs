use super::codec::{self, VAL_SEP};
use crate::error::{Result, StoreError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Dirty flag shared between a chunk and every array it owns.
///
/// Dirtiness is tracked as a pair of generations: every mutation bumps
/// `mutations`, a durable flush records the generation it wrote in
/// `persisted`. The owner is dirty while the two differ, so a mutation that
/// lands between a snapshot and its acknowledgement keeps the owner dirty.
#[derive(Debug, Clone)]
pub struct DirtyMark {
    state: Arc<MarkState>,
}

#[derive(Debug)]
struct MarkState {
    mutations: AtomicU64,
    persisted: AtomicU64,
}

impl DirtyMark {
    /// A mark for a freshly created owner, dirty until its first flush.
    pub fn new_dirty() -> Self {
        Self::with_generations(1, 0)
    }

    /// A mark for an owner just loaded from durable storage.
    pub fn new_clean() -> Self {
        Self::with_generations(0, 0)
    }

    fn with_generations(mutations: u64, persisted: u64) -> Self {
        Self {
            state: Arc::new(MarkState {
                mutations: AtomicU64::new(mutations),
                persisted: AtomicU64::new(persisted),
            }),
        }
    }

    pub fn declare_dirty(&self) {
        self.state.mutations.fetch_add(1, Ordering::AcqRel);
    }

    pub fn is_dirty(&self) -> bool {
        self.state.persisted.load(Ordering::Acquire) < self.state.mutations.load(Ordering::Acquire)
    }

    /// Current mutation generation, to be handed back to `mark_persisted`
    /// once the state captured at this generation is durable.
    pub fn generation(&self) -> u64 {
        self.state.mutations.load(Ordering::Acquire)
    }

    pub fn mark_persisted(&self, generation: u64) {
        self.state.persisted.fetch_max(generation, Ordering::AcqRel);
    }
}

/// Resizable array of 64-bit integers owned by one chunk.
///
/// Length is explicit: `init` or `init_with` must run before any `set`.
#[derive(Debug)]
pub struct LongArray {
    backend: Option<Vec<i64>>,
    owner: DirtyMark,
}

impl LongArray {
    pub fn new(owner: DirtyMark) -> Self {
        Self {
            backend: None,
            owner,
        }
    }

    /// Reads one element.
    ///
    /// An array that was never allocated answers `-1` for every index. This is
    /// a degraded read for callers probing optional attributes, not a value.
    pub fn get(&self, index: usize) -> Result<i64> {
        match &self.backend {
            Some(values) => values.get(index).copied().ok_or(StoreError::OutOfBounds {
                index,
                len: values.len(),
            }),
            None => Ok(-1),
        }
    }

    pub fn set(&mut self, index: usize, value: i64) -> Result<()> {
        let values = self.backend.as_mut().ok_or(StoreError::Unallocated)?;
        let len = values.len();
        let slot = values
            .get_mut(index)
            .ok_or(StoreError::OutOfBounds { index, len })?;
        *slot = value;
        self.owner.declare_dirty();
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.backend.as_ref().map_or(0, Vec::len)
    }

    pub fn is_allocated(&self) -> bool {
        self.backend.is_some()
    }

    pub(crate) fn owner(&self) -> &DirtyMark {
        &self.owner
    }

    /// Reallocates to `size` zeroed slots, dropping previous contents.
    pub fn init(&mut self, size: usize) {
        self.backend = Some(vec![0; size]);
        self.owner.declare_dirty();
    }

    /// Allocates exactly `values.len()` slots holding a copy of `values`.
    /// Does not touch the owner's dirty mark.
    pub fn init_with(&mut self, values: &[i64]) {
        self.backend = Some(values.to_vec());
    }

    pub fn extract(&self) -> Vec<i64> {
        self.backend.clone().unwrap_or_default()
    }

    /// Parses the textual grammar starting at `offset`, stopping at a
    /// structural separator or at `max`. The first token is the declared
    /// length; following tokens fill the array in order and missing ones stay
    /// zero. Returns the cursor position after the last consumed byte.
    pub fn load(&mut self, buffer: &[u8], offset: usize, max: usize) -> Result<usize> {
        if offset > buffer.len() {
            return Err(StoreError::Codec(format!(
                "offset {} past the end of a {}-byte buffer",
                offset,
                buffer.len()
            )));
        }
        let max = max.min(buffer.len());
        let mut cursor = offset;
        let mut previous = offset;
        let mut values: Option<Vec<i64>> = None;
        let mut elem_index = 0;

        while cursor < max && !codec::is_terminator(buffer[cursor]) {
            if buffer[cursor] == VAL_SEP {
                Self::consume(&mut values, &mut elem_index, &buffer[previous..cursor])?;
                previous = cursor + 1;
            }
            cursor += 1;
        }
        let tail = &buffer[previous.min(cursor)..cursor];
        if values.is_none() || !tail.is_empty() {
            Self::consume(&mut values, &mut elem_index, tail)?;
        }

        self.backend = values;
        Ok(cursor)
    }

    fn consume(values: &mut Option<Vec<i64>>, elem_index: &mut usize, token: &[u8]) -> Result<()> {
        match values {
            None => {
                let declared = codec::decode_u64(token)?;
                let declared = usize::try_from(declared)
                    .map_err(|_| StoreError::Codec(format!("declared length {} too large", declared)))?;
                let mut fresh = Vec::new();
                fresh
                    .try_reserve_exact(declared)
                    .map_err(|_| StoreError::Allocation { requested: declared })?;
                fresh.resize(declared, 0);
                *values = Some(fresh);
            }
            Some(values) => {
                let len = values.len();
                let slot = values.get_mut(*elem_index).ok_or_else(|| {
                    StoreError::Codec(format!("more values than the declared length {}", len))
                })?;
                *slot = codec::decode_i64(token)?;
                *elem_index += 1;
            }
        }
        Ok(())
    }

    /// Appends the textual form consumed by `load`.
    pub fn save(&self, out: &mut String) {
        codec::encode_u64(self.size() as u64, out);
        if let Some(values) = &self.backend {
            for &value in values {
                out.push(VAL_SEP as char);
                codec::encode_i64(value, out);
            }
        }
    }

    /// Deep copy bound to `owner`, leaving both dirty marks untouched.
    pub fn clone_for(&self, owner: &DirtyMark) -> LongArray {
        let mut cloned = LongArray::new(owner.clone());
        if let Some(values) = &self.backend {
            cloned.init_with(values);
        }
        cloned
    }
}
