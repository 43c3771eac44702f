//! Binary layout of the temporal index table.
//!
//! ```text
//! segment: | element_count (4) | dropped_count (4) | element_data_size (4) | records (element_data_size * 40) |
//! record:  | universe (8) | time (8) | object (8) | next (4) | head (4) | handle (8) |
//! ```
//!
//! `next` chains records that share a bucket, `head` is the first record of
//! the bucket numbered like the record itself. Both are record indices into
//! this same buffer (`-1` ends a chain), never addresses, so a segment can be
//! copied wholesale into a bigger one. `handle` is the chunk handle, `0` for a
//! free or dropped record. All integers are little endian.

use super::entry::ChunkKey;
use crate::error::{Result, StoreError};

pub(super) const NO_SLOT: i32 = -1;

const ATT_ELEMENT_COUNT_LEN: usize = 4;
const ATT_DROPPED_COUNT_LEN: usize = 4;
const ATT_ELEMENT_DATA_SIZE_LEN: usize = 4;

const OFFSET_ELEMENT_COUNT: usize = 0;
const OFFSET_DROPPED_COUNT: usize = OFFSET_ELEMENT_COUNT + ATT_ELEMENT_COUNT_LEN;
const OFFSET_ELEMENT_DATA_SIZE: usize = OFFSET_DROPPED_COUNT + ATT_DROPPED_COUNT_LEN;
pub(super) const HEADER_LEN: usize = OFFSET_ELEMENT_DATA_SIZE + ATT_ELEMENT_DATA_SIZE_LEN;

const OFFSET_UNIVERSE: usize = 0;
const OFFSET_TIME: usize = OFFSET_UNIVERSE + 8;
const OFFSET_OBJECT: usize = OFFSET_TIME + 8;
const OFFSET_NEXT: usize = OFFSET_OBJECT + 8;
const OFFSET_HEAD: usize = OFFSET_NEXT + 4;
const OFFSET_HANDLE: usize = OFFSET_HEAD + 4;
pub(super) const RECORD_LEN: usize = OFFSET_HANDLE + 8;

pub(super) struct Segment {
    bytes: Vec<u8>,
}

impl Segment {
    /// Reserves a zeroed segment for `capacity` records with every chain
    /// empty. Fails without side effects when the memory is unavailable.
    pub(super) fn allocate(capacity: u32) -> Result<Segment> {
        let requested = capacity as usize;
        let len = requested
            .checked_mul(RECORD_LEN)
            .and_then(|records| records.checked_add(HEADER_LEN))
            .ok_or(StoreError::Allocation { requested })?;

        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| StoreError::Allocation { requested })?;
        bytes.resize(len, 0);

        let mut segment = Segment { bytes };
        segment.write_u32(OFFSET_ELEMENT_DATA_SIZE, capacity);
        for slot in 0..capacity {
            segment.set_next(slot, NO_SLOT);
            segment.set_head(slot, NO_SLOT);
        }
        Ok(segment)
    }

    #[inline]
    fn read_u32(&self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.bytes[offset..offset + 4]);
        u32::from_le_bytes(buf)
    }

    #[inline]
    fn write_u32(&mut self, offset: usize, value: u32) {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    fn read_u64(&self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.bytes[offset..offset + 8]);
        u64::from_le_bytes(buf)
    }

    #[inline]
    fn write_u64(&mut self, offset: usize, value: u64) {
        self.bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    fn record(slot: u32, field: usize) -> usize {
        HEADER_LEN + slot as usize * RECORD_LEN + field
    }

    pub(super) fn element_count(&self) -> u32 {
        self.read_u32(OFFSET_ELEMENT_COUNT)
    }

    pub(super) fn set_element_count(&mut self, count: u32) {
        self.write_u32(OFFSET_ELEMENT_COUNT, count);
    }

    pub(super) fn dropped_count(&self) -> u32 {
        self.read_u32(OFFSET_DROPPED_COUNT)
    }

    pub(super) fn set_dropped_count(&mut self, count: u32) {
        self.write_u32(OFFSET_DROPPED_COUNT, count);
    }

    pub(super) fn element_data_size(&self) -> u32 {
        self.read_u32(OFFSET_ELEMENT_DATA_SIZE)
    }

    pub(super) fn key(&self, slot: u32) -> ChunkKey {
        ChunkKey::new(
            self.read_u64(Self::record(slot, OFFSET_UNIVERSE)),
            self.read_u64(Self::record(slot, OFFSET_TIME)),
            self.read_u64(Self::record(slot, OFFSET_OBJECT)),
        )
    }

    pub(super) fn set_key(&mut self, slot: u32, key: &ChunkKey) {
        self.write_u64(Self::record(slot, OFFSET_UNIVERSE), key.universe);
        self.write_u64(Self::record(slot, OFFSET_TIME), key.time);
        self.write_u64(Self::record(slot, OFFSET_OBJECT), key.object);
    }

    pub(super) fn next(&self, slot: u32) -> i32 {
        self.read_u32(Self::record(slot, OFFSET_NEXT)) as i32
    }

    pub(super) fn set_next(&mut self, slot: u32, next: i32) {
        self.write_u32(Self::record(slot, OFFSET_NEXT), next as u32);
    }

    pub(super) fn head(&self, bucket: u32) -> i32 {
        self.read_u32(Self::record(bucket, OFFSET_HEAD)) as i32
    }

    pub(super) fn set_head(&mut self, bucket: u32, slot: i32) {
        self.write_u32(Self::record(bucket, OFFSET_HEAD), slot as u32);
    }

    pub(super) fn handle(&self, slot: u32) -> u64 {
        self.read_u64(Self::record(slot, OFFSET_HANDLE))
    }

    pub(super) fn set_handle(&mut self, slot: u32, handle: u64) {
        self.write_u64(Self::record(slot, OFFSET_HANDLE), handle);
    }

    /// Copies the header and the first `slots` records of `other` verbatim.
    pub(super) fn copy_from(&mut self, other: &Segment, slots: u32) {
        let capacity = self.element_data_size();
        let len = HEADER_LEN + slots as usize * RECORD_LEN;
        self.bytes[..len].copy_from_slice(&other.bytes[..len]);
        self.write_u32(OFFSET_ELEMENT_DATA_SIZE, capacity);
    }
}
