//! Persisted form of a chunk.
//!
//! Scalars go through serde as-is; array and relationship attributes are
//! carried in the textual token grammar and rebuilt with `LongArray::load`,
//! so the same grammar serves both the durable path and external producers.

use super::chunk::{Attribute, Chunk, ChunkBody, ChunkKind, Relation};
use super::long_array::{DirtyMark, LongArray};
use crate::error::{Result, StoreError};
use crate::storage::StorageError;
use bincode::{deserialize, serialize};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredAttribute {
    Long(i64),
    Double(f64),
    Bool(bool),
    Text(String),
    LongArray(String),
    Relation(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SnapshotBody {
    State(Vec<(u32, StoredAttribute)>),
    TimeTree(Vec<u64>),
    UniverseMap(Vec<(u64, u64)>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSnapshot {
    pub kind: ChunkKind,
    pub body: SnapshotBody,
}

impl ChunkSnapshot {
    pub fn encode(&self) -> std::result::Result<Vec<u8>, StorageError> {
        Ok(serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, StorageError> {
        Ok(deserialize(bytes)?)
    }
}

fn encode_array(array: &LongArray) -> String {
    let mut text = String::new();
    array.save(&mut text);
    text
}

fn decode_array(text: &str, owner: &DirtyMark) -> Result<LongArray> {
    let mut array = LongArray::new(owner.clone());
    let bytes = text.as_bytes();
    let cursor = array.load(bytes, 0, bytes.len())?;
    if cursor != bytes.len() {
        return Err(StoreError::Codec(format!(
            "trailing bytes after array at offset {}",
            cursor
        )));
    }
    Ok(array)
}

impl Chunk {
    /// Captures the chunk together with the dirty generation it reflects.
    /// Hand the generation to `mark_persisted` once the snapshot is durable.
    pub fn snapshot(&self) -> (ChunkSnapshot, u64) {
        let guard = self.body.lock();
        let generation = self.mark.generation();
        let body = match &*guard {
            ChunkBody::State(attributes) => SnapshotBody::State(
                attributes
                    .iter()
                    .map(|(&id, attribute)| {
                        let stored = match attribute {
                            Attribute::Long(v) => StoredAttribute::Long(*v),
                            Attribute::Double(v) => StoredAttribute::Double(*v),
                            Attribute::Bool(v) => StoredAttribute::Bool(*v),
                            Attribute::Text(v) => StoredAttribute::Text(v.clone()),
                            Attribute::LongArray(array) => StoredAttribute::LongArray(encode_array(array)),
                            Attribute::Relation(relation) => {
                                StoredAttribute::Relation(encode_array(relation.array()))
                            }
                        };
                        (id, stored)
                    })
                    .collect(),
            ),
            ChunkBody::TimeTree(times) => SnapshotBody::TimeTree(times.iter().copied().collect()),
            ChunkBody::UniverseMap(entries) => {
                SnapshotBody::UniverseMap(entries.iter().map(|(&k, &v)| (k, v)).collect())
            }
        };
        (
            ChunkSnapshot {
                kind: self.kind(),
                body,
            },
            generation,
        )
    }

    /// Rebuilds a clean chunk from its persisted form.
    pub fn from_snapshot(snapshot: ChunkSnapshot) -> Result<Chunk> {
        let mark = DirtyMark::new_clean();
        let body = match (snapshot.kind, snapshot.body) {
            (ChunkKind::State, SnapshotBody::State(stored)) => {
                let mut attributes = BTreeMap::new();
                for (id, attribute) in stored {
                    let attribute = match attribute {
                        StoredAttribute::Long(v) => Attribute::Long(v),
                        StoredAttribute::Double(v) => Attribute::Double(v),
                        StoredAttribute::Bool(v) => Attribute::Bool(v),
                        StoredAttribute::Text(v) => Attribute::Text(v),
                        StoredAttribute::LongArray(text) => Attribute::LongArray(decode_array(&text, &mark)?),
                        StoredAttribute::Relation(text) => {
                            Attribute::Relation(Relation::from_array(decode_array(&text, &mark)?))
                        }
                    };
                    attributes.insert(id, attribute);
                }
                ChunkBody::State(attributes)
            }
            (ChunkKind::TimeTree, SnapshotBody::TimeTree(times)) => {
                ChunkBody::TimeTree(times.into_iter().collect::<BTreeSet<_>>())
            }
            (ChunkKind::UniverseMap, SnapshotBody::UniverseMap(entries)) => {
                ChunkBody::UniverseMap(entries.into_iter().collect())
            }
            (kind, _) => {
                return Err(StoreError::Codec(format!(
                    "{:?} snapshot carries a body of another kind",
                    kind
                )))
            }
        };
        Ok(Chunk::from_parts(snapshot.kind, mark, body))
    }

    pub fn encode(&self) -> Result<(Vec<u8>, u64)> {
        let (snapshot, generation) = self.snapshot();
        Ok((snapshot.encode()?, generation))
    }

    pub fn decode(bytes: &[u8]) -> Result<Chunk> {
        Chunk::from_snapshot(ChunkSnapshot::decode(bytes)?)
    }
}
