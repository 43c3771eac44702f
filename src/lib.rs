//! Temporal, branchable chunk store.
//!
//! Every versioned chunk lives at a `(universe, time, object)` triple in a
//! [`TemporalIndex`]. The [`Resolver`] answers lookups at arbitrary
//! coordinates with the closest chunk in time and universe ancestry, and a
//! [`ChunkSpace`] flushes dirty chunks to a [`ChunkStorage`] and evicts clean
//! ones nobody holds.

pub mod config;
pub mod error;
pub mod memory;
pub mod storage;

pub use config::SpaceConfig;
pub use error::{Result, StoreError};
pub use memory::{
    Chunk, ChunkKey, ChunkKind, ChunkSpace, LongArray, Resolution, ResolutionTrace, Resolver, TemporalIndex, NULL,
};
pub use storage::{ChunkStorage, FileStorage, MemoryStorage, StorageError};
