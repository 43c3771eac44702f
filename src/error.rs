use crate::memory::chunk::ChunkKind;
use crate::storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Read or write past the allocated length of a backing array.
    #[error("index {index} out of bounds for array of length {len}")]
    OutOfBounds { index: usize, len: usize },

    /// Write to a backing array that was never allocated with `init`.
    #[error("array is not allocated, call init first")]
    Unallocated,

    /// A chunk of one kind was handed to an operation (or key) expecting another.
    #[error("expected a {expected:?} chunk, found {found:?}")]
    KindMismatch { expected: ChunkKind, found: ChunkKind },

    /// The store was deleted and can no longer be used.
    #[error("store has been deleted")]
    Deleted,

    /// The key cannot address a chunk (e.g. a sentinel universe with a concrete time).
    #[error("invalid chunk key: {0}")]
    InvalidKey(String),

    /// Backing memory for the table could not be reserved.
    #[error("failed to allocate {requested} table slots")]
    Allocation { requested: usize },

    /// Malformed textual array encoding.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid configuration: {0}")]
    Config(String),
}
