//! In-memory engine: chunks, the temporal index over them, and resolution
//! across time and universes.

pub mod chunk;
pub mod codec;
pub mod entry;
pub mod index;
pub mod lifecycle;
pub mod long_array;
pub mod resolver;
pub mod snapshot;
mod segment;

pub use chunk::{Attribute, Chunk, ChunkKind, Relation};
pub use entry::{ChunkKey, NULL};
pub use index::{IndexConfig, TemporalIndex};
pub use lifecycle::ChunkSpace;
pub use long_array::{DirtyMark, LongArray};
pub use resolver::{Resolution, ResolutionTrace, Resolver, ROOT_UNIVERSE};
pub use snapshot::ChunkSnapshot;
