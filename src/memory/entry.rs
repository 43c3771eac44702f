use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved key component. A key whose time is `NULL` addresses a time tree,
/// a key whose universe and time are both `NULL` addresses a universe map.
pub const NULL: u64 = u64::MAX;

/// Identity of one versioned chunk: `(universe, time, object)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub universe: u64,
    pub time: u64,
    pub object: u64,
}

impl ChunkKey {
    pub const fn new(universe: u64, time: u64, object: u64) -> Self {
        Self {
            universe,
            time,
            object,
        }
    }

    /// Key of the state chunk of `object` at `(universe, time)`.
    pub const fn state(universe: u64, time: u64, object: u64) -> Self {
        Self::new(universe, time, object)
    }

    /// Key of the time tree of `object` in `universe`.
    pub const fn time_tree(universe: u64, object: u64) -> Self {
        Self::new(universe, NULL, object)
    }

    /// Key of the per-object universe map.
    pub const fn universe_map(object: u64) -> Self {
        Self::new(NULL, NULL, object)
    }

    /// Key of the global universe tree (child universe -> parent).
    pub const fn global_universe_tree() -> Self {
        Self::new(NULL, NULL, NULL)
    }

    /// Xor of the three components truncated to 31 bits. Callers reduce it
    /// modulo the table capacity.
    #[inline]
    pub fn hash(&self) -> u32 {
        ((self.universe ^ self.time ^ self.object) as u32) & 0x7FFF_FFFF
    }

    #[inline]
    pub fn bucket(&self, capacity: u32) -> u32 {
        self.hash() % capacity
    }

    pub fn is_state(&self) -> bool {
        self.universe != NULL && self.time != NULL
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn part(v: u64) -> String {
            if v == NULL {
                "_".to_string()
            } else {
                v.to_string()
            }
        }
        write!(
            f,
            "({},{},{})",
            part(self.universe),
            part(self.time),
            part(self.object)
        )
    }
}
