//! Closest-chunk resolution over time and universe ancestry.
//!
//! A lookup at `(u, t, o)` is answered by the state chunk of `o` at the
//! greatest recorded time `<= t`, searched first in `u` and then up the
//! universe tree. A universe only answers for `o` from the first time `o`
//! has local state in it (its divergence time, kept in the object's
//! universe map); before that the parent's history shows through.
//!
//! Chunks missing from the index are loaded from the durable storage on the
//! way. Resolutions that land on another triple are memoized as alias
//! entries at the requested triple.

use super::chunk::{Chunk, ChunkKind};
use super::entry::{ChunkKey, NULL};
use super::index::TemporalIndex;
use crate::error::{Result, StoreError};
use crate::storage::ChunkStorage;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of a lookup. `Unresolved` means the object does not exist at the
/// requested coordinate, which is an ordinary answer rather than a failure.
#[derive(Debug)]
pub enum Resolution {
    Resolved(ResolutionTrace),
    Unresolved,
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved(_))
    }

    pub fn trace(&self) -> Option<&ResolutionTrace> {
        match self {
            Resolution::Resolved(trace) => Some(trace),
            Resolution::Unresolved => None,
        }
    }

    pub fn into_trace(self) -> Option<ResolutionTrace> {
        match self {
            Resolution::Resolved(trace) => Some(trace),
            Resolution::Unresolved => None,
        }
    }
}

/// The chunks a resolution went through. Each of them carries one retention
/// taken on behalf of this trace; hand the trace back to
/// `ChunkSpace::release` when done with it.
#[derive(Debug)]
pub struct ResolutionTrace {
    pub requested: ChunkKey,
    pub resolved: ChunkKey,
    pub universe_map: Option<Arc<Chunk>>,
    pub time_tree: Option<Arc<Chunk>>,
    pub chunk: Arc<Chunk>,
}

impl ResolutionTrace {
    fn retain(self) -> Self {
        for chunk in self.chunks() {
            chunk.retain();
        }
        self
    }

    /// State chunk first, then the time tree, then the universe map.
    pub fn chunks(&self) -> impl Iterator<Item = &Arc<Chunk>> {
        std::iter::once(&self.chunk)
            .chain(self.time_tree.iter())
            .chain(self.universe_map.iter())
    }
}

#[derive(Default)]
struct ObjectAliases {
    /// Bumped whenever the object gains history; memoization computed under an
    /// older epoch is discarded.
    epoch: u64,
    /// requested -> resolved
    entries: HashMap<ChunkKey, ChunkKey>,
}

pub struct Resolver {
    index: Arc<TemporalIndex>,
    storage: Arc<dyn ChunkStorage>,
    memoize: bool,
    aliases: Mutex<HashMap<u64, ObjectAliases>>,
    /// Serializes the write path (`fork`, `create`, `insert`, `resolve_for_write`).
    writer: Mutex<()>,
    /// Held shared by every public operation from its first index access until
    /// its chunks are retained; held exclusively by eviction and clearing.
    gate: RwLock<()>,
}

/// The universe every other universe descends from. It exists without a fork.
pub const ROOT_UNIVERSE: u64 = 0;

fn state_key(universe: u64, time: u64, object: u64) -> Result<ChunkKey> {
    if universe == NULL || time == NULL || object == NULL {
        return Err(StoreError::InvalidKey(format!(
            "{} is not a state coordinate",
            ChunkKey::new(universe, time, object)
        )));
    }
    Ok(ChunkKey::state(universe, time, object))
}

impl Resolver {
    pub fn new(index: Arc<TemporalIndex>, storage: Arc<dyn ChunkStorage>, memoize: bool) -> Self {
        Self {
            index,
            storage,
            memoize,
            aliases: Mutex::new(HashMap::new()),
            writer: Mutex::new(()),
            gate: RwLock::new(()),
        }
    }

    /// Excludes every lookup and write until dropped. Taken by eviction so it
    /// never sees a chunk that was fetched but not yet retained.
    pub(crate) fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write()
    }

    /// Chunk at exactly `key`, from the index or else from storage. A chunk
    /// loaded from storage enters the index clean.
    fn load(&self, key: &ChunkKey) -> Result<Option<Arc<Chunk>>> {
        if let Some(chunk) = self.index.get(key)? {
            return Ok(Some(chunk));
        }
        self.load_from_storage(key)
    }

    /// Like `load`, but an alias entry counts as a miss.
    fn load_owned(&self, key: &ChunkKey) -> Result<Option<Arc<Chunk>>> {
        match self.index.get_entry(key)? {
            Some((chunk, false)) => Ok(Some(chunk)),
            Some((_, true)) => Ok(None),
            None => self.load_from_storage(key),
        }
    }

    fn load_from_storage(&self, key: &ChunkKey) -> Result<Option<Arc<Chunk>>> {
        let Some(bytes) = self.storage.get(key)? else {
            debug!(key = %key, "chunk absent from storage");
            return Ok(None);
        };
        let chunk = Arc::new(Chunk::decode(&bytes)?);
        debug!(key = %key, bytes = bytes.len(), "chunk loaded from storage");
        Ok(Some(self.index.get_or_put(key, chunk)?))
    }

    fn load_or_create(&self, key: &ChunkKey, kind: ChunkKind) -> Result<Arc<Chunk>> {
        match self.load(key)? {
            Some(chunk) => Ok(chunk),
            None => self.index.get_or_put(key, Arc::new(Chunk::new(kind))),
        }
    }

    fn alias_epoch(&self, object: u64) -> u64 {
        self.aliases.lock().get(&object).map_or(0, |aliases| aliases.epoch)
    }

    /// Parent of `universe` in the global universe tree.
    pub fn parent(&self, universe: u64) -> Result<Option<u64>> {
        let _shared = self.gate.read();
        self.parent_of(universe)
    }

    fn parent_of(&self, universe: u64) -> Result<Option<u64>> {
        match self.load(&ChunkKey::global_universe_tree())? {
            Some(tree) => tree.get_entry(universe),
            None => Ok(None),
        }
    }

    /// Fails unless `universe` is the root or was handed out by `fork`.
    fn check_universe(&self, universe: u64) -> Result<()> {
        if universe == ROOT_UNIVERSE || self.parent_of(universe)?.is_some() {
            return Ok(());
        }
        Err(StoreError::InvalidKey(format!("universe {} was never forked", universe)))
    }

    /// Registers a new universe branching off `parent` and returns its id.
    /// Ids are allocated above every universe the global tree knows of. Every
    /// universe other than the root comes from here; writes to any other id
    /// are rejected, so a fresh id never carries history.
    pub fn fork(&self, parent: u64) -> Result<u64> {
        if parent == NULL {
            return Err(StoreError::InvalidKey("cannot fork the NULL universe".to_string()));
        }
        let _writer = self.writer.lock();
        let _shared = self.gate.read();
        self.check_universe(parent)?;
        let tree = self.load_or_create(&ChunkKey::global_universe_tree(), ChunkKind::UniverseMap)?;
        let highest = tree
            .entries()?
            .into_iter()
            .flat_map(|(child, ancestor)| [child, ancestor])
            .fold(parent, u64::max);
        let child = highest
            .checked_add(1)
            .filter(|&child| child != NULL)
            .ok_or_else(|| StoreError::InvalidKey("universe ids exhausted".to_string()))?;
        tree.put_entry(child, parent)?;
        debug!(parent, child, "universe forked");
        Ok(child)
    }

    /// Resolves `(universe, time, object)` to the closest chunk and retains
    /// it along with the trees that led to it.
    pub fn lookup(&self, universe: u64, time: u64, object: u64) -> Result<Resolution> {
        let requested = state_key(universe, time, object)?;
        let _shared = self.gate.read();
        match self.resolve(&requested, self.memoize)? {
            Resolution::Resolved(trace) => Ok(Resolution::Resolved(trace.retain())),
            Resolution::Unresolved => Ok(Resolution::Unresolved),
        }
    }

    /// One resolution per object, in input order.
    pub fn lookup_all_objects(&self, universe: u64, time: u64, objects: &[u64]) -> Vec<Result<Resolution>> {
        objects
            .iter()
            .map(|&object| self.lookup(universe, time, object))
            .collect()
    }

    /// One resolution per time, in input order.
    pub fn lookup_all_times(&self, universe: u64, times: &[u64], object: u64) -> Vec<Result<Resolution>> {
        times
            .iter()
            .map(|&time| self.lookup(universe, time, object))
            .collect()
    }

    /// Every (object, time) pair, object-major: entry `i * times.len() + j`
    /// answers `(objects[i], times[j])`.
    pub fn lookup_all_objects_times(
        &self,
        universe: u64,
        times: &[u64],
        objects: &[u64],
    ) -> Vec<Result<Resolution>> {
        objects
            .iter()
            .flat_map(|&object| times.iter().map(move |&time| (object, time)))
            .map(|(object, time)| self.lookup(universe, time, object))
            .collect()
    }

    fn resolve(&self, requested: &ChunkKey, memoize: bool) -> Result<Resolution> {
        let object = requested.object;

        match self.index.get_entry(requested)? {
            Some((chunk, false)) => return self.trace(*requested, *requested, chunk).map(Resolution::Resolved),
            Some((chunk, true)) => {
                let resolved = self
                    .aliases
                    .lock()
                    .get(&object)
                    .and_then(|aliases| aliases.entries.get(requested).copied());
                if let Some(resolved) = resolved {
                    return self.trace(*requested, resolved, chunk).map(Resolution::Resolved);
                }
            }
            None => {}
        }

        let epoch = self.alias_epoch(object);
        let Some(universe_map) = self.load(&ChunkKey::universe_map(object))? else {
            return Ok(Resolution::Unresolved);
        };

        let mut universe = requested.universe;
        let mut visited = HashSet::new();
        loop {
            if !visited.insert(universe) {
                return Err(StoreError::InvalidKey(format!(
                    "universe {} is its own ancestor",
                    universe
                )));
            }
            if let Some(trace) = self.resolve_in(requested, universe, &universe_map)? {
                if memoize && trace.resolved != *requested {
                    self.memoize(&trace, epoch)?;
                }
                return Ok(Resolution::Resolved(trace));
            }
            match self.parent_of(universe)? {
                Some(parent) => universe = parent,
                None => return Ok(Resolution::Unresolved),
            }
        }
    }

    /// Closest chunk of the requested object within `universe` alone. A time
    /// whose chunk cannot be found falls through to the next earlier time.
    fn resolve_in(
        &self,
        requested: &ChunkKey,
        universe: u64,
        universe_map: &Arc<Chunk>,
    ) -> Result<Option<ResolutionTrace>> {
        let object = requested.object;
        match universe_map.get_entry(universe)? {
            Some(divergence) if divergence <= requested.time => {}
            _ => return Ok(None),
        }
        let Some(time_tree) = self.load(&ChunkKey::time_tree(universe, object))? else {
            return Ok(None);
        };
        let mut bound = requested.time;
        while let Some(time) = time_tree.floor_time(bound)? {
            let resolved = ChunkKey::state(universe, time, object);
            if let Some(chunk) = self.load_owned(&resolved)? {
                return Ok(Some(ResolutionTrace {
                    requested: *requested,
                    resolved,
                    universe_map: Some(Arc::clone(universe_map)),
                    time_tree: Some(time_tree),
                    chunk,
                }));
            }
            warn!(key = %resolved, "time tree names a chunk that cannot be found");
            match time.checked_sub(1) {
                Some(earlier) => bound = earlier,
                None => break,
            }
        }
        Ok(None)
    }

    fn trace(&self, requested: ChunkKey, resolved: ChunkKey, chunk: Arc<Chunk>) -> Result<ResolutionTrace> {
        Ok(ResolutionTrace {
            requested,
            resolved,
            universe_map: self.load(&ChunkKey::universe_map(resolved.object))?,
            time_tree: self.load(&ChunkKey::time_tree(resolved.universe, resolved.object))?,
            chunk,
        })
    }

    fn memoize(&self, trace: &ResolutionTrace, epoch: u64) -> Result<()> {
        let mut aliases = self.aliases.lock();
        let object = aliases.entry(trace.requested.object).or_default();
        if object.epoch != epoch {
            return Ok(());
        }
        if self.index.put_alias(&trace.requested, Arc::clone(&trace.chunk))? {
            object.entries.insert(trace.requested, trace.resolved);
        }
        Ok(())
    }

    /// Drops every alias of `object` and bumps its epoch.
    fn invalidate_aliases(&self, object: u64) -> Result<()> {
        let mut aliases = self.aliases.lock();
        let object_aliases = aliases.entry(object).or_default();
        object_aliases.epoch += 1;
        for (requested, _) in object_aliases.entries.drain() {
            self.index.remove_alias(&requested)?;
        }
        Ok(())
    }

    /// Drops the aliases that resolve to `resolved`.
    pub(crate) fn forget_aliases_to(&self, resolved: &ChunkKey) -> Result<usize> {
        let mut aliases = self.aliases.lock();
        let Some(object_aliases) = aliases.get_mut(&resolved.object) else {
            return Ok(0);
        };
        let stale: Vec<ChunkKey> = object_aliases
            .entries
            .iter()
            .filter(|(_, target)| *target == resolved)
            .map(|(requested, _)| *requested)
            .collect();
        for requested in &stale {
            object_aliases.entries.remove(requested);
            self.index.remove_alias(requested)?;
        }
        Ok(stale.len())
    }

    /// Forgets alias bookkeeping after the index was emptied.
    pub(crate) fn reset(&self) {
        let mut aliases = self.aliases.lock();
        for object_aliases in aliases.values_mut() {
            object_aliases.epoch += 1;
            object_aliases.entries.clear();
        }
    }

    /// Creates an empty state chunk at exactly `(universe, time, object)`, or
    /// returns the one already there.
    pub fn create(&self, universe: u64, time: u64, object: u64) -> Result<ResolutionTrace> {
        let key = state_key(universe, time, object)?;
        let _writer = self.writer.lock();
        let _shared = self.gate.read();
        self.check_universe(universe)?;
        let chunk = match self.load_owned(&key)? {
            Some(chunk) => chunk,
            None => {
                let chunk = Arc::new(Chunk::new_state());
                self.index.put_and_replace(&key, Arc::clone(&chunk))?;
                chunk
            }
        };
        self.commit(key, chunk)
    }

    /// Places `chunk` at exactly `(universe, time, object)`, replacing any
    /// chunk there. The chunk is marked dirty.
    pub fn insert(&self, universe: u64, time: u64, object: u64, chunk: Chunk) -> Result<ResolutionTrace> {
        let key = state_key(universe, time, object)?;
        let _writer = self.writer.lock();
        let _shared = self.gate.read();
        self.check_universe(universe)?;
        let chunk = Arc::new(chunk);
        self.index.put_and_replace(&key, Arc::clone(&chunk))?;
        chunk.declare_dirty();
        self.commit(key, chunk)
    }

    /// The chunk to write through at exactly `(universe, time, object)`. When
    /// only an ancestor exists it is deep-copied to the requested triple so the
    /// ancestor stays untouched; when nothing exists an empty chunk is made.
    pub fn resolve_for_write(&self, universe: u64, time: u64, object: u64) -> Result<ResolutionTrace> {
        let key = state_key(universe, time, object)?;
        let _writer = self.writer.lock();
        let _shared = self.gate.read();
        self.check_universe(universe)?;
        if let Some(chunk) = self.load_owned(&key)? {
            return self.commit(key, chunk);
        }
        let chunk = match self.resolve(&key, false)? {
            Resolution::Resolved(ancestor) => {
                debug!(from = %ancestor.resolved, to = %key, "chunk copied for write");
                ancestor.chunk.clone_for_write()
            }
            Resolution::Unresolved => Chunk::new_state(),
        };
        let chunk = Arc::new(chunk);
        self.index.put_and_replace(&key, Arc::clone(&chunk))?;
        self.commit(key, chunk)
    }

    /// Records `key` in the object's time tree and universe map, then drops
    /// the object's aliases since they may predate this history.
    fn commit(&self, key: ChunkKey, chunk: Arc<Chunk>) -> Result<ResolutionTrace> {
        let time_tree = self.load_or_create(&ChunkKey::time_tree(key.universe, key.object), ChunkKind::TimeTree)?;
        time_tree.insert_time(key.time)?;

        let universe_map = self.load_or_create(&ChunkKey::universe_map(key.object), ChunkKind::UniverseMap)?;
        match universe_map.get_entry(key.universe)? {
            Some(divergence) if divergence <= key.time => {}
            _ => universe_map.put_entry(key.universe, key.time)?,
        }

        self.invalidate_aliases(key.object)?;
        Ok(ResolutionTrace {
            requested: key,
            resolved: key,
            universe_map: Some(universe_map),
            time_tree: Some(time_tree),
            chunk,
        }
        .retain())
    }
}
