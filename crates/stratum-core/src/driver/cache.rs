//! The per-context working set of states.
//!
//! [`StateCache`] is the only component that changes a state's mode. It
//! tracks two priority-ordered sets: dirty states that must be flushed and
//! invalid states that must be rebuilt. Priority is the node's forward
//! toposort index, so both sets drain upstream-first.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use fxhash::FxHashMap;
use tracing::{debug, warn};

use crate::codec::SerdeManager;
use crate::plan::{NodeId, Plan};
use crate::state::{Attributes, Mode, State, StateKey};
use crate::storage::{Span, StateStorage, StorageGetFlags};
use crate::types::Id;

use super::error::{node_name, DriverError};

/// Options for [`StateCache::get`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetFlags {
    /// Allocate a `Phantom` state if none exists.
    pub create: bool,
    /// Never fall through to storage on a cache miss.
    pub noload: bool,
    /// Load clean states as `Shared` rather than `Exclusive`.
    pub share: bool,
}

impl GetFlags {
    /// Look up, loading from storage on a miss.
    pub const NONE: Self = Self {
        create: false,
        noload: false,
        share: false,
    };

    /// Look up, creating if absent.
    pub const CREATE: Self = Self {
        create: true,
        noload: false,
        share: false,
    };

    /// Sets `create`.
    #[must_use]
    pub fn with_create(mut self) -> Self {
        self.create = true;
        self
    }

    /// Sets `noload`.
    #[must_use]
    pub fn with_noload(mut self) -> Self {
        self.noload = true;
        self
    }

    /// Sets `share`.
    #[must_use]
    pub fn with_share(mut self) -> Self {
        self.share = true;
        self
    }
}

/// Counters of one cache's activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCacheStats {
    /// Lookups served from memory.
    pub hits: usize,
    /// Lookups not in memory.
    pub misses: usize,
    /// States loaded from storage.
    pub loads: usize,
    /// States written by flushes.
    pub flushed: usize,
}

/// Result of one [`StateCache::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// States written.
    pub states: usize,
    /// Storage puts issued.
    pub batches: usize,
}

/// In-memory states of one driver context.
pub struct StateCache {
    plan: Arc<Plan>,
    storage: Arc<dyn StateStorage>,
    serde: Arc<SerdeManager>,
    priorities: FxHashMap<NodeId, usize>,
    nodes_by_priority: BTreeMap<usize, NodeId>,
    states: FxHashMap<NodeId, BTreeMap<Id, State>>,
    dirty: BTreeMap<usize, BTreeSet<Id>>,
    invalid: BTreeMap<usize, BTreeSet<Id>>,
    batch_size: usize,
    stats: StateCacheStats,
}

impl StateCache {
    /// Creates an empty cache over the stateful nodes of `plan`.
    #[must_use]
    pub fn new(
        plan: Arc<Plan>,
        storage: Arc<dyn StateStorage>,
        serde: Arc<SerdeManager>,
        batch_size: usize,
    ) -> Self {
        let mut priorities = FxHashMap::default();
        let mut nodes_by_priority = BTreeMap::new();
        for node in plan.stateful_nodes() {
            if let Some(priority) = plan.topo_index(node.id()) {
                priorities.insert(node.id(), priority);
                nodes_by_priority.insert(priority, node.id());
            }
        }
        Self {
            plan,
            storage,
            serde,
            priorities,
            nodes_by_priority,
            states: FxHashMap::default(),
            dirty: BTreeMap::new(),
            invalid: BTreeMap::new(),
            batch_size: batch_size.max(1),
            stats: StateCacheStats::default(),
        }
    }

    /// Whether `node` owns states.
    #[must_use]
    pub fn is_stateful(&self, node: NodeId) -> bool {
        self.priorities.contains_key(&node)
    }

    fn priority(&self, node: NodeId) -> Result<usize, DriverError> {
        self.priorities
            .get(&node)
            .copied()
            .ok_or_else(|| DriverError::NotStateful(node_name(&self.plan, node)))
    }

    /// Whether `(node, id)` is in memory.
    #[must_use]
    pub fn contains(&self, node: NodeId, id: &Id) -> bool {
        self.states.get(&node).is_some_and(|m| m.contains_key(id))
    }

    /// Ids of every `node` state in memory, plus every stored one when
    /// `include_stored` is set.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] if `node` is not stateful or storage fails.
    pub fn ids_of(&self, node: NodeId, include_stored: bool) -> Result<BTreeSet<Id>, DriverError> {
        self.priority(node)?;
        let mut ids: BTreeSet<Id> = self
            .states
            .get(&node)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        if include_stored {
            ids.extend(self.storage.get_span_ids(node, &Span::all(), usize::MAX)?);
        }
        Ok(ids)
    }

    fn lookup(&self, node: NodeId, id: &Id) -> Option<&State> {
        self.states.get(&node).and_then(|m| m.get(id))
    }

    fn lookup_mut(&mut self, key: &StateKey) -> Result<&mut State, DriverError> {
        self.states
            .get_mut(&key.node)
            .and_then(|m| m.get_mut(&key.id))
            .ok_or_else(|| DriverError::StateNotFound(key.clone()))
    }

    /// Returns the state of `(node, id)`, loading or creating it per `flags`.
    ///
    /// `None` means the state does not exist: storage confirmed it (without
    /// `create`), or `noload` forbade asking.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] if `node` is not stateful or storage fails.
    pub fn get(&mut self, node: NodeId, id: &Id, flags: GetFlags) -> Result<Option<&State>, DriverError> {
        self.load_missing(node, std::slice::from_ref(id), flags)?;
        Ok(self.lookup(node, id))
    }

    /// Batched [`StateCache::get`]; absent states are omitted.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] if `node` is not stateful or storage fails.
    pub fn get_many(&mut self, node: NodeId, ids: &[Id], flags: GetFlags) -> Result<FxHashMap<Id, State>, DriverError> {
        self.load_missing(node, ids, flags)?;
        Ok(ids
            .iter()
            .filter_map(|id| self.lookup(node, id).map(|s| (id.clone(), s.clone())))
            .collect())
    }

    fn load_missing(&mut self, node: NodeId, ids: &[Id], flags: GetFlags) -> Result<(), DriverError> {
        let priority = self.priority(node)?;
        let mut missing: Vec<Id> = ids
            .iter()
            .filter(|id| !self.contains(node, id))
            .cloned()
            .collect();
        missing.sort_unstable();
        missing.dedup();
        self.stats.hits += ids.len().saturating_sub(missing.len());
        self.stats.misses += missing.len();
        if missing.is_empty() {
            return Ok(());
        }

        let mut loaded = Vec::new();
        if flags.noload {
            if flags.create {
                loaded.extend(
                    missing
                        .into_iter()
                        .map(|id| State::phantom(StateKey::new(node, id))),
                );
            }
        } else {
            let stored = self
                .storage
                .get(&[(node, missing)], StorageGetFlags { create: flags.create })?;
            self.stats.loads += stored.len();
            for snapshot in &stored {
                loaded.push(self.serde.decode_state(snapshot, flags.share)?);
            }
        }

        let entries = self.states.entry(node).or_default();
        for state in loaded {
            if state.mode() == Mode::Invalid {
                self.invalid
                    .entry(priority)
                    .or_default()
                    .insert(state.key().id.clone());
            }
            entries.insert(state.key().id.clone(), state);
        }
        Ok(())
    }

    /// A state that must already be in memory.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::StateNotFound`] otherwise.
    pub fn state(&self, key: &StateKey) -> Result<&State, DriverError> {
        self.lookup(key.node, &key.id)
            .ok_or_else(|| DriverError::StateNotFound(key.clone()))
    }

    /// Stores rebuilt attributes; the state enters `Modified`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::State`] unless the state is `Phantom` or `Invalid`.
    pub fn set_attributes(&mut self, key: &StateKey, attributes: Attributes) -> Result<(), DriverError> {
        let priority = self.priority(key.node)?;
        self.lookup_mut(key)?.set_attributes(attributes)?;
        if let Some(ids) = self.invalid.get_mut(&priority) {
            ids.remove(&key.id);
        }
        self.dirty.entry(priority).or_default().insert(key.id.clone());
        Ok(())
    }

    /// Marks a cached state `Invalid`. Returns false if it already needed a
    /// build.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::StateNotFound`] if the state is not cached.
    pub fn invalidate(&mut self, key: &StateKey) -> Result<bool, DriverError> {
        let priority = self.priority(key.node)?;
        if !self.lookup_mut(key)?.invalidate()? {
            return Ok(false);
        }
        self.invalid.entry(priority).or_default().insert(key.id.clone());
        self.dirty.entry(priority).or_default().insert(key.id.clone());
        Ok(true)
    }

    /// Merges linkage edges into a cached state. Inputs replace the stored
    /// ones when the state was rebuilt in this context, since the rebuild
    /// defines its inputs afresh. Returns true if anything changed.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::StateNotFound`] if the state is not cached.
    pub fn merge_linkage<'k>(
        &mut self,
        key: &StateKey,
        inputs: impl IntoIterator<Item = &'k StateKey>,
        outputs: impl IntoIterator<Item = &'k StateKey>,
    ) -> Result<bool, DriverError> {
        let priority = self.priority(key.node)?;
        let state = self.lookup_mut(key)?;
        let rebuilt = state.mode() == Mode::Modified;
        let linkage = state.linkage_mut();
        let before = linkage.clone();
        if rebuilt {
            linkage.clear_inputs();
        }
        for input in inputs {
            linkage.add_input(input.node, input.id.clone());
        }
        for output in outputs {
            linkage.add_output(output.node, output.id.clone());
        }
        let changed = *linkage != before;
        if changed {
            self.dirty.entry(priority).or_default().insert(key.id.clone());
        }
        Ok(changed)
    }

    /// The upstream-most invalid state, if any.
    #[must_use]
    pub fn next_invalid(&self) -> Option<StateKey> {
        self.invalid.iter().find_map(|(priority, ids)| {
            let id = ids.iter().next()?;
            let node = self.nodes_by_priority.get(priority)?;
            Some(StateKey::new(*node, id.clone()))
        })
    }

    /// Number of invalid states in memory.
    #[must_use]
    pub fn invalid_count(&self) -> usize {
        self.invalid.values().map(BTreeSet::len).sum()
    }

    /// Number of states awaiting flush.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.dirty.values().map(BTreeSet::len).sum()
    }

    /// Number of states in memory.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.values().map(BTreeMap::len).sum()
    }

    /// True when no state is in memory.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Activity counters.
    #[must_use]
    pub fn stats(&self) -> StateCacheStats {
        self.stats
    }

    /// Drops every in-memory state.
    pub fn clear(&mut self) {
        self.states.clear();
        self.dirty.clear();
        self.invalid.clear();
    }

    /// Writes every dirty state to storage, upstream nodes first, in
    /// batches of at most the configured size.
    ///
    /// States of a failed batch stay dirty and the error is returned; the
    /// next flush retries them. A flush with nothing dirty writes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Storage`] or [`DriverError::Codec`] on the
    /// first failing batch.
    pub fn flush(&mut self) -> Result<FlushStats, DriverError> {
        let mut result = FlushStats::default();
        let pending: Vec<(usize, Vec<Id>)> = self
            .dirty
            .iter()
            .map(|(priority, ids)| (*priority, ids.iter().cloned().collect()))
            .collect();

        for (priority, ids) in pending {
            let Some(node) = self.nodes_by_priority.get(&priority).copied() else {
                continue;
            };
            for chunk in ids.chunks(self.batch_size) {
                let mut snapshots = Vec::with_capacity(chunk.len());
                let mut fresh = Vec::new();
                let mut skipped = Vec::new();
                for id in chunk {
                    let Some(state) = self.lookup(node, id) else {
                        skipped.push(id.clone());
                        continue;
                    };
                    if state.mode() == Mode::Phantom {
                        debug!(state = %state.key(), "skipping flush of unbuilt state");
                        skipped.push(id.clone());
                        continue;
                    }
                    if state.version() == 0 {
                        fresh.push(id.clone());
                    }
                    snapshots.push(self.serde.encode_state(state)?);
                }
                self.undirty(priority, &skipped);
                if snapshots.is_empty() {
                    continue;
                }

                let written = if fresh.is_empty() {
                    Ok(())
                } else {
                    self.storage.allocate(node, &fresh)
                }
                .and_then(|()| self.storage.put(&snapshots, false));
                if let Err(err) = written {
                    warn!(
                        node = %node_name(&self.plan, node),
                        states = snapshots.len(),
                        error = %err,
                        "flush batch failed"
                    );
                    return Err(err.into());
                }

                for snapshot in &snapshots {
                    if let Some(state) = self
                        .states
                        .get_mut(&node)
                        .and_then(|m| m.get_mut(&snapshot.id))
                    {
                        state.mark_flushed()?;
                    }
                }
                let flushed: Vec<Id> = snapshots.into_iter().map(|s| s.id).collect();
                self.undirty(priority, &flushed);
                result.states += flushed.len();
                result.batches += 1;
            }
        }

        self.stats.flushed += result.states;
        if result.states > 0 {
            debug!(states = result.states, batches = result.batches, "flushed state cache");
        }
        Ok(result)
    }

    fn undirty(&mut self, priority: usize, ids: &[Id]) {
        if let Some(set) = self.dirty.get_mut(&priority) {
            for id in ids {
                set.remove(id);
            }
            if set.is_empty() {
                self.dirty.remove(&priority);
            }
        }
    }
}

impl std::fmt::Debug for StateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCache")
            .field("states", &self.len())
            .field("dirty", &self.dirty_count())
            .field("invalid", &self.invalid_count())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
