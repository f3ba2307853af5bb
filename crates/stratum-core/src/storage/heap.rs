//! In-process [`StateStorage`] over ordered maps.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use fxhash::FxHashMap;
use parking_lot::RwLock;

use crate::plan::NodeId;
use crate::types::Id;

use super::{Span, StateStorage, StorageError, StorageGetFlags, StorageState};

/// Heap-backed state storage with optimistic versioning.
///
/// Every operation is counted so callers can assert whether storage was
/// touched.
#[derive(Debug, Default)]
pub struct HeapStateStorage {
    nodes: RwLock<FxHashMap<NodeId, BTreeMap<Id, StorageState>>>,
    gets: AtomicU64,
    puts: AtomicU64,
}

impl HeapStateStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` calls served.
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// Number of successful `put` calls.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Stored snapshot of `(node, id)`, bypassing the counters.
    #[must_use]
    pub fn peek(&self, node: NodeId, id: &Id) -> Option<StorageState> {
        self.nodes.read().get(&node).and_then(|m| m.get(id)).cloned()
    }

    /// Number of stored entries across nodes, placeholders included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.read().values().map(BTreeMap::len).sum()
    }

    /// True when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStorage for HeapStateStorage {
    fn get(&self, ids_by_node: &[(NodeId, Vec<Id>)], flags: StorageGetFlags) -> Result<Vec<StorageState>, StorageError> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        let nodes = self.nodes.read();
        let mut found = Vec::new();
        for (node, ids) in ids_by_node {
            let stored = nodes.get(node);
            for id in ids {
                match stored.and_then(|m| m.get(id)) {
                    Some(state) => found.push(state.clone()),
                    None if flags.create => found.push(StorageState::created(*node, id.clone())),
                    None => {}
                }
            }
        }
        Ok(found)
    }

    fn put(&self, states: &[StorageState], create: bool) -> Result<(), StorageError> {
        let mut nodes = self.nodes.write();
        for state in states {
            let current = nodes.get(&state.node).and_then(|m| m.get(&state.id));
            let actual = match current {
                Some(stored) => stored.version,
                None if create => 0,
                None => {
                    return Err(StorageError::NotFound {
                        node: state.node,
                        id: state.id.clone(),
                    })
                }
            };
            if actual != state.version {
                return Err(StorageError::VersionConflict {
                    node: state.node,
                    id: state.id.clone(),
                    expected: state.version,
                    actual,
                });
            }
        }
        for state in states {
            let mut stored = state.clone();
            stored.version += 1;
            stored.created = false;
            nodes
                .entry(state.node)
                .or_default()
                .insert(state.id.clone(), stored);
        }
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn allocate(&self, node: NodeId, ids: &[Id]) -> Result<(), StorageError> {
        let mut nodes = self.nodes.write();
        let entries = nodes.entry(node).or_default();
        for id in ids {
            entries
                .entry(id.clone())
                .or_insert_with(|| StorageState::created(node, id.clone()));
        }
        Ok(())
    }

    fn get_span_ids(&self, node: NodeId, span: &Span, limit: usize) -> Result<Vec<Id>, StorageError> {
        if span.is_empty() {
            return Ok(Vec::new());
        }
        let nodes = self.nodes.read();
        let Some(entries) = nodes.get(&node) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .range((span.lower.clone(), span.upper.clone()))
            .filter(|(_, state)| !state.created)
            .take(limit)
            .map(|(id, _)| id.clone())
            .collect())
    }
}
