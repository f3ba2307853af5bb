//! Dynamic lineage bookkeeping between states.

use std::collections::BTreeSet;

use fxhash::FxHashMap;

use crate::state::StateKey;

use super::cache::{GetFlags, StateCache};
use super::error::DriverError;
use super::lineage::Lineage;

#[derive(Debug, Default)]
struct Entry {
    inputs: BTreeSet<StateKey>,
    outputs: BTreeSet<StateKey>,
}

/// Records which upstream states produced which downstream states during
/// one context, as a bidirectional adjacency.
///
/// Recording an edge never invalidates anything. The edges reach the
/// states' own [`Linkage`](crate::state::Linkage) on [`LinkageManager::update`],
/// which runs at commit.
#[derive(Debug, Default)]
pub struct LinkageManager {
    entries: FxHashMap<StateKey, Entry>,
}

impl LinkageManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `key` as derived from every stateful entry of `lineage`.
    /// Upstream states are resolved in the cache without loading, and
    /// created as `Phantom` if absent. Returns the number of new edges.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::StateNotFound`] if an upstream state cannot be
    /// resolved.
    pub fn add_state_lineage(
        &mut self,
        cache: &mut StateCache,
        key: &StateKey,
        lineage: &Lineage,
    ) -> Result<usize, DriverError> {
        let mut added = 0;
        for entry in lineage {
            let Some(id) = entry.id() else {
                continue;
            };
            if !cache.is_stateful(entry.node()) {
                continue;
            }
            let upstream = StateKey::new(entry.node(), id.clone());
            if upstream == *key {
                continue;
            }
            cache
                .get(upstream.node, &upstream.id, GetFlags::CREATE.with_noload())?
                .ok_or_else(|| DriverError::StateNotFound(upstream.clone()))?;
            self.entries
                .entry(key.clone())
                .or_default()
                .inputs
                .insert(upstream.clone());
            if self
                .entries
                .entry(upstream)
                .or_default()
                .outputs
                .insert(key.clone())
            {
                added += 1;
            }
        }
        Ok(added)
    }

    /// States recorded as derived from `key` in this context.
    pub fn outputs(&self, key: &StateKey) -> impl Iterator<Item = &StateKey> {
        self.entries.get(key).into_iter().flat_map(|e| e.outputs.iter())
    }

    /// States `key` was recorded as derived from in this context.
    pub fn inputs(&self, key: &StateKey) -> impl Iterator<Item = &StateKey> {
        self.entries.get(key).into_iter().flat_map(|e| e.inputs.iter())
    }

    /// Number of states with recorded edges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merges the recorded edges into the cached states. Returns the number
    /// of states whose linkage changed.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::StateNotFound`] if a state with recorded edges
    /// is no longer cached.
    pub fn update(&self, cache: &mut StateCache) -> Result<usize, DriverError> {
        let mut changed = 0;
        for (key, entry) in &self.entries {
            if cache.merge_linkage(key, &entry.inputs, &entry.outputs)? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Forgets every recorded edge.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::codec::{SerdeManager, TaggedValueSerde};
    use crate::driver::lineage::LineageEntry;
    use crate::plan::{NodeId, Plan, PlanBuilder};
    use crate::state::Mode;
    use crate::storage::HeapStateStorage;
    use crate::types::{Field, FieldType, Id, Value};

    fn plan() -> Arc<Plan> {
        Arc::new(
            PlanBuilder::new()
                .scan("scan", "t", vec![Field::new("id", FieldType::Long)], &["id"])
                .persist("persist", "scan", &["id"])
                .build("persist")
                .unwrap(),
        )
    }

    fn cache() -> (StateCache, Arc<HeapStateStorage>) {
        let plan = plan();
        let storage = Arc::new(HeapStateStorage::new());
        let serde = Arc::new(SerdeManager::new(&plan, Arc::new(TaggedValueSerde)));
        (StateCache::new(plan, storage.clone(), serde, 8), storage)
    }

    fn key(node: &str, v: i64) -> StateKey {
        StateKey::new(NodeId::from_name(node), Id::from_values(&[Value::Long(v)]))
    }

    fn lineage_of(keys: &[StateKey]) -> Lineage {
        let mut lineage = Lineage::default();
        for k in keys {
            lineage.push(LineageEntry::Id {
                node: k.node,
                id: k.id.clone(),
            });
        }
        lineage
    }

    fn built(cache: &mut StateCache, key: &StateKey) {
        cache.get(key.node, &key.id, GetFlags::CREATE).unwrap();
        cache
            .set_attributes(key, Some(Arc::from(vec![Value::Long(1)])))
            .unwrap();
    }

    #[test]
    fn test_edges_recorded_both_ways() {
        let (mut cache, _) = cache();
        let mut manager = LinkageManager::new();
        let (up, down) = (key("scan", 1), key("persist", 1));
        assert_eq!(
            manager
                .add_state_lineage(&mut cache, &down, &lineage_of(&[up.clone()]))
                .unwrap(),
            1
        );
        assert_eq!(manager.outputs(&up).collect::<Vec<_>>(), vec![&down]);
        assert_eq!(manager.inputs(&down).collect::<Vec<_>>(), vec![&up]);
        // Same edge again is not new.
        assert_eq!(
            manager
                .add_state_lineage(&mut cache, &down, &lineage_of(&[up.clone()]))
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_missing_upstream_is_created_without_loading() {
        let (mut cache, storage) = cache();
        let mut manager = LinkageManager::new();
        let (up, down) = (key("scan", 1), key("persist", 1));
        manager
            .add_state_lineage(&mut cache, &down, &lineage_of(&[up.clone()]))
            .unwrap();
        assert_eq!(cache.state(&up).unwrap().mode(), Mode::Phantom);
        assert_eq!(storage.get_count(), 0);
    }

    #[test]
    fn test_self_and_stateless_entries_ignored() {
        let (mut cache, _) = cache();
        let mut manager = LinkageManager::new();
        let down = key("persist", 1);
        let stateless = StateKey::new(NodeId::from_name("nowhere"), down.id.clone());
        let lineage = lineage_of(&[down.clone(), stateless]);
        assert_eq!(manager.add_state_lineage(&mut cache, &down, &lineage).unwrap(), 0);
        assert!(manager.is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_update_merges_into_cached_states() {
        let (mut cache, _) = cache();
        let mut manager = LinkageManager::new();
        let (up, down) = (key("scan", 1), key("persist", 1));
        built(&mut cache, &up);
        built(&mut cache, &down);
        manager
            .add_state_lineage(&mut cache, &down, &lineage_of(&[up.clone()]))
            .unwrap();

        assert_eq!(manager.update(&mut cache).unwrap(), 2);
        let outputs: Vec<&Id> = cache
            .state(&up)
            .unwrap()
            .linkage()
            .outputs_on(down.node)
            .collect();
        assert_eq!(outputs, vec![&down.id]);
        assert!(cache.state(&down).unwrap().linkage().inputs().contains_key(&up.node));
    }

    #[test]
    fn test_update_reports_uncached_state() {
        let (mut cache, _) = cache();
        let mut manager = LinkageManager::new();
        let (up, down) = (key("scan", 1), key("persist", 1));
        built(&mut cache, &up);
        built(&mut cache, &down);
        manager
            .add_state_lineage(&mut cache, &down, &lineage_of(&[up]))
            .unwrap();
        cache.clear();

        assert!(matches!(
            manager.update(&mut cache),
            Err(DriverError::StateNotFound(_))
        ));
    }
}
