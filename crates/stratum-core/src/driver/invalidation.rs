//! Propagation of a rebuilt state's change to dependent states.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::plan::{InvalidationStrength, NodeId, Plan, SinkResolution};
use crate::state::{State, StateKey};
use crate::types::{Id, Value};

use super::cache::{GetFlags, StateCache};
use super::error::{node_name, DriverError};
use super::lineage::LineageRetention;
use super::linkage::LinkageManager;

/// Counters of one context's propagation work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationStats {
    /// Sink edges that fired.
    pub fired: usize,
    /// Sink edges suppressed by their update mask.
    pub masked: usize,
    /// States moved to `Invalid`.
    pub invalidated: usize,
}

/// Applies the plan's static invalidation map to rebuilt states.
///
/// Propagation is one hop: the invalidated states are not themselves
/// propagated until they are rebuilt.
///
/// Lineage sinks follow recorded edges. Under [`LineageRetention::Nop`] no
/// edges exist, so a lineage sink invalidates every state of its target
/// instead: stored and cached ones for a strong sink, cached ones for a weak
/// sink.
#[derive(Debug)]
pub struct InvalidationManager {
    plan: Arc<Plan>,
    lineage_recorded: bool,
    stats: InvalidationStats,
}

impl InvalidationManager {
    /// Creates a manager over `plan`'s invalidation map.
    #[must_use]
    pub fn new(plan: Arc<Plan>, retention: LineageRetention) -> Self {
        Self {
            plan,
            lineage_recorded: retention != LineageRetention::Nop,
            stats: InvalidationStats::default(),
        }
    }

    /// Propagation counters so far.
    #[must_use]
    pub fn stats(&self) -> InvalidationStats {
        self.stats
    }

    /// Invalidates every state that depends on the just-rebuilt `key`.
    /// Returns the number of states newly marked `Invalid`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] if `key` is not cached or a strong sink fails
    /// to load its target.
    pub fn invalidate(
        &mut self,
        cache: &mut StateCache,
        linkage: &LinkageManager,
        key: &StateKey,
    ) -> Result<usize, DriverError> {
        let plan = Arc::clone(&self.plan);
        let sinks = plan.invalidation_sinks(key.node);
        if sinks.is_empty() {
            return Ok(0);
        }

        let mut pending: Vec<(NodeId, Option<BTreeSet<Id>>, InvalidationStrength)> = Vec::with_capacity(sinks.len());
        {
            let state = cache.state(key)?;
            for sink in sinks {
                if let Some(mask) = &sink.update_mask {
                    if !mask.iter().any(|p| state.updated_fields().contains(p)) {
                        self.stats.masked += 1;
                        continue;
                    }
                }
                let ids = match &sink.resolution {
                    SinkResolution::Lineage if !self.lineage_recorded => None,
                    SinkResolution::Lineage => Some(lineage_targets(state, linkage, sink.target)),
                    SinkResolution::KeyFields(positions) => Some(key_targets(state, positions)),
                };
                self.stats.fired += 1;
                pending.push((sink.target, ids, sink.strength));
            }
        }

        let mut invalidated = 0;
        for (target, ids, strength) in pending {
            let flags = match strength {
                InvalidationStrength::Strong => GetFlags::NONE,
                InvalidationStrength::Weak => GetFlags::NONE.with_noload(),
            };
            let ids = match ids {
                Some(ids) => ids,
                None => cache.ids_of(target, strength == InvalidationStrength::Strong)?,
            };
            for id in ids {
                if cache.get(target, &id, flags)?.is_none() {
                    continue;
                }
                let downstream = StateKey::new(target, id);
                if cache.invalidate(&downstream)? {
                    debug!(
                        source = %key,
                        node = %node_name(&plan, target),
                        id = %downstream.id,
                        "invalidated dependent state"
                    );
                    invalidated += 1;
                }
            }
        }
        self.stats.invalidated += invalidated;
        Ok(invalidated)
    }
}

/// Target ids linked from `state`, durably or in this context.
fn lineage_targets(state: &State, linkage: &LinkageManager, target: NodeId) -> BTreeSet<Id> {
    state
        .linkage()
        .outputs_on(target)
        .cloned()
        .chain(
            linkage
                .outputs(state.key())
                .filter(|k| k.node == target)
                .map(|k| k.id.clone()),
        )
        .collect()
}

/// Target ids named by `state`'s attributes before and after the rebuild.
fn key_targets(state: &State, positions: &[usize]) -> BTreeSet<Id> {
    [state.prior_attributes(), state.raw_attributes()]
        .into_iter()
        .flatten()
        .filter_map(|attributes| {
            let values: Option<Vec<Value>> = positions.iter().map(|p| attributes.get(*p).cloned()).collect();
            values.map(|v| Id::from_values(&v))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{SerdeManager, TaggedValueSerde};
    use crate::driver::lineage::{Lineage, LineageEntry};
    use crate::plan::{Invalidation, PlanBuilder};
    use crate::state::{Attributes, Mode};
    use crate::storage::{HeapStateStorage, StateStorage};
    use crate::types::{Field, FieldType};

    // users(id, team) -> copy(id, team); users also invalidates teams(team)
    // by key when the team field changes, without feeding it.
    fn plan() -> Arc<Plan> {
        let users = vec![Field::new("id", FieldType::Long), Field::new("team", FieldType::Long)];
        let teams = vec![Field::new("team", FieldType::Long)];
        Arc::new(
            PlanBuilder::new()
                .node(
                    "users",
                    crate::plan::NodeKind::Scan(crate::plan::ScanNode {
                        table: "users".into(),
                        fields: users,
                        id_fields: vec!["id".into()],
                        invalidations: vec![Invalidation::new("teams")
                            .key_field("team", "team")
                            .update_mask(["team"])],
                    }),
                )
                .persist("copy", "users", &["id"])
                .scan("teams", "teams", teams, &["team"])
                .persist("teams_copy", "teams", &["team"])
                .node(
                    "all",
                    crate::plan::NodeKind::CrossJoin(crate::plan::CrossJoinNode {
                        sources: vec!["copy".into(), "teams_copy".into()],
                        mode: crate::plan::CrossJoinMode::Full,
                    }),
                )
                .build("all")
                .unwrap(),
        )
    }

    struct Fixture {
        plan: Arc<Plan>,
        storage: Arc<HeapStateStorage>,
        cache: StateCache,
        linkage: LinkageManager,
        manager: InvalidationManager,
    }

    impl Fixture {
        /// A fresh cache over the same storage.
        fn reopen(&self) -> StateCache {
            cache_over(&self.plan, &self.storage)
        }
    }

    fn cache_over(plan: &Arc<Plan>, storage: &Arc<HeapStateStorage>) -> StateCache {
        let serde = Arc::new(SerdeManager::new(plan, Arc::new(TaggedValueSerde)));
        StateCache::new(Arc::clone(plan), Arc::clone(storage) as Arc<dyn StateStorage>, serde, 8)
    }

    fn fixture_with(retention: LineageRetention) -> Fixture {
        let plan = plan();
        let storage = Arc::new(HeapStateStorage::new());
        Fixture {
            cache: cache_over(&plan, &storage),
            linkage: LinkageManager::new(),
            manager: InvalidationManager::new(Arc::clone(&plan), retention),
            plan,
            storage,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(LineageRetention::Minimal)
    }

    fn key(node: &str, v: i64) -> StateKey {
        StateKey::new(NodeId::from_name(node), Id::from_values(&[Value::Long(v)]))
    }

    fn attrs(values: &[i64]) -> Attributes {
        Some(values.iter().map(|v| Value::Long(*v)).collect::<Arc<[Value]>>())
    }

    fn built(cache: &mut StateCache, key: &StateKey, values: &[i64]) {
        cache.get(key.node, &key.id, GetFlags::CREATE).unwrap();
        cache.set_attributes(key, attrs(values)).unwrap();
    }

    #[test]
    fn test_lineage_sink_invalidates_linked_state_only() {
        let mut f = fixture();
        let user = key("users", 1);
        let linked = key("copy", 1);
        let unlinked = key("copy", 2);
        built(&mut f.cache, &user, &[1, 7]);
        built(&mut f.cache, &linked, &[1, 7]);
        built(&mut f.cache, &unlinked, &[2, 7]);
        let mut lineage = Lineage::default();
        lineage.push(LineageEntry::Id {
            node: user.node,
            id: user.id.clone(),
        });
        f.linkage
            .add_state_lineage(&mut f.cache, &linked, &lineage)
            .unwrap();
        f.cache.flush().unwrap();

        f.cache.invalidate(&user).unwrap();
        f.cache.set_attributes(&user, attrs(&[1, 7])).unwrap();
        let count = f.manager.invalidate(&mut f.cache, &f.linkage, &user).unwrap();

        assert_eq!(count, 1);
        assert_eq!(f.cache.state(&linked).unwrap().mode(), Mode::Invalid);
        assert_eq!(f.cache.state(&unlinked).unwrap().mode(), Mode::Exclusive);
    }

    #[test]
    fn test_key_sink_respects_update_mask() {
        let mut f = fixture();
        let user = key("users", 1);
        built(&mut f.cache, &user, &[1, 7]);
        built(&mut f.cache, &key("teams", 7), &[7]);
        built(&mut f.cache, &key("teams", 8), &[8]);
        f.cache.flush().unwrap();

        // Rebuilt with the same team: masked.
        f.cache.invalidate(&user).unwrap();
        f.cache.set_attributes(&user, attrs(&[1, 7])).unwrap();
        assert_eq!(f.manager.invalidate(&mut f.cache, &f.linkage, &user).unwrap(), 0);
        assert_eq!(f.manager.stats().masked, 1);
        f.cache.flush().unwrap();

        // Moved teams: both old and new team states are invalidated.
        f.cache.invalidate(&user).unwrap();
        f.cache.set_attributes(&user, attrs(&[1, 8])).unwrap();
        assert_eq!(f.manager.invalidate(&mut f.cache, &f.linkage, &user).unwrap(), 2);
        assert_eq!(f.cache.state(&key("teams", 7)).unwrap().mode(), Mode::Invalid);
        assert_eq!(f.cache.state(&key("teams", 8)).unwrap().mode(), Mode::Invalid);
    }

    #[test]
    fn test_missing_targets_are_skipped() {
        let mut f = fixture();
        let user = key("users", 3);
        built(&mut f.cache, &user, &[3, 9]);
        assert_eq!(f.manager.invalidate(&mut f.cache, &f.linkage, &user).unwrap(), 0);
        assert!(!f.cache.contains(NodeId::from_name("teams"), &key("teams", 9).id));
    }

    #[test]
    fn test_unrecorded_lineage_invalidates_every_target_state() {
        let mut f = fixture_with(LineageRetention::Nop);
        let user = key("users", 1);
        built(&mut f.cache, &user, &[1, 7]);
        for v in 1..=3 {
            built(&mut f.cache, &key("copy", v), &[v, 7]);
        }
        f.cache.flush().unwrap();

        // Only copy 1 is in memory; the others are reached through storage.
        let mut cache = f.reopen();
        cache.get(user.node, &user.id, GetFlags::NONE).unwrap();
        cache.get(NodeId::from_name("copy"), &key("copy", 1).id, GetFlags::NONE).unwrap();
        cache.invalidate(&user).unwrap();
        cache.set_attributes(&user, attrs(&[1, 7])).unwrap();

        assert_eq!(f.manager.invalidate(&mut cache, &f.linkage, &user).unwrap(), 3);
        for v in 1..=3 {
            assert_eq!(cache.state(&key("copy", v)).unwrap().mode(), Mode::Invalid);
        }
    }

    #[test]
    fn test_recorded_lineage_without_edges_invalidates_nothing() {
        let mut f = fixture();
        let user = key("users", 1);
        built(&mut f.cache, &user, &[1, 7]);
        built(&mut f.cache, &key("copy", 1), &[1, 7]);
        f.cache.flush().unwrap();

        f.cache.invalidate(&user).unwrap();
        f.cache.set_attributes(&user, attrs(&[1, 7])).unwrap();
        assert_eq!(f.manager.invalidate(&mut f.cache, &f.linkage, &user).unwrap(), 0);
        assert_eq!(f.cache.state(&key("copy", 1)).unwrap().mode(), Mode::Exclusive);
    }
}
