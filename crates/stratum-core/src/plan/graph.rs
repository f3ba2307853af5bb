//! The immutable, validated plan DAG.

use std::collections::VecDeque;

use fxhash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use super::builder::residual_by_name;
use super::error::PlanError;
use super::node::{InvalidationStrength, NodeId, PNode};
use super::toposort::toposort;

/// How a sink resolves which of its ids an upstream change affects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkResolution {
    /// Through the recorded lineage of the changed state.
    Lineage,
    /// By reading these positions of the changed state's attributes, in the
    /// target's id-field order.
    KeyFields(Vec<usize>),
}

/// One edge of the static invalidation map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationSink {
    /// Stateful node to invalidate.
    pub target: NodeId,
    /// Id resolution.
    pub resolution: SinkResolution,
    /// Field positions that must have changed for the edge to fire.
    pub update_mask: Option<Vec<usize>>,
    /// Reach of the invalidation.
    pub strength: InvalidationStrength,
}

/// Immutable DAG of operator nodes reachable from one root.
///
/// All orderings are computed once at construction. Within a toposort wave
/// nodes are ordered by name, so structurally identical plans order
/// identically.
#[derive(Debug)]
pub struct Plan {
    root: NodeId,
    nodes: FxHashMap<NodeId, PNode>,
    by_name: FxHashMap<String, NodeId>,
    name_sorted: Vec<NodeId>,
    waves: Vec<Vec<NodeId>>,
    reverse_waves: Vec<Vec<NodeId>>,
    toposorted: Vec<NodeId>,
    topo_index: FxHashMap<NodeId, usize>,
    wave_index: FxHashMap<NodeId, usize>,
    consumers: FxHashMap<NodeId, SmallVec<[NodeId; 4]>>,
    sinks: FxHashMap<NodeId, Vec<InvalidationSink>>,
}

impl Plan {
    pub(crate) fn new(
        root: NodeId,
        nodes: FxHashMap<NodeId, PNode>,
        name_sorted: &[String],
        waves: Vec<Vec<NodeId>>,
    ) -> Result<Self, PlanError> {
        let by_name = nodes.values().map(|n| (n.name.clone(), n.id)).collect();
        let name_sorted = name_sorted.iter().map(|n| NodeId::from_name(n)).collect();
        let reverse_waves = waves
            .iter()
            .rev()
            .map(|wave| wave.iter().rev().copied().collect())
            .collect();
        let toposorted: Vec<NodeId> = waves.iter().flatten().copied().collect();
        let topo_index = toposorted.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let wave_index = waves
            .iter()
            .enumerate()
            .flat_map(|(w, wave)| wave.iter().map(move |id| (*id, w)))
            .collect();

        let mut consumers: FxHashMap<NodeId, SmallVec<[NodeId; 4]>> = FxHashMap::default();
        for id in &toposorted {
            for source in nodes[id].sources() {
                let entry = consumers.entry(*source).or_default();
                if !entry.contains(id) {
                    entry.push(*id);
                }
            }
        }

        let mut plan = Self {
            root,
            nodes,
            by_name,
            name_sorted,
            waves,
            reverse_waves,
            toposorted,
            topo_index,
            wave_index,
            consumers,
            sinks: FxHashMap::default(),
        };
        plan.sinks = plan.resolve_invalidation_sinks()?;
        Ok(plan)
    }

    /// The root node.
    #[must_use]
    pub fn root(&self) -> &PNode {
        &self.nodes[&self.root]
    }

    /// Node by id.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&PNode> {
        self.nodes.get(&id)
    }

    /// Node by name.
    #[must_use]
    pub fn node_by_name(&self, name: &str) -> Option<&PNode> {
        self.by_name.get(name).and_then(|id| self.nodes.get(id))
    }

    /// Node by id, as a lookup that must succeed.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::NodeNotFound`] if `id` is not part of this plan.
    pub fn get(&self, id: NodeId) -> Result<&PNode, PlanError> {
        self.nodes
            .get(&id)
            .ok_or_else(|| PlanError::NodeNotFound(id.to_string()))
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false; a plan holds at least its root.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in name order.
    pub fn nodes(&self) -> impl Iterator<Item = &PNode> {
        self.name_sorted.iter().map(|id| &self.nodes[id])
    }

    /// Toposort waves, sources first.
    #[must_use]
    pub fn waves(&self) -> &[Vec<NodeId>] {
        &self.waves
    }

    /// Waves in reverse, each wave internally reversed.
    #[must_use]
    pub fn reverse_waves(&self) -> &[Vec<NodeId>] {
        &self.reverse_waves
    }

    /// Flattened toposort order.
    #[must_use]
    pub fn toposorted(&self) -> &[NodeId] {
        &self.toposorted
    }

    /// Position of `id` in [`Plan::toposorted`].
    #[must_use]
    pub fn topo_index(&self, id: NodeId) -> Option<usize> {
        self.topo_index.get(&id).copied()
    }

    /// Wave containing `id`.
    #[must_use]
    pub fn wave_index(&self, id: NodeId) -> Option<usize> {
        self.wave_index.get(&id).copied()
    }

    /// Nodes that read from `id`.
    #[must_use]
    pub fn consumers(&self, id: NodeId) -> &[NodeId] {
        self.consumers
            .get(&id)
            .map(|c| c.as_slice())
            .unwrap_or_default()
    }

    /// Stateful nodes in toposort order.
    pub fn stateful_nodes(&self) -> impl Iterator<Item = &PNode> {
        self.toposorted
            .iter()
            .map(|id| &self.nodes[id])
            .filter(|n| n.is_stateful())
    }

    /// Static invalidation edges leaving `id`.
    #[must_use]
    pub fn invalidation_sinks(&self, id: NodeId) -> &[InvalidationSink] {
        self.sinks
            .get(&id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn name_of(&self, id: NodeId) -> String {
        self.nodes
            .get(&id)
            .map_or_else(|| id.to_string(), |n| n.name.clone())
    }

    /// Builds the static invalidation map: implicit edges to the nearest
    /// downstream stateful nodes, overridden per target by declared edges.
    fn resolve_invalidation_sinks(&self) -> Result<FxHashMap<NodeId, Vec<InvalidationSink>>, PlanError> {
        let mut sinks: FxHashMap<NodeId, Vec<InvalidationSink>> = FxHashMap::default();
        for node in self.stateful_nodes() {
            let mut edges: Vec<InvalidationSink> = self
                .nearest_stateful_consumers(node.id)
                .into_iter()
                .map(|target| InvalidationSink {
                    target,
                    resolution: SinkResolution::Lineage,
                    update_mask: None,
                    strength: InvalidationStrength::Strong,
                })
                .collect();

            for declared in node.kind.invalidations() {
                let target = self
                    .node_by_name(&declared.target)
                    .ok_or_else(|| PlanError::NodeNotFound(declared.target.clone()))?;
                if !target.is_stateful() || target.id == node.id {
                    return Err(PlanError::invalid(
                        &node.name,
                        format!("invalidation target {} must be another stateful node", target.name),
                    ));
                }
                let resolution = if declared.key_fields.is_empty() {
                    SinkResolution::Lineage
                } else {
                    let id_fields = target.kind.id_fields().unwrap_or_default();
                    let mut positions = Vec::with_capacity(id_fields.len());
                    for id_field in id_fields {
                        let source_field = declared
                            .key_fields
                            .iter()
                            .find(|(_, t)| t == id_field)
                            .map(|(s, _)| s)
                            .ok_or_else(|| {
                                PlanError::invalid(
                                    &node.name,
                                    format!("invalidation of {} does not map id field {id_field}", target.name),
                                )
                            })?;
                        positions.extend(node.fields.positions_of(&node.name, std::slice::from_ref(source_field))?);
                    }
                    if declared.key_fields.len() != id_fields.len() {
                        return Err(PlanError::invalid(
                            &node.name,
                            format!("invalidation of {} maps fields outside its id", target.name),
                        ));
                    }
                    SinkResolution::KeyFields(positions)
                };
                let update_mask = declared
                    .update_mask
                    .as_ref()
                    .map(|mask| node.fields.positions_of(&node.name, mask))
                    .transpose()?;
                edges.retain(|e| e.target != target.id);
                edges.push(InvalidationSink {
                    target: target.id,
                    resolution,
                    update_mask,
                    strength: declared.strength,
                });
            }
            if !edges.is_empty() {
                sinks.insert(node.id, edges);
            }
        }

        // Declared edges may point anywhere; the stateful graph must stay acyclic.
        let mut dependencies: FxHashMap<NodeId, FxHashSet<NodeId>> = FxHashMap::default();
        for (source, edges) in &sinks {
            for edge in edges {
                dependencies.entry(edge.target).or_default().insert(*source);
            }
        }
        if let Err(err) = toposort(&dependencies) {
            let names: FxHashMap<NodeId, String> = err
                .residual
                .keys()
                .chain(err.residual.values().flatten())
                .map(|id| (*id, self.name_of(*id)))
                .collect();
            return Err(PlanError::CycleDetected {
                residual: residual_by_name(&err.residual, &names),
            });
        }
        Ok(sinks)
    }

    fn nearest_stateful_consumers(&self, id: NodeId) -> Vec<NodeId> {
        let mut found = Vec::new();
        let mut seen: FxHashSet<NodeId> = FxHashSet::default();
        let mut queue: VecDeque<NodeId> = self.consumers(id).iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next) {
                continue;
            }
            if self.nodes[&next].is_stateful() {
                found.push(next);
            } else {
                queue.extend(self.consumers(next).iter().copied());
            }
        }
        found.sort_unstable_by_key(|n| self.topo_index[n]);
        found
    }
}
