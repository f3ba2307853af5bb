use std::collections::{BTreeMap, BTreeSet};

use crate::plan::NodeId;
use crate::types::Id;

/// Upstream inputs and downstream outputs of one state, by node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Linkage {
    inputs: BTreeMap<NodeId, BTreeSet<Id>>,
    outputs: BTreeMap<NodeId, BTreeSet<Id>>,
}

impl Linkage {
    /// States this state was derived from.
    #[must_use]
    pub fn inputs(&self) -> &BTreeMap<NodeId, BTreeSet<Id>> {
        &self.inputs
    }

    /// States derived from this state.
    #[must_use]
    pub fn outputs(&self) -> &BTreeMap<NodeId, BTreeSet<Id>> {
        &self.outputs
    }

    /// Output ids on `node`.
    pub fn outputs_on(&self, node: NodeId) -> impl Iterator<Item = &Id> {
        self.outputs.get(&node).into_iter().flatten()
    }

    /// True when no edges are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }

    /// Adds an input edge; returns true if it was new.
    pub fn add_input(&mut self, node: NodeId, id: Id) -> bool {
        self.inputs.entry(node).or_default().insert(id)
    }

    /// Adds an output edge; returns true if it was new.
    pub fn add_output(&mut self, node: NodeId, id: Id) -> bool {
        self.outputs.entry(node).or_default().insert(id)
    }

    /// Drops every input edge; returns true if any existed.
    pub fn clear_inputs(&mut self) -> bool {
        let had = !self.inputs.is_empty();
        self.inputs.clear();
        had
    }
}
