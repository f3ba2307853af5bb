//! Error types for plan construction and lookup.

use std::collections::BTreeMap;

/// Errors that can occur while building or querying a [`Plan`](super::Plan).
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// The dependency graph contains a cycle. Carries every node that could
    /// not be ordered together with its unresolved sources.
    #[error("cycle detected; unresolved dependencies: {residual:?}")]
    CycleDetected {
        /// Node name -> names of its unresolved sources.
        residual: BTreeMap<String, Vec<String>>,
    },

    /// Two node definitions share a name.
    #[error("duplicate node name: {0}")]
    DuplicateNodeName(String),

    /// Two distinct names hash to the same node id.
    #[error("duplicate node id {id} for nodes {first} and {second}")]
    DuplicateNodeId {
        /// Colliding id.
        id: u64,
        /// First node name.
        first: String,
        /// Second node name.
        second: String,
    },

    /// A node or source name is not defined.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// A node references a field its input does not provide.
    #[error("node {node}: unknown field {field}")]
    UnknownField {
        /// Referencing node.
        node: String,
        /// Missing field.
        field: String,
    },

    /// A node schema declares the same field name twice.
    #[error("node {node}: duplicate field {field}")]
    DuplicateField {
        /// Offending node.
        node: String,
        /// Repeated field.
        field: String,
    },

    /// Operator parameters are inconsistent with their inputs.
    #[error("node {node}: {reason}")]
    InvalidNode {
        /// Offending node.
        node: String,
        /// What is wrong.
        reason: String,
    },
}

impl PlanError {
    pub(crate) fn invalid(node: &str, reason: impl Into<String>) -> Self {
        Self::InvalidNode {
            node: node.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unknown_field(node: &str, field: &str) -> Self {
        Self::UnknownField {
            node: node.to_string(),
            field: field.to_string(),
        }
    }
}
