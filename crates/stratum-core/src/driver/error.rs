//! Error types for the execution driver.

use crate::codec::CodecError;
use crate::connector::ConnectorError;
use crate::plan::{NodeId, PlanError};
use crate::state::{StateError, StateKey};
use crate::storage::StorageError;
use crate::types::Key;

use super::context::ContextState;

/// Errors that can occur while building, invalidating or committing.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Plan lookup or validation failed.
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    /// Illegal state use.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Backing storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A connector or scanner failed.
    #[error("connector error: {0}")]
    Connector(#[from] ConnectorError),

    /// State or id (de)serialization failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The node is not part of the plan.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// The node does not own per-row state.
    #[error("node {0} is not stateful")]
    NotStateful(String),

    /// An expected state is absent from the cache.
    #[error("state not found: {0}")]
    StateNotFound(StateKey),

    /// A scan node names a table missing from the catalog.
    #[error("node {node}: table {table} not found in catalog")]
    TableNotFound {
        /// Scan node name.
        node: String,
        /// Missing table.
        table: String,
    },

    /// A builder produced no rows.
    #[error("build of {node} for key {key} returned no rows")]
    EmptyBuild {
        /// Built node name.
        node: String,
        /// Requested key.
        key: Key,
    },

    /// A builder finished without responding.
    #[error("build of {node} for key {key} finished without a response")]
    MissingResponse {
        /// Built node name.
        node: String,
        /// Requested key.
        key: Key,
    },

    /// A builder responded more than once, or for another key.
    #[error("build of {node} for key {key} produced an unexpected response")]
    UnexpectedResponse {
        /// Built node name.
        node: String,
        /// Requested key.
        key: Key,
    },

    /// The key cannot be served by this node.
    #[error("node {node} cannot be built for key {key}: {reason}")]
    InvalidKey {
        /// Built node name.
        node: String,
        /// Offending key.
        key: Key,
        /// Why.
        reason: String,
    },

    /// The context already committed or aborted.
    #[error("context is {0:?}")]
    ContextClosed(ContextState),

    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DriverError {
    /// Whether the failed operation may succeed if retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(err) => err.is_retryable(),
            _ => false,
        }
    }

    pub(crate) fn invalid_key(node: &str, key: &Key, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            node: node.to_string(),
            key: key.clone(),
            reason: reason.into(),
        }
    }
}

/// Display name of `node`, falling back to its id.
pub(crate) fn node_name(plan: &crate::plan::Plan, node: NodeId) -> String {
    plan.node(node)
        .map_or_else(|| node.to_string(), |n| n.name().to_string())
}
