//! Durable backing for per-row state.
//!
//! The execution core only talks to [`StateStorage`]. Snapshots carry an
//! optimistic version; a put whose version does not match the stored one is
//! rejected, which is how concurrent contexts stay consistent.

mod heap;

use std::ops::Bound;

use bytes::Bytes;

use crate::plan::NodeId;
use crate::types::Id;

pub use heap::HeapStateStorage;

/// Durable snapshot of one state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageState {
    /// Owning node.
    pub node: NodeId,
    /// Row id.
    pub id: Id,
    /// Optimistic version; 0 for entries never written.
    pub version: u64,
    /// Placeholder allocated but never written.
    pub created: bool,
    /// Stored as stale.
    pub invalid: bool,
    /// Encoded attribute row; `None` for a row with no attributes.
    pub attributes: Option<Bytes>,
    /// Encoded linkage.
    pub linkage: Option<Bytes>,
}

impl StorageState {
    /// A created placeholder for `(node, id)`.
    #[must_use]
    pub fn created(node: NodeId, id: Id) -> Self {
        Self {
            node,
            id,
            version: 0,
            created: true,
            invalid: false,
            attributes: None,
            linkage: None,
        }
    }
}

/// Options for [`StateStorage::get`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageGetFlags {
    /// Return created placeholders for ids that are not stored.
    pub create: bool,
}

/// A contiguous range of ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    /// Lower bound.
    pub lower: Bound<Id>,
    /// Upper bound.
    pub upper: Bound<Id>,
}

impl Span {
    /// Every id.
    #[must_use]
    pub fn all() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    /// Ids in `[lower, upper)`.
    #[must_use]
    pub fn half_open(lower: Id, upper: Id) -> Self {
        Self {
            lower: Bound::Included(lower),
            upper: Bound::Excluded(upper),
        }
    }

    /// Whether the span selects nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        use Bound::{Excluded, Included};
        match (&self.lower, &self.upper) {
            (Included(l), Included(u)) => l > u,
            (Included(l) | Excluded(l), Excluded(u)) | (Excluded(l), Included(u)) => l >= u,
            _ => false,
        }
    }
}

/// Errors raised by a [`StateStorage`].
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A put without `create` named a state that is not stored.
    #[error("state not found: node {node}, id {id}")]
    NotFound {
        /// Node of the missing state.
        node: NodeId,
        /// Id of the missing state.
        id: Id,
    },

    /// The stored version moved since the state was loaded.
    #[error("version conflict on node {node}, id {id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// Node of the conflicting state.
        node: NodeId,
        /// Id of the conflicting state.
        id: Id,
        /// Version carried by the write.
        expected: u64,
        /// Version in storage.
        actual: u64,
    },

    /// The backend is temporarily unable to serve the request.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Whether retrying the same request may succeed.
    ///
    /// A [`StorageError::VersionConflict`] is final: the writer holds a stale
    /// snapshot and resending it cannot match the stored version. The work
    /// has to be redone from a fresh load.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Durable store of [`StorageState`] snapshots.
pub trait StateStorage: Send + Sync {
    /// Loads the stored snapshots of the given ids. Missing ids are omitted
    /// unless `flags.create` asks for placeholders.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend fails.
    fn get(&self, ids_by_node: &[(NodeId, Vec<Id>)], flags: StorageGetFlags) -> Result<Vec<StorageState>, StorageError>;

    /// Writes snapshots atomically. Without `create`, every state must
    /// already be stored or allocated.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on a version conflict, a missing state or a
    /// backend failure; nothing is written in that case.
    fn put(&self, states: &[StorageState], create: bool) -> Result<(), StorageError>;

    /// Reserves placeholders for ids that are not stored yet.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend fails.
    fn allocate(&self, node: NodeId, ids: &[Id]) -> Result<(), StorageError>;

    /// Stored ids of `node` within `span`, in id order, at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend fails.
    fn get_span_ids(&self, node: NodeId, span: &Span, limit: usize) -> Result<Vec<Id>, StorageError>;
}
