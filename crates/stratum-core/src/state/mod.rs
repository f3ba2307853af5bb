//! Per-row state of stateful plan nodes.
//!
//! A [`State`] is the cached result of one row of a scan or persist node,
//! identified by `(node, id)`. Its [`Mode`] decides whether the attributes
//! may be served or must be rebuilt first:
//!
//! ```text
//! Phantom ──┐
//!           ├──> Modified ──flush──> Exclusive / Shared
//! Invalid ──┘        │                    │
//!    ^               │                    │
//!    └───────────────┴────────────────────┘
//! ```

mod linkage;

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::plan::NodeId;
use crate::types::{Id, Value};

pub use linkage::Linkage;

/// Identity of a state: the owning stateful node and the row id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    /// Owning node.
    pub node: NodeId,
    /// Row id.
    pub id: Id,
}

impl StateKey {
    /// Creates a state key.
    #[must_use]
    pub fn new(node: NodeId, id: Id) -> Self {
        Self { node, id }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.id)
    }
}

/// Lifecycle mode of a [`State`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Allocated in memory, never computed or confirmed against storage.
    Phantom,
    /// Known stale; attributes must not be served.
    Invalid,
    /// Recomputed in this transaction, not yet durable.
    Modified,
    /// Clean, loaded for shared use.
    Shared,
    /// Clean, owned by this context.
    Exclusive,
}

impl Mode {
    /// Whether attributes in this mode may be served.
    #[must_use]
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Modified | Self::Shared | Self::Exclusive)
    }

    /// Whether a state in this mode must be built before use.
    #[must_use]
    pub fn needs_build(self) -> bool {
        matches!(self, Self::Phantom | Self::Invalid)
    }

    fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Phantom | Self::Invalid, Self::Modified)
                | (Self::Shared | Self::Exclusive | Self::Modified, Self::Invalid)
                | (Self::Modified, Self::Exclusive)
        )
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Phantom => "phantom",
            Self::Invalid => "invalid",
            Self::Modified => "modified",
            Self::Shared => "shared",
            Self::Exclusive => "exclusive",
        };
        f.write_str(s)
    }
}

/// Errors raised by illegal state use.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The requested mode change is not a legal transition.
    #[error("state {key}: illegal transition {from} -> {to}")]
    InvalidTransition {
        /// Affected state.
        key: StateKey,
        /// Current mode.
        from: Mode,
        /// Requested mode.
        to: Mode,
    },

    /// Attributes were read while the state must be rebuilt.
    #[error("state {key} is {mode} and cannot be used")]
    Unusable {
        /// Affected state.
        key: StateKey,
        /// Current mode.
        mode: Mode,
    },
}

/// Shared attribute row. `None` marks a row that exists with no attributes.
pub type Attributes = Option<Arc<[Value]>>;

/// Cached state of one row of a stateful node.
#[derive(Debug, Clone)]
pub struct State {
    key: StateKey,
    mode: Mode,
    version: u64,
    attributes: Attributes,
    prior: Attributes,
    updated: SmallVec<[usize; 8]>,
    linkage: Linkage,
}

impl State {
    /// A freshly allocated state with nothing computed.
    #[must_use]
    pub fn phantom(key: StateKey) -> Self {
        Self::restore(key, Mode::Phantom, 0, None, Linkage::default())
    }

    pub(crate) fn restore(key: StateKey, mode: Mode, version: u64, attributes: Attributes, linkage: Linkage) -> Self {
        Self {
            key,
            mode,
            version,
            attributes,
            prior: None,
            updated: SmallVec::new(),
            linkage,
        }
    }

    /// Identity.
    #[must_use]
    pub fn key(&self) -> &StateKey {
        &self.key
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Storage version this state was loaded at or last flushed as.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether attributes may be served.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.mode.is_usable()
    }

    /// Whether the state must be built before use.
    #[must_use]
    pub fn needs_build(&self) -> bool {
        self.mode.needs_build()
    }

    /// Attribute row, `None` for a row with no attributes.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Unusable`] in `Phantom` or `Invalid` mode.
    pub fn attributes(&self) -> Result<Option<&Arc<[Value]>>, StateError> {
        if self.mode.is_usable() {
            Ok(self.attributes.as_ref())
        } else {
            Err(StateError::Unusable {
                key: self.key.clone(),
                mode: self.mode,
            })
        }
    }

    /// Attributes regardless of mode, for persistence and invalidation.
    pub(crate) fn raw_attributes(&self) -> Option<&[Value]> {
        self.attributes.as_deref()
    }

    /// Attributes replaced by the last rebuild, until flushed.
    pub(crate) fn prior_attributes(&self) -> Option<&[Value]> {
        self.prior.as_deref()
    }

    /// Positions of fields changed by the last rebuild.
    #[must_use]
    pub fn updated_fields(&self) -> &[usize] {
        &self.updated
    }

    /// Local mirror of the lineage graph around this state.
    #[must_use]
    pub fn linkage(&self) -> &Linkage {
        &self.linkage
    }

    pub(crate) fn linkage_mut(&mut self) -> &mut Linkage {
        &mut self.linkage
    }

    fn transition(&mut self, to: Mode) -> Result<(), StateError> {
        if self.mode.can_become(to) {
            self.mode = to;
            Ok(())
        } else {
            Err(StateError::InvalidTransition {
                key: self.key.clone(),
                from: self.mode,
                to,
            })
        }
    }

    /// Stores rebuilt attributes and enters `Modified`, recording which
    /// fields changed. Only legal from `Phantom` or `Invalid`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidTransition`] for an already usable state.
    pub fn set_attributes(&mut self, attributes: Attributes) -> Result<(), StateError> {
        self.transition(Mode::Modified)?;
        self.updated = changed_fields(self.attributes.as_deref(), attributes.as_deref());
        let prior = std::mem::replace(&mut self.attributes, attributes);
        if self.prior.is_none() {
            self.prior = prior;
        }
        Ok(())
    }

    /// Marks the state stale. Returns false if it was already stale or never
    /// computed.
    ///
    /// # Errors
    ///
    /// Never in practice; kept fallible for transition checking.
    pub fn invalidate(&mut self) -> Result<bool, StateError> {
        if self.mode.needs_build() {
            return Ok(false);
        }
        self.transition(Mode::Invalid)?;
        Ok(true)
    }

    /// Records a successful durable write.
    pub(crate) fn mark_flushed(&mut self) -> Result<(), StateError> {
        self.version += 1;
        self.prior = None;
        self.updated.clear();
        if self.mode == Mode::Modified {
            self.transition(Mode::Exclusive)?;
        }
        Ok(())
    }
}

fn changed_fields(before: Option<&[Value]>, after: Option<&[Value]>) -> SmallVec<[usize; 8]> {
    match (before, after) {
        (Some(before), Some(after)) if before.len() == after.len() => before
            .iter()
            .zip(after)
            .enumerate()
            .filter(|(_, (b, a))| b != a)
            .map(|(i, _)| i)
            .collect(),
        (None, None) => SmallVec::new(),
        (Some(values), _) | (_, Some(values)) => (0..values.len()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> StateKey {
        StateKey::new(NodeId::from_name("n"), Id::from_values(&[1.into()]))
    }

    fn row(values: &[i64]) -> Attributes {
        Some(values.iter().map(|v| Value::Long(*v)).collect())
    }

    #[test]
    fn test_phantom_is_not_usable() {
        let state = State::phantom(key());
        assert!(state.needs_build());
        assert!(matches!(
            state.attributes(),
            Err(StateError::Unusable { mode: Mode::Phantom, .. })
        ));
    }

    #[test]
    fn test_rebuild_then_flush() {
        let mut state = State::phantom(key());
        state.set_attributes(row(&[1, 10])).unwrap();
        assert_eq!(state.mode(), Mode::Modified);
        assert_eq!(state.updated_fields(), &[0, 1]);

        state.mark_flushed().unwrap();
        assert_eq!(state.mode(), Mode::Exclusive);
        assert_eq!(state.version(), 1);
        assert!(state.updated_fields().is_empty());
    }

    #[test]
    fn test_usable_state_is_never_overwritten() {
        let mut state = State::phantom(key());
        state.set_attributes(row(&[1, 10])).unwrap();
        let err = state.set_attributes(row(&[1, 20])).unwrap_err();
        assert!(matches!(
            err,
            StateError::InvalidTransition {
                from: Mode::Modified,
                to: Mode::Modified,
                ..
            }
        ));
        assert_eq!(state.attributes().unwrap().unwrap()[1], Value::Long(10));
    }

    #[test]
    fn test_invalid_state_rebuild_tracks_changes() {
        let mut state = State::restore(key(), Mode::Exclusive, 3, row(&[1, 10]), Linkage::default());
        assert!(state.invalidate().unwrap());
        assert!(!state.invalidate().unwrap());
        assert!(state.attributes().is_err());

        state.set_attributes(row(&[1, 20])).unwrap();
        assert_eq!(state.updated_fields(), &[1]);
        assert_eq!(state.prior_attributes().unwrap()[1], Value::Long(10));
        assert_eq!(state.attributes().unwrap().unwrap()[1], Value::Long(20));
    }

    #[test]
    fn test_modified_can_be_invalidated() {
        let mut state = State::phantom(key());
        state.set_attributes(row(&[1])).unwrap();
        assert!(state.invalidate().unwrap());
        assert_eq!(state.mode(), Mode::Invalid);
    }
}
