//! Optional per-context record of build activity, for diagnostics.

use std::fmt;

use crate::plan::NodeId;
use crate::types::Key;

/// One journal record.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalEntry {
    /// A build was requested.
    BuildInput {
        /// Built node.
        node: NodeId,
        /// Requested key.
        key: Key,
    },
    /// A builder issued an op.
    BuildOp {
        /// Issuing node.
        origin: NodeId,
        /// Op kind, as in [`BuildOp::kind_name`](super::BuildOp::kind_name).
        kind: &'static str,
    },
    /// A build completed.
    BuildOutput {
        /// Built node.
        node: NodeId,
        /// Requested key.
        key: Key,
        /// Rows produced.
        rows: usize,
    },
}

impl fmt::Display for JournalEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BuildInput { node, key } => write!(f, "input {node} {key}"),
            Self::BuildOp { origin, kind } => write!(f, "op {origin} {kind}"),
            Self::BuildOutput { node, key, rows } => write!(f, "output {node} {key} rows={rows}"),
        }
    }
}

/// Append-only build journal.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    /// Appends an entry.
    pub fn record(&mut self, entry: JournalEntry) {
        self.entries.push(entry);
    }

    /// Entries in recording order.
    #[must_use]
    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
