//! Lineage capture: which upstream rows produced a row.

use std::sync::Arc;

use fxhash::FxHashSet;

use crate::plan::{NodeId, Plan};
use crate::types::Id;

use super::row::DriverRow;

/// Shape of recorded lineage entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineageGranularity {
    /// `(node, id)` pairs; rows without ids are not recorded.
    #[default]
    Id,
    /// Full row snapshots.
    Row,
}

/// How much transitive lineage a row keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineageRetention {
    /// None.
    Nop,
    /// Only the nearest stateful ancestors.
    #[default]
    Minimal,
    /// Nearest stateful ancestors plus the direct stateless inputs.
    Cascade,
    /// Every transitive ancestor.
    Full,
}

/// One upstream row.
#[derive(Debug, Clone)]
pub enum LineageEntry {
    /// Identity only.
    Id {
        /// Upstream node.
        node: NodeId,
        /// Upstream row id.
        id: Id,
    },
    /// Full snapshot.
    Row(Arc<DriverRow>),
}

impl LineageEntry {
    /// Upstream node.
    #[must_use]
    pub fn node(&self) -> NodeId {
        match self {
            Self::Id { node, .. } => *node,
            Self::Row(row) => row.node(),
        }
    }

    /// Upstream row id, if it has one.
    #[must_use]
    pub fn id(&self) -> Option<&Id> {
        match self {
            Self::Id { id, .. } => Some(id),
            Self::Row(row) => row.id(),
        }
    }
}

/// Ordered, deduplicated set of lineage entries.
#[derive(Debug, Clone, Default)]
pub struct Lineage {
    entries: Vec<LineageEntry>,
    seen: FxHashSet<(NodeId, Id)>,
}

impl Lineage {
    /// Adds an entry unless one with the same `(node, id)` is present.
    /// Id-less row snapshots are always added.
    pub fn push(&mut self, entry: LineageEntry) {
        if let Some(id) = entry.id() {
            if !self.seen.insert((entry.node(), id.clone())) {
                return;
            }
        }
        self.entries.push(entry);
    }

    /// Adds every entry of `other`.
    pub fn extend(&mut self, other: &Lineage) {
        for entry in &other.entries {
            self.push(entry.clone());
        }
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, LineageEntry> {
        self.entries.iter()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True without entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `(node, id)` is recorded.
    #[must_use]
    pub fn contains(&self, node: NodeId, id: &Id) -> bool {
        self.entries
            .iter()
            .any(|e| e.node() == node && e.id() == Some(id))
    }
}

impl<'a> IntoIterator for &'a Lineage {
    type Item = &'a LineageEntry;
    type IntoIter = std::slice::Iter<'a, LineageEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Computes the lineage of derived rows from their input rows.
#[derive(Debug, Clone)]
pub struct LineagePolicy {
    granularity: LineageGranularity,
    retention: LineageRetention,
    stateful: FxHashSet<NodeId>,
}

impl LineagePolicy {
    /// Policy over the stateful nodes of `plan`.
    #[must_use]
    pub fn new(plan: &Plan, granularity: LineageGranularity, retention: LineageRetention) -> Self {
        Self {
            granularity,
            retention,
            stateful: plan.stateful_nodes().map(|n| n.id()).collect(),
        }
    }

    /// Lineage of a row derived from `inputs`.
    pub fn derive<'r>(&self, inputs: impl IntoIterator<Item = &'r DriverRow>) -> Lineage {
        let mut lineage = Lineage::default();
        for row in inputs {
            let stateful = self.stateful.contains(&row.node());
            match self.retention {
                LineageRetention::Nop => {}
                LineageRetention::Minimal => {
                    if stateful {
                        self.record(&mut lineage, row);
                    } else {
                        lineage.extend(row.lineage());
                    }
                }
                LineageRetention::Cascade => {
                    self.record(&mut lineage, row);
                    if !stateful {
                        lineage.extend(row.lineage());
                    }
                }
                LineageRetention::Full => {
                    self.record(&mut lineage, row);
                    lineage.extend(row.lineage());
                }
            }
        }
        lineage
    }

    fn record(&self, lineage: &mut Lineage, row: &DriverRow) {
        match self.granularity {
            LineageGranularity::Id => {
                if let Some(id) = row.id() {
                    lineage.push(LineageEntry::Id {
                        node: row.node(),
                        id: id.clone(),
                    });
                }
            }
            LineageGranularity::Row => lineage.push(LineageEntry::Row(Arc::new(row.clone()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Function, PlanBuilder};
    use crate::types::{Field, FieldType, Value};

    fn plan() -> Plan {
        PlanBuilder::new()
            .scan("scan", "t", vec![Field::new("id", FieldType::Long)], &["id"])
            .filter(
                "filter",
                "scan",
                Function::new("t", FieldType::Boolean, |_| Value::Boolean(true)),
                &[],
            )
            .persist("persist", "filter", &["id"])
            .build("persist")
            .unwrap()
    }

    fn rows() -> (DriverRow, DriverRow) {
        let id = Id::from_values(&[1.into()]);
        let scan = DriverRow::new(NodeId::from_name("scan"), Some(id.clone()), None, Lineage::default());
        let policy = LineagePolicy::new(&plan(), LineageGranularity::Id, LineageRetention::Minimal);
        let filter = DriverRow::new(
            NodeId::from_name("filter"),
            Some(id),
            None,
            policy.derive([&scan]),
        );
        (scan, filter)
    }

    #[test]
    fn test_minimal_skips_stateless_rows() {
        let (_, filter) = rows();
        let policy = LineagePolicy::new(&plan(), LineageGranularity::Id, LineageRetention::Minimal);
        let lineage = policy.derive([&filter]);
        assert_eq!(lineage.len(), 1);
        assert!(lineage.contains(NodeId::from_name("scan"), &Id::from_values(&[1.into()])));
    }

    #[test]
    fn test_cascade_keeps_direct_inputs() {
        let (_, filter) = rows();
        let policy = LineagePolicy::new(&plan(), LineageGranularity::Id, LineageRetention::Cascade);
        let lineage = policy.derive([&filter]);
        let nodes: Vec<NodeId> = lineage.iter().map(LineageEntry::node).collect();
        assert_eq!(nodes, vec![NodeId::from_name("filter"), NodeId::from_name("scan")]);
    }

    #[test]
    fn test_nop_records_nothing() {
        let (scan, filter) = rows();
        let policy = LineagePolicy::new(&plan(), LineageGranularity::Id, LineageRetention::Nop);
        assert!(policy.derive([&scan, &filter]).is_empty());
    }

    #[test]
    fn test_row_granularity_keeps_idless_rows() {
        let row = DriverRow::null(NodeId::from_name("scan"), None);
        let policy = LineagePolicy::new(&plan(), LineageGranularity::Row, LineageRetention::Full);
        let lineage = policy.derive([&row, &row]);
        assert_eq!(lineage.len(), 2);

        let id_policy = LineagePolicy::new(&plan(), LineageGranularity::Id, LineageRetention::Full);
        assert!(id_policy.derive([&row]).is_empty());
    }
}
