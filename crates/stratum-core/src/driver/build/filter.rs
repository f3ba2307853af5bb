//! Row predicates.

use std::sync::Arc;

use crate::plan::{Fields, FilterNode, Function, Linking, NodeId, PNode};
use crate::types::Key;

use super::super::error::DriverError;
use super::super::lineage::{Lineage, LineagePolicy};
use super::super::ops::{OpResult, Ops};
use super::super::row::DriverRow;
use super::{check_key, respond, values_at, Builder};

/// Builds a filter node. Rejected rows stay in the output as null rows
/// with their ids, so a stateful consumer sees the row disappear.
pub struct FilterBuilder {
    node: NodeId,
    name: String,
    source: NodeId,
    source_fields: Fields,
    predicate: Function,
    args: Vec<usize>,
    linking: Linking,
    lineage: Arc<LineagePolicy>,
}

impl FilterBuilder {
    /// Creates the builder for `node` reading `input`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Plan`] if an argument is not an input field.
    pub fn new(node: &PNode, filter: &FilterNode, input: &PNode, lineage: Arc<LineagePolicy>) -> Result<Self, DriverError> {
        Ok(Self {
            node: node.id(),
            name: node.name().to_string(),
            source: input.id(),
            source_fields: input.fields().clone(),
            predicate: filter.predicate.clone(),
            args: input.fields().positions_of(node.name(), &filter.args)?,
            linking: filter.linking,
            lineage,
        })
    }

    fn apply(&self, row: &DriverRow) -> DriverRow {
        let lineage = match self.linking {
            Linking::Linked => self.lineage.derive([row]),
            Linking::Unlinked => Lineage::default(),
        };
        let accepted = values_at(row, &self.args)
            .is_some_and(|args| self.predicate.invoke(&args).as_bool() == Some(true));
        let attributes = if accepted { row.shared_attributes() } else { None };
        DriverRow::new(self.node, row.id().cloned(), attributes, lineage)
    }
}

impl Builder for FilterBuilder {
    fn node(&self) -> NodeId {
        self.node
    }

    fn build<'a>(&'a self, key: &Key, ops: &mut Ops<'a>) -> OpResult {
        check_key(&self.name, &self.source_fields, key)?;
        let key = key.clone();
        ops.request(self.node, vec![(self.source, key.clone())], move |results, ops| {
            let rows = results
                .iter()
                .flatten()
                .map(|row| self.apply(row))
                .collect();
            respond(ops, self.node, key, rows);
            Ok(())
        });
        Ok(())
    }
}
