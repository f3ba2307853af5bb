//! Grouping into lists.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::plan::{Fields, ListAggregateNode, NodeId, PNode};
use crate::types::{Id, Key, Value};

use super::super::error::DriverError;
use super::super::lineage::LineagePolicy;
use super::super::ops::{OpResult, Ops};
use super::super::row::{attrs, DriverRow};
use super::{check_key, present, respond, Builder};

/// Builds a list aggregate: one row per distinct group value, holding the
/// other fields of each member row as a struct. Groups are emitted in id
/// order.
pub struct ListAggregateBuilder {
    node: NodeId,
    name: String,
    fields: Fields,
    source: NodeId,
    list_field: String,
    group_position: usize,
    lineage: Arc<LineagePolicy>,
}

impl ListAggregateBuilder {
    /// Creates the builder for `node` reading `input`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Plan`] if the group field is missing.
    pub fn new(
        node: &PNode,
        agg: &ListAggregateNode,
        input: &PNode,
        lineage: Arc<LineagePolicy>,
    ) -> Result<Self, DriverError> {
        Ok(Self {
            node: node.id(),
            name: node.name().to_string(),
            fields: node.fields().clone(),
            source: input.id(),
            list_field: agg.list_field.clone(),
            group_position: input
                .fields()
                .positions_of(node.name(), std::slice::from_ref(&agg.group_field))?[0],
            lineage,
        })
    }

    fn aggregate(&self, rows: &[DriverRow]) -> Vec<DriverRow> {
        let mut groups: BTreeMap<Id, (Value, Vec<&DriverRow>)> = BTreeMap::new();
        for row in present(rows) {
            let Some(group) = row.attributes().and_then(|a| a.get(self.group_position)) else {
                continue;
            };
            groups
                .entry(Id::from_values(std::slice::from_ref(group)))
                .or_insert_with(|| (group.clone(), Vec::new()))
                .1
                .push(row);
        }
        groups
            .into_iter()
            .map(|(id, (group, members))| {
                let list = members
                    .iter()
                    .filter_map(|row| row.attributes())
                    .map(|values| {
                        Value::Struct(
                            values
                                .iter()
                                .enumerate()
                                .filter(|(p, _)| *p != self.group_position)
                                .map(|(_, v)| v.clone())
                                .collect(),
                        )
                    })
                    .collect();
                DriverRow::new(
                    self.node,
                    Some(id),
                    attrs(vec![group, Value::List(list)]),
                    self.lineage.derive(members.iter().copied()),
                )
            })
            .collect()
    }
}

impl Builder for ListAggregateBuilder {
    fn node(&self) -> NodeId {
        self.node
    }

    fn build<'a>(&'a self, key: &Key, ops: &mut Ops<'a>) -> OpResult {
        check_key(&self.name, &self.fields, key)?;
        if key.get(&self.list_field).is_some() {
            return Err(DriverError::invalid_key(&self.name, key, "cannot build by the aggregated list"));
        }
        let key = key.clone();
        ops.request(self.node, vec![(self.source, key.clone())], move |results, ops| {
            let rows = results.first().map(|rows| self.aggregate(rows)).unwrap_or_default();
            respond(ops, self.node, key, rows);
            Ok(())
        });
        Ok(())
    }
}
