//! Cartesian products.

use std::sync::Arc;

use crate::plan::{CrossJoinMode, CrossJoinNode, Fields, NodeId, PNode};
use crate::types::{Id, Key, Value};

use super::super::lineage::LineagePolicy;
use super::super::ops::{OpResult, Ops};
use super::super::row::{attrs, DriverRow};
use super::{check_key, merge_values, present, respond, restrict_key, Builder};

/// Builds a cross join. Each source receives the part of the key over its
/// own fields.
pub struct CrossJoinBuilder {
    node: NodeId,
    name: String,
    fields: Fields,
    sources: Vec<(NodeId, Fields)>,
    mode: CrossJoinMode,
    lineage: Arc<LineagePolicy>,
}

impl CrossJoinBuilder {
    /// Creates the builder for `node` over `inputs`.
    #[must_use]
    pub fn new(node: &PNode, join: &CrossJoinNode, inputs: &[&PNode], lineage: Arc<LineagePolicy>) -> Self {
        Self {
            node: node.id(),
            name: node.name().to_string(),
            fields: node.fields().clone(),
            sources: inputs.iter().map(|i| (i.id(), i.fields().clone())).collect(),
            mode: join.mode,
            lineage,
        }
    }

    fn product(&self, results: &[Vec<DriverRow>]) -> Vec<DriverRow> {
        let mut combos: Vec<Vec<Option<&DriverRow>>> = vec![Vec::new()];
        for rows in results {
            let mut choices: Vec<Option<&DriverRow>> = present(rows).map(Some).collect();
            if choices.is_empty() {
                match self.mode {
                    CrossJoinMode::Inner => return Vec::new(),
                    CrossJoinMode::Full => choices.push(None),
                }
            }
            combos = combos
                .into_iter()
                .flat_map(|combo| {
                    choices.iter().map(move |choice| {
                        let mut next = combo.clone();
                        next.push(*choice);
                        next
                    })
                })
                .collect();
        }
        combos
            .into_iter()
            .map(|combo| {
                let parts: Vec<(&Fields, Option<&DriverRow>)> = self
                    .sources
                    .iter()
                    .zip(&combo)
                    .map(|((_, fields), row)| (fields, *row))
                    .collect();
                let id: Vec<Value> = combo
                    .iter()
                    .map(|row| row.map_or(Value::Null, DriverRow::id_value))
                    .collect();
                DriverRow::new(
                    self.node,
                    Some(Id::from_values(&id)),
                    attrs(merge_values(&self.fields, &parts)),
                    self.lineage.derive(combo.iter().flatten().copied()),
                )
            })
            .collect()
    }
}

impl Builder for CrossJoinBuilder {
    fn node(&self) -> NodeId {
        self.node
    }

    fn build<'a>(&'a self, key: &Key, ops: &mut Ops<'a>) -> OpResult {
        check_key(&self.name, &self.fields, key)?;
        let requests = self
            .sources
            .iter()
            .map(|(id, fields)| (*id, restrict_key(key, fields)))
            .collect();
        let key = key.clone();
        ops.request(self.node, requests, move |results, ops| {
            respond(ops, self.node, key, self.product(&results));
            Ok(())
        });
        Ok(())
    }
}
