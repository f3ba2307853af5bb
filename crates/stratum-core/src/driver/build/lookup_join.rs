//! Left lookup joins.

use std::sync::Arc;

use crate::plan::{Fields, LookupJoinNode, NodeId, PNode};
use crate::types::{Id, Key, Value};

use super::super::error::DriverError;
use super::super::lineage::LineagePolicy;
use super::super::ops::{OpResult, Ops};
use super::super::row::{attrs, DriverRow};
use super::{check_key, merge_values, present, respond, restrict_key, retain_matching, Builder};

struct Branch {
    source: NodeId,
    fields: Fields,
    /// `(driving position, branch field)` pairs.
    pairs: Vec<(usize, String)>,
}

/// Builds a lookup join in two phases: the driving rows first, then one
/// keyed request per driving row and branch, all issued in a single op.
/// Driving rows without a match keep null branch fields.
pub struct LookupJoinBuilder {
    node: NodeId,
    name: String,
    fields: Fields,
    source: NodeId,
    source_fields: Fields,
    branches: Vec<Branch>,
    lineage: Arc<LineagePolicy>,
}

impl LookupJoinBuilder {
    /// Creates the builder for `node`; `inputs` holds the driving node
    /// followed by the branches.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Plan`] if a lookup field is missing.
    pub fn new(
        node: &PNode,
        join: &LookupJoinNode,
        inputs: &[&PNode],
        lineage: Arc<LineagePolicy>,
    ) -> Result<Self, DriverError> {
        let driving = inputs[0];
        let mut branches = Vec::with_capacity(join.branches.len());
        for (branch, input) in join.branches.iter().zip(&inputs[1..]) {
            let mut pairs = Vec::with_capacity(branch.fields.len());
            for (driving_field, branch_field) in &branch.fields {
                let pos = driving
                    .fields()
                    .positions_of(node.name(), std::slice::from_ref(driving_field))?[0];
                pairs.push((pos, branch_field.clone()));
            }
            branches.push(Branch {
                source: input.id(),
                fields: input.fields().clone(),
                pairs,
            });
        }
        Ok(Self {
            node: node.id(),
            name: node.name().to_string(),
            fields: node.fields().clone(),
            source: driving.id(),
            source_fields: driving.fields().clone(),
            branches,
            lineage,
        })
    }

    /// Lookup key of `branch` for a driving row; `None` if any lookup value
    /// is null.
    fn branch_key(row: &DriverRow, branch: &Branch) -> Option<Key> {
        let attributes = row.attributes()?;
        let mut pairs = Vec::with_capacity(branch.pairs.len());
        for (pos, field) in &branch.pairs {
            let value = attributes.get(*pos)?;
            if value.is_null() {
                return None;
            }
            pairs.push((field.clone(), value.clone()));
        }
        Some(Key::of(pairs))
    }

    fn assemble(&self, driving: &[DriverRow], slots: &[Vec<Option<usize>>], results: &[Vec<DriverRow>]) -> Vec<DriverRow> {
        let mut out = Vec::new();
        for (row, row_slots) in driving.iter().zip(slots) {
            let mut combos: Vec<Vec<Option<&DriverRow>>> = vec![vec![Some(row)]];
            for slot in row_slots {
                let mut matches: Vec<Option<&DriverRow>> = slot
                    .map(|r| present(&results[r]).map(Some).collect())
                    .unwrap_or_default();
                if matches.is_empty() {
                    matches.push(None);
                }
                combos = combos
                    .into_iter()
                    .flat_map(|combo| {
                        matches.iter().map(move |m| {
                            let mut next = combo.clone();
                            next.push(*m);
                            next
                        })
                    })
                    .collect();
            }
            for combo in combos {
                let parts: Vec<(&Fields, Option<&DriverRow>)> = std::iter::once(&self.source_fields)
                    .chain(self.branches.iter().map(|b| &b.fields))
                    .zip(combo.iter().copied())
                    .collect();
                let id: Vec<Value> = combo
                    .iter()
                    .map(|part| part.map_or(Value::Null, DriverRow::id_value))
                    .collect();
                out.push(DriverRow::new(
                    self.node,
                    Some(Id::from_values(&id)),
                    attrs(merge_values(&self.fields, &parts)),
                    self.lineage.derive(combo.iter().flatten().copied()),
                ));
            }
        }
        out
    }
}

impl Builder for LookupJoinBuilder {
    fn node(&self) -> NodeId {
        self.node
    }

    fn build<'a>(&'a self, key: &Key, ops: &mut Ops<'a>) -> OpResult {
        check_key(&self.name, &self.fields, key)?;
        let key = key.clone();
        let driving_key = restrict_key(&key, &self.source_fields);
        ops.request(self.node, vec![(self.source, driving_key)], move |results, ops| {
            let driving: Vec<DriverRow> = results
                .into_iter()
                .flatten()
                .filter(|row| !row.is_null())
                .collect();
            let mut requests = Vec::new();
            let slots: Vec<Vec<Option<usize>>> = driving
                .iter()
                .map(|row| {
                    self.branches
                        .iter()
                        .map(|branch| {
                            let lookup = Self::branch_key(row, branch)?;
                            requests.push((branch.source, lookup));
                            Some(requests.len() - 1)
                        })
                        .collect()
                })
                .collect();

            if requests.is_empty() {
                let mut rows = self.assemble(&driving, &slots, &[]);
                retain_matching(&mut rows, &self.fields, &key);
                respond(ops, self.node, key, rows);
                return Ok(());
            }
            ops.request(self.node, requests, move |branch_results, ops| {
                let mut rows = self.assemble(&driving, &slots, &branch_results);
                retain_matching(&mut rows, &self.fields, &key);
                respond(ops, self.node, key, rows);
                Ok(())
            });
            Ok(())
        });
        Ok(())
    }
}
