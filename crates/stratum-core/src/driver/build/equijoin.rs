//! Inner equality joins.

use std::sync::Arc;

use fxhash::FxHashMap;

use crate::plan::{EquijoinNode, Fields, NodeId, PNode};
use crate::types::{Id, Key, Value};

use super::super::error::DriverError;
use super::super::lineage::LineagePolicy;
use super::super::ops::{OpResult, Ops};
use super::super::row::{attrs, DriverRow};
use super::{check_key, composite_id, merge_values, present, respond, restrict_key, retain_matching, values_at, Builder};

struct Branch {
    source: NodeId,
    fields: Fields,
    join_names: Vec<String>,
    join_positions: Vec<usize>,
}

/// Builds an equijoin by requesting every branch in one op and hash-joining
/// the responses. A key bound on one branch's join field is propagated to
/// the matching join field of every other branch.
pub struct EquijoinBuilder {
    node: NodeId,
    name: String,
    fields: Fields,
    branches: Vec<Branch>,
    lineage: Arc<LineagePolicy>,
}

impl EquijoinBuilder {
    /// Creates the builder for `node` over `inputs`, in branch order.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Plan`] if a join field is missing.
    pub fn new(
        node: &PNode,
        join: &EquijoinNode,
        inputs: &[&PNode],
        lineage: Arc<LineagePolicy>,
    ) -> Result<Self, DriverError> {
        let branches = join
            .branches
            .iter()
            .zip(inputs)
            .map(|(branch, input)| {
                Ok(Branch {
                    source: input.id(),
                    fields: input.fields().clone(),
                    join_names: branch.fields.clone(),
                    join_positions: input.fields().positions_of(node.name(), &branch.fields)?,
                })
            })
            .collect::<Result<Vec<_>, DriverError>>()?;
        Ok(Self {
            node: node.id(),
            name: node.name().to_string(),
            fields: node.fields().clone(),
            branches,
            lineage,
        })
    }

    /// Key of each branch: its own fields, plus join values bound anywhere.
    fn branch_keys(&self, key: &Key) -> Vec<Key> {
        let width = self.branches.first().map_or(0, |b| b.join_names.len());
        let bound: Vec<Option<Value>> = (0..width)
            .map(|i| {
                self.branches
                    .iter()
                    .find_map(|b| key.get(&b.join_names[i]).cloned())
            })
            .collect();
        self.branches
            .iter()
            .map(|branch| {
                let own = restrict_key(key, &branch.fields);
                Key::of(
                    own.fields()
                        .map(|(f, v)| (f.to_string(), v.clone()))
                        .chain(
                            branch
                                .join_names
                                .iter()
                                .zip(&bound)
                                .filter_map(|(f, v)| Some((f.clone(), v.clone()?))),
                        ),
                )
            })
            .collect()
    }

    fn join(&self, results: &[Vec<DriverRow>]) -> Vec<DriverRow> {
        let Some((first, rest)) = results.split_first() else {
            return Vec::new();
        };
        let mut partials: Vec<(Id, Vec<&DriverRow>)> = present(first)
            .filter_map(|row| Some((join_id(row, &self.branches[0])?, vec![row])))
            .collect();
        for (branch, rows) in self.branches[1..].iter().zip(rest) {
            let mut index: FxHashMap<Id, Vec<&DriverRow>> = FxHashMap::default();
            for row in present(rows) {
                if let Some(id) = join_id(row, branch) {
                    index.entry(id).or_default().push(row);
                }
            }
            partials = partials
                .into_iter()
                .flat_map(|(id, parts)| {
                    index
                        .get(&id)
                        .into_iter()
                        .flatten()
                        .copied()
                        .map(move |row| {
                            let mut parts = parts.clone();
                            parts.push(row);
                            (id.clone(), parts)
                        })
                        .collect::<Vec<_>>()
                })
                .collect();
        }
        partials
            .into_iter()
            .map(|(_, parts)| {
                let merged: Vec<(&Fields, Option<&DriverRow>)> = self
                    .branches
                    .iter()
                    .zip(&parts)
                    .map(|(b, row)| (&b.fields, Some(*row)))
                    .collect();
                DriverRow::new(
                    self.node,
                    Some(composite_id(parts.iter().copied())),
                    attrs(merge_values(&self.fields, &merged)),
                    self.lineage.derive(parts.iter().copied()),
                )
            })
            .collect()
    }
}

/// Join values of `row` as an id; rows with a null join value never match.
fn join_id(row: &DriverRow, branch: &Branch) -> Option<Id> {
    let values = values_at(row, &branch.join_positions)?;
    if values.iter().any(Value::is_null) {
        return None;
    }
    Some(Id::from_values(&values))
}

impl Builder for EquijoinBuilder {
    fn node(&self) -> NodeId {
        self.node
    }

    fn build<'a>(&'a self, key: &Key, ops: &mut Ops<'a>) -> OpResult {
        check_key(&self.name, &self.fields, key)?;
        let requests = self
            .branches
            .iter()
            .zip(self.branch_keys(key))
            .map(|(b, k)| (b.source, k))
            .collect();
        let key = key.clone();
        ops.request(self.node, requests, move |results, ops| {
            let mut rows = self.join(&results);
            retain_matching(&mut rows, &self.fields, &key);
            respond(ops, self.node, key, rows);
            Ok(())
        });
        Ok(())
    }
}
