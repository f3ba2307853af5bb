//! # Builder Module
//!
//! Per-operator build strategies.
//!
//! ## Protocol
//!
//! A [`Builder`] never calls another builder. It pushes
//! [`BuildOp`](super::BuildOp)s and is resumed through their callbacks:
//!
//! - **Leaf**: scan, values
//! - **Single input**: filter, project, unnest, list aggregate, persist
//! - **Multi input**: equijoin, cross join, lookup join, union
//!
//! Every build ends with exactly one response holding at least one row. A
//! request that matches nothing answers with a null-attribute row.

mod cross_join;
mod equijoin;
mod filter;
mod list_aggregate;
mod lookup_join;
mod persist;
mod project;
mod scan;
mod union;
mod unnest;
mod values;

use std::sync::Arc;

use fxhash::FxHashMap;

use crate::connector::Catalog;
use crate::plan::{Fields, NodeId, NodeKind, PNode, Plan};
use crate::types::{Id, Key, Value};

use super::error::DriverError;
use super::lineage::LineagePolicy;
use super::ops::{OpResult, Ops};
use super::row::DriverRow;

pub use cross_join::CrossJoinBuilder;
pub use equijoin::EquijoinBuilder;
pub use filter::FilterBuilder;
pub use list_aggregate::ListAggregateBuilder;
pub use lookup_join::LookupJoinBuilder;
pub use persist::PersistBuilder;
pub use project::ProjectBuilder;
pub use scan::ScanBuilder;
pub use union::UnionBuilder;
pub use unnest::UnnestBuilder;
pub use values::ValuesBuilder;

/// Execution strategy of one plan node.
pub trait Builder: Send + Sync {
    /// Node this builder produces rows for.
    fn node(&self) -> NodeId;

    /// Starts a build of the rows matching `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] if the key cannot be served.
    fn build<'a>(&'a self, key: &Key, ops: &mut Ops<'a>) -> OpResult;
}

/// Creates one builder per plan node.
///
/// # Errors
///
/// Returns [`DriverError::TableNotFound`] for a scan over an unbound table.
pub fn create_builders(
    plan: &Plan,
    catalog: &Catalog,
    lineage: &Arc<LineagePolicy>,
) -> Result<FxHashMap<NodeId, Box<dyn Builder>>, DriverError> {
    let mut builders: FxHashMap<NodeId, Box<dyn Builder>> = FxHashMap::default();
    for &id in plan.toposorted() {
        let node = plan.get(id)?;
        let inputs: Vec<&PNode> = node
            .sources()
            .iter()
            .map(|s| plan.get(*s))
            .collect::<Result<_, _>>()?;
        let lineage = Arc::clone(lineage);
        let builder: Box<dyn Builder> = match node.kind() {
            NodeKind::Scan(scan) => {
                let binding = catalog
                    .table(&scan.table)
                    .cloned()
                    .ok_or_else(|| DriverError::TableNotFound {
                        node: node.name().to_string(),
                        table: scan.table.clone(),
                    })?;
                Box::new(ScanBuilder::new(node, scan, binding)?)
            }
            NodeKind::Filter(filter) => Box::new(FilterBuilder::new(node, filter, inputs[0], lineage)?),
            NodeKind::Project(project) => Box::new(ProjectBuilder::new(node, project, inputs[0], lineage)?),
            NodeKind::Equijoin(join) => Box::new(EquijoinBuilder::new(node, join, &inputs, lineage)?),
            NodeKind::CrossJoin(join) => Box::new(CrossJoinBuilder::new(node, join, &inputs, lineage)),
            NodeKind::LookupJoin(join) => Box::new(LookupJoinBuilder::new(node, join, &inputs, lineage)?),
            NodeKind::Union(union) => Box::new(UnionBuilder::new(node, union, &inputs, lineage)),
            NodeKind::Unnest(unnest) => Box::new(UnnestBuilder::new(node, unnest, inputs[0], lineage)?),
            NodeKind::ListAggregate(agg) => Box::new(ListAggregateBuilder::new(node, agg, inputs[0], lineage)?),
            NodeKind::Values(values) => Box::new(ValuesBuilder::new(node, values)?),
            NodeKind::Persist(persist) => Box::new(PersistBuilder::new(node, persist, inputs[0], lineage)?),
        };
        builders.insert(id, builder);
    }
    Ok(builders)
}

/// Rejects keys over fields `fields` does not have.
fn check_key(name: &str, fields: &Fields, key: &Key) -> Result<(), DriverError> {
    match key.fields().find(|(f, _)| fields.position(f).is_none()) {
        Some((field, _)) => Err(DriverError::invalid_key(name, key, format!("unknown field {field}"))),
        None => Ok(()),
    }
}

/// The part of `key` over fields `fields` has.
fn restrict_key(key: &Key, fields: &Fields) -> Key {
    Key::of(
        key.fields()
            .filter(|(f, _)| fields.position(f).is_some())
            .map(|(f, v)| (f, v.clone())),
    )
}

/// Drops non-null rows that do not match `key`.
fn retain_matching(rows: &mut Vec<DriverRow>, fields: &Fields, key: &Key) {
    if key.is_all() {
        return;
    }
    rows.retain(|row| row.is_null() || key.matches(|f| row.get(fields, f)));
}

/// Answers with `rows`, or with one null row if there are none.
fn respond(ops: &mut Ops<'_>, node: NodeId, key: Key, mut rows: Vec<DriverRow>) {
    if rows.is_empty() {
        rows.push(DriverRow::null(node, None));
    }
    ops.respond(node, key, rows);
}

/// Non-null rows only.
fn present(rows: &[DriverRow]) -> impl Iterator<Item = &DriverRow> {
    rows.iter().filter(|r| !r.is_null())
}

/// Values of `positions`, or `None` if the row is null.
fn values_at(row: &DriverRow, positions: &[usize]) -> Option<Vec<Value>> {
    let attributes = row.attributes()?;
    positions.iter().map(|p| attributes.get(*p).cloned()).collect()
}

/// Id of a row combining `parts`.
fn composite_id<'r>(parts: impl IntoIterator<Item = &'r DriverRow>) -> Id {
    let values: Vec<Value> = parts.into_iter().map(DriverRow::id_value).collect();
    Id::from_values(&values)
}

/// Output row of a merged-schema operator: every output field takes its
/// value from the first non-null part that has the field.
fn merge_values(out: &Fields, parts: &[(&Fields, Option<&DriverRow>)]) -> Vec<Value> {
    out.iter()
        .map(|field| {
            parts
                .iter()
                .find_map(|(fields, row)| {
                    let row = (*row)?;
                    row.get(fields, &field.name)
                })
                .cloned()
                .unwrap_or(Value::Null)
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Drives a single builder against canned source responses.

    use fxhash::FxHashMap;

    use super::*;
    use crate::driver::ops::BuildOp;
    use crate::state::State;

    /// Source rows by `(node, key)`; missing entries answer a null row.
    #[derive(Default)]
    pub(crate) struct Harness {
        pub(crate) sources: FxHashMap<NodeId, Vec<(Key, Vec<DriverRow>)>>,
        pub(crate) states: FxHashMap<Id, State>,
        pub(crate) requests: Vec<(NodeId, Key)>,
    }

    impl Harness {
        pub(crate) fn source(mut self, node: NodeId, key: Key, rows: Vec<DriverRow>) -> Self {
            self.sources.entry(node).or_default().push((key, rows));
            self
        }

        fn answer(&mut self, node: NodeId, key: &Key) -> Vec<DriverRow> {
            self.requests.push((node, key.clone()));
            self.sources
                .get(&node)
                .and_then(|answers| answers.iter().find(|(k, _)| k == key))
                .map_or_else(|| vec![DriverRow::null(node, None)], |(_, rows)| rows.clone())
        }

        /// Runs `builder` to its response.
        pub(crate) fn run(&mut self, builder: &dyn Builder, key: &Key) -> Vec<DriverRow> {
            let mut ops = Ops::new();
            builder.build(key, &mut ops).unwrap();
            while let Some(op) = ops.pop() {
                match op {
                    BuildOp::Request(op) => {
                        let rows = op.requests.iter().map(|(n, k)| self.answer(*n, k)).collect();
                        (op.callback)(rows, &mut ops).unwrap();
                    }
                    BuildOp::GetState(op) => {
                        let states = op
                            .ids
                            .iter()
                            .filter_map(|id| self.states.get(id).map(|s| (id.clone(), s.clone())))
                            .collect();
                        (op.callback)(states, &mut ops).unwrap();
                    }
                    BuildOp::Scan(_) => panic!("scan ops need a connection"),
                    BuildOp::Response(op) => {
                        assert_eq!(op.origin, builder.node());
                        assert_eq!(&op.key, key);
                        assert!(ops.is_empty());
                        return op.rows;
                    }
                }
            }
            panic!("builder finished without a response");
        }
    }
}
