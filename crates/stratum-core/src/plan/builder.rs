//! Fluent plan construction.
//!
//! Nodes are declared by name and reference their sources by name, so the
//! builder can detect unknown references, duplicates and cycles before any
//! schema is resolved.

use std::collections::BTreeMap;

use fxhash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::debug;

use crate::types::{Field, FieldType, Value};

use super::error::PlanError;
use super::field::Fields;
use super::function::Function;
use super::graph::Plan;
use super::node::{
    FilterNode, Invalidation, Linking, NodeId, NodeKind, PNode, PersistNode, ProjectNode, Projected,
    ScanNode,
};
use super::toposort::toposort;

/// Fluent builder for [`Plan`]s.
///
/// # Example
///
/// ```rust,ignore
/// let plan = PlanBuilder::new()
///     .scan("orders", "orders", fields, &["order_id"])
///     .filter("open", "orders", is_open, &["status"])
///     .persist("open_orders", "open", &["order_id"])
///     .build("open_orders")?;
/// ```
#[derive(Debug, Default)]
pub struct PlanBuilder {
    nodes: Vec<(String, NodeKind)>,
    name_index: FxHashMap<String, usize>,
    duplicate: Option<String>,
}

impl PlanBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node of any kind.
    #[must_use]
    pub fn node(mut self, name: &str, kind: NodeKind) -> Self {
        let idx = self.nodes.len();
        if self.name_index.insert(name.to_string(), idx).is_some() && self.duplicate.is_none() {
            self.duplicate = Some(name.to_string());
        }
        self.nodes.push((name.to_string(), kind));
        self
    }

    /// Adds a scan of catalog table `table`.
    #[must_use]
    pub fn scan(self, name: &str, table: &str, fields: Vec<Field>, id_fields: &[&str]) -> Self {
        self.node(
            name,
            NodeKind::Scan(ScanNode {
                table: table.to_string(),
                fields,
                id_fields: id_fields.iter().map(ToString::to_string).collect(),
                invalidations: Vec::new(),
            }),
        )
    }

    /// Adds a linked filter.
    #[must_use]
    pub fn filter(self, name: &str, source: &str, predicate: Function, args: &[&str]) -> Self {
        self.node(
            name,
            NodeKind::Filter(FilterNode {
                source: source.to_string(),
                predicate,
                args: args.iter().map(ToString::to_string).collect(),
                linking: Linking::Linked,
            }),
        )
    }

    /// Adds a projection.
    #[must_use]
    pub fn project(self, name: &str, source: &str, projections: Vec<(&str, Projected)>) -> Self {
        self.node(
            name,
            NodeKind::Project(ProjectNode {
                source: source.to_string(),
                projections: projections
                    .into_iter()
                    .map(|(n, p)| (n.to_string(), p))
                    .collect(),
            }),
        )
    }

    /// Adds a persist node.
    #[must_use]
    pub fn persist(self, name: &str, source: &str, id_fields: &[&str]) -> Self {
        self.persist_with(name, source, id_fields, Vec::new())
    }

    /// Adds a persist node with declared invalidation edges.
    #[must_use]
    pub fn persist_with(
        self,
        name: &str,
        source: &str,
        id_fields: &[&str],
        invalidations: Vec<Invalidation>,
    ) -> Self {
        self.node(
            name,
            NodeKind::Persist(PersistNode {
                source: source.to_string(),
                id_fields: id_fields.iter().map(ToString::to_string).collect(),
                invalidations,
            }),
        )
    }

    /// Resolves every node reachable from `root` into an immutable [`Plan`].
    ///
    /// # Errors
    ///
    /// Returns [`PlanError`] on duplicate names or ids, unknown nodes or
    /// fields, cycles, or inconsistent operator parameters.
    pub fn build(self, root: &str) -> Result<Plan, PlanError> {
        if let Some(name) = self.duplicate {
            return Err(PlanError::DuplicateNodeName(name));
        }
        let mut defs: FxHashMap<String, NodeKind> = self.nodes.into_iter().collect();

        // Reachability walk from the root.
        let mut reachable: Vec<String> = Vec::new();
        let mut seen: FxHashSet<String> = FxHashSet::default();
        let mut stack = vec![root.to_string()];
        while let Some(name) = stack.pop() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let kind = defs
                .get(&name)
                .ok_or_else(|| PlanError::NodeNotFound(name.clone()))?;
            stack.extend(kind.source_names().into_iter().map(str::to_string));
            reachable.push(name);
        }
        if defs.len() > reachable.len() {
            debug!(
                dropped = defs.len() - reachable.len(),
                root, "ignoring nodes unreachable from root"
            );
        }

        let mut names_by_id: FxHashMap<NodeId, String> = FxHashMap::default();
        for name in &reachable {
            let id = NodeId::from_name(name);
            if let Some(first) = names_by_id.insert(id, name.clone()) {
                return Err(PlanError::DuplicateNodeId {
                    id: id.0,
                    first,
                    second: name.clone(),
                });
            }
        }

        let dependencies: FxHashMap<NodeId, FxHashSet<NodeId>> = reachable
            .iter()
            .map(|name| {
                let sources = defs[name]
                    .source_names()
                    .into_iter()
                    .map(NodeId::from_name)
                    .collect();
                (NodeId::from_name(name), sources)
            })
            .collect();
        let self_loops: FxHashMap<NodeId, FxHashSet<NodeId>> = dependencies
            .iter()
            .filter(|(id, sources)| sources.contains(*id))
            .map(|(id, _)| (*id, std::iter::once(*id).collect()))
            .collect();
        if !self_loops.is_empty() {
            return Err(PlanError::CycleDetected {
                residual: residual_by_name(&self_loops, &names_by_id),
            });
        }
        let waves = toposort(&dependencies).map_err(|err| PlanError::CycleDetected {
            residual: residual_by_name(&err.residual, &names_by_id),
        })?;

        let mut name_sorted = reachable;
        name_sorted.sort_unstable();
        let name_index: FxHashMap<NodeId, usize> = name_sorted
            .iter()
            .enumerate()
            .map(|(i, name)| (NodeId::from_name(name), i))
            .collect();
        let waves: Vec<Vec<NodeId>> = waves
            .into_iter()
            .map(|mut wave| {
                wave.sort_unstable_by_key(|id| name_index[id]);
                wave
            })
            .collect();

        let mut resolved: FxHashMap<NodeId, PNode> = FxHashMap::default();
        for id in waves.iter().flatten() {
            let name = names_by_id[id].clone();
            let Some(kind) = defs.remove(&name) else {
                return Err(PlanError::NodeNotFound(name));
            };
            let sources: SmallVec<[NodeId; 4]> = kind
                .source_names()
                .into_iter()
                .map(NodeId::from_name)
                .collect();
            let inputs: Vec<&PNode> = sources.iter().map(|s| &resolved[s]).collect();
            let fields = resolve_fields(&name, &kind, &inputs)?;
            resolved.insert(
                *id,
                PNode {
                    id: *id,
                    name,
                    sources,
                    fields,
                    kind,
                },
            );
        }

        Plan::new(NodeId::from_name(root), resolved, &name_sorted, waves)
    }
}

pub(crate) fn residual_by_name(
    residual: &FxHashMap<NodeId, FxHashSet<NodeId>>,
    names: &FxHashMap<NodeId, String>,
) -> BTreeMap<String, Vec<String>> {
    let name_of = |id: &NodeId| names.get(id).cloned().unwrap_or_else(|| id.to_string());
    residual
        .iter()
        .map(|(node, deps)| {
            let mut deps: Vec<String> = deps.iter().map(name_of).collect();
            deps.sort_unstable();
            (name_of(node), deps)
        })
        .collect()
}

fn resolve_fields(name: &str, kind: &NodeKind, inputs: &[&PNode]) -> Result<Fields, PlanError> {
    let fields = match kind {
        NodeKind::Scan(n) => {
            let fields = Fields::new(name, n.fields.clone())?;
            require_id_fields(name, &fields, &n.id_fields)?;
            return Ok(fields);
        }
        NodeKind::Values(n) => {
            let fields = Fields::new(name, n.fields.clone())?;
            if let Some(id_field) = &n.id_field {
                fields.positions_of(name, std::slice::from_ref(id_field))?;
            }
            for row in &n.rows {
                check_row(name, &fields, row)?;
            }
            return Ok(fields);
        }
        NodeKind::Filter(n) => {
            let src = &inputs[0].fields;
            src.positions_of(name, &n.args)?;
            if *n.predicate.return_type() != FieldType::Boolean {
                return Err(PlanError::invalid(name, "filter predicate must return boolean"));
            }
            src.as_vec().to_vec()
        }
        NodeKind::Project(n) => {
            if n.projections.is_empty() {
                return Err(PlanError::invalid(name, "projection is empty"));
            }
            let src = &inputs[0].fields;
            let mut out = Vec::with_capacity(n.projections.len());
            for (out_name, projected) in &n.projections {
                let ty = match projected {
                    Projected::Field(field) => src
                        .type_of(field)
                        .cloned()
                        .ok_or_else(|| PlanError::unknown_field(name, field))?,
                    Projected::Constant(value, ty) => {
                        if !value.matches(ty) {
                            return Err(PlanError::invalid(
                                name,
                                format!("constant {value} is not a {ty}"),
                            ));
                        }
                        ty.clone()
                    }
                    Projected::Function { function, args } => {
                        src.positions_of(name, args)?;
                        function.return_type().clone()
                    }
                };
                out.push(Field::new(out_name.clone(), ty));
            }
            out
        }
        NodeKind::Equijoin(n) => {
            if n.branches.len() < 2 {
                return Err(PlanError::invalid(name, "equijoin needs at least two branches"));
            }
            let width = n.branches[0].fields.len();
            if width == 0 {
                return Err(PlanError::invalid(name, "equijoin needs join fields"));
            }
            let mut key_types: Option<Vec<FieldType>> = None;
            for (branch, input) in n.branches.iter().zip(inputs) {
                if branch.fields.len() != width {
                    return Err(PlanError::invalid(
                        name,
                        format!("branch {} has {} join fields, expected {width}", branch.source, branch.fields.len()),
                    ));
                }
                let types: Vec<FieldType> = input
                    .fields
                    .positions_of(name, &branch.fields)?
                    .into_iter()
                    .map(|p| input.fields[p].ty.clone())
                    .collect();
                match &key_types {
                    Some(expected) if *expected != types => {
                        return Err(PlanError::invalid(name, "join field types differ across branches"));
                    }
                    Some(_) => {}
                    None => key_types = Some(types),
                }
            }
            merge_fields(name, inputs.iter().flat_map(|i| i.fields.iter()))?
        }
        NodeKind::CrossJoin(n) => {
            if n.sources.is_empty() {
                return Err(PlanError::invalid(name, "cross join needs at least one source"));
            }
            merge_fields(name, inputs.iter().flat_map(|i| i.fields.iter()))?
        }
        NodeKind::LookupJoin(n) => {
            let driving = &inputs[0].fields;
            for (branch, input) in n.branches.iter().zip(&inputs[1..]) {
                if branch.fields.is_empty() {
                    return Err(PlanError::invalid(
                        name,
                        format!("lookup branch {} has no key fields", branch.source),
                    ));
                }
                for (driving_field, branch_field) in &branch.fields {
                    if driving.position(driving_field).is_none() {
                        return Err(PlanError::unknown_field(name, driving_field));
                    }
                    if input.fields.position(branch_field).is_none() {
                        return Err(PlanError::unknown_field(name, branch_field));
                    }
                }
            }
            merge_fields(name, inputs.iter().flat_map(|i| i.fields.iter()))?
        }
        NodeKind::Union(n) => {
            let Some(first) = inputs.first() else {
                return Err(PlanError::invalid(name, "union needs at least one source"));
            };
            for input in &inputs[1..] {
                if input.fields.as_vec() != first.fields.as_vec() {
                    return Err(PlanError::invalid(
                        name,
                        format!("source {} schema differs from {}", input.name, first.name),
                    ));
                }
            }
            let mut out = first.fields.as_vec().to_vec();
            if let Some(index_field) = &n.index_field {
                out.push(Field::new(index_field.clone(), FieldType::Long));
            }
            out
        }
        NodeKind::Unnest(n) => {
            let src = &inputs[0].fields;
            let elem = match src.type_of(&n.list_field) {
                Some(FieldType::List(elem)) => (**elem).clone(),
                Some(other) => {
                    return Err(PlanError::invalid(
                        name,
                        format!("unnest field {} is {other}, not a list", n.list_field),
                    ))
                }
                None => return Err(PlanError::unknown_field(name, &n.list_field)),
            };
            let mut out: Vec<Field> = src
                .iter()
                .filter(|f| f.name != n.list_field)
                .cloned()
                .collect();
            out.push(Field::new(n.element_field.clone(), elem));
            if let Some(index_field) = &n.index_field {
                out.push(Field::new(index_field.clone(), FieldType::Long));
            }
            out
        }
        NodeKind::ListAggregate(n) => {
            let src = &inputs[0].fields;
            let group_ty = src
                .type_of(&n.group_field)
                .cloned()
                .ok_or_else(|| PlanError::unknown_field(name, &n.group_field))?;
            let members: Vec<Field> = src
                .iter()
                .filter(|f| f.name != n.group_field)
                .cloned()
                .collect();
            vec![
                Field::new(n.group_field.clone(), group_ty),
                Field::new(
                    n.list_field.clone(),
                    FieldType::List(Box::new(FieldType::Struct(members))),
                ),
            ]
        }
        NodeKind::Persist(n) => {
            let fields = Fields::new(name, inputs[0].fields.as_vec().to_vec())?;
            require_id_fields(name, &fields, &n.id_fields)?;
            return Ok(fields);
        }
    };
    Fields::new(name, fields)
}

fn require_id_fields(name: &str, fields: &Fields, id_fields: &[String]) -> Result<(), PlanError> {
    if id_fields.is_empty() {
        return Err(PlanError::invalid(name, "stateful node needs id fields"));
    }
    fields.positions_of(name, id_fields).map(|_| ())
}

fn check_row(name: &str, fields: &Fields, row: &[Value]) -> Result<(), PlanError> {
    if row.len() != fields.len() {
        return Err(PlanError::invalid(
            name,
            format!("row has {} values, schema has {}", row.len(), fields.len()),
        ));
    }
    for (value, field) in row.iter().zip(fields) {
        if !value.matches(&field.ty) {
            return Err(PlanError::invalid(
                name,
                format!("value {value} is not a {} for field {}", field.ty, field.name),
            ));
        }
    }
    Ok(())
}

/// Concatenates input schemas, collapsing same-named fields of equal type.
fn merge_fields<'a>(name: &str, fields: impl Iterator<Item = &'a Field>) -> Result<Vec<Field>, PlanError> {
    let mut out: Vec<Field> = Vec::new();
    for field in fields {
        match out.iter().find(|f| f.name == field.name) {
            Some(existing) if existing.ty != field.ty => {
                return Err(PlanError::invalid(
                    name,
                    format!("field {} has conflicting types {} and {}", field.name, existing.ty, field.ty),
                ));
            }
            Some(_) => {}
            None => out.push(field.clone()),
        }
    }
    Ok(out)
}
