//! Column projections.

use std::sync::Arc;

use crate::plan::{Fields, Function, NodeId, PNode, ProjectNode, Projected};
use crate::types::{Key, Value};

use super::super::error::DriverError;
use super::super::lineage::LineagePolicy;
use super::super::ops::{OpResult, Ops};
use super::super::row::{attrs, DriverRow};
use super::{check_key, respond, retain_matching, values_at, Builder};

enum Column {
    Field(usize),
    Constant(Value),
    Function(Function, Vec<usize>),
}

/// Builds a projection. Key fields that copy an input field are pushed
/// down under the input's name; the rest filter the projected rows.
pub struct ProjectBuilder {
    node: NodeId,
    name: String,
    fields: Fields,
    source: NodeId,
    pushdown: Vec<(String, String)>,
    columns: Vec<Column>,
    lineage: Arc<LineagePolicy>,
}

impl ProjectBuilder {
    /// Creates the builder for `node` reading `input`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Plan`] if a projection names a missing field.
    pub fn new(
        node: &PNode,
        project: &ProjectNode,
        input: &PNode,
        lineage: Arc<LineagePolicy>,
    ) -> Result<Self, DriverError> {
        let src = input.fields();
        let mut pushdown = Vec::new();
        let mut columns = Vec::with_capacity(project.projections.len());
        for (out, projected) in &project.projections {
            let column = match projected {
                Projected::Field(field) => {
                    pushdown.push((out.clone(), field.clone()));
                    Column::Field(src.positions_of(node.name(), std::slice::from_ref(field))?[0])
                }
                Projected::Constant(value, _) => Column::Constant(value.clone()),
                Projected::Function { function, args } => {
                    Column::Function(function.clone(), src.positions_of(node.name(), args)?)
                }
            };
            columns.push(column);
        }
        Ok(Self {
            node: node.id(),
            name: node.name().to_string(),
            fields: node.fields().clone(),
            source: input.id(),
            pushdown,
            columns,
            lineage,
        })
    }

    fn source_key(&self, key: &Key) -> Key {
        Key::of(key.fields().filter_map(|(field, value)| {
            self.pushdown
                .iter()
                .find(|(out, _)| out == field)
                .map(|(_, src)| (src.clone(), value.clone()))
        }))
    }

    fn project(&self, row: &DriverRow) -> DriverRow {
        let lineage = self.lineage.derive([row]);
        let Some(input) = row.attributes() else {
            return DriverRow::new(self.node, row.id().cloned(), None, lineage);
        };
        let values = self
            .columns
            .iter()
            .map(|column| match column {
                Column::Field(pos) => input[*pos].clone(),
                Column::Constant(value) => value.clone(),
                Column::Function(function, args) => {
                    values_at(row, args).map_or(Value::Null, |args| function.invoke(&args))
                }
            })
            .collect();
        DriverRow::new(self.node, row.id().cloned(), attrs(values), lineage)
    }
}

impl Builder for ProjectBuilder {
    fn node(&self) -> NodeId {
        self.node
    }

    fn build<'a>(&'a self, key: &Key, ops: &mut Ops<'a>) -> OpResult {
        check_key(&self.name, &self.fields, key)?;
        let key = key.clone();
        ops.request(self.node, vec![(self.source, self.source_key(&key))], move |results, ops| {
            let mut rows: Vec<DriverRow> = results.iter().flatten().map(|row| self.project(row)).collect();
            retain_matching(&mut rows, &self.fields, &key);
            respond(ops, self.node, key, rows);
            Ok(())
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::build::testing::Harness;
    use crate::driver::lineage::{Lineage, LineageGranularity, LineageRetention};
    use crate::plan::{NodeKind, Plan, PlanBuilder};
    use crate::types::{Field, FieldType, Id};

    fn plan() -> Plan {
        let double = Function::new("double", FieldType::Long, |args| {
            args[0].as_long().map_or(Value::Null, |x| Value::Long(x * 2))
        });
        PlanBuilder::new()
            .scan(
                "scan",
                "t",
                vec![Field::new("id", FieldType::Long), Field::new("x", FieldType::Long)],
                &["id"],
            )
            .project(
                "project",
                "scan",
                vec![
                    ("key", Projected::Field("id".into())),
                    ("doubled", Projected::Function { function: double, args: vec!["x".into()] }),
                    ("tag", Projected::Constant(Value::from("v1"), FieldType::String)),
                ],
            )
            .build("project")
            .unwrap()
    }

    fn builder(plan: &Plan) -> ProjectBuilder {
        let node = plan.node_by_name("project").unwrap();
        let NodeKind::Project(project) = node.kind() else {
            unreachable!()
        };
        let policy = Arc::new(LineagePolicy::new(plan, LineageGranularity::Id, LineageRetention::Minimal));
        ProjectBuilder::new(node, project, plan.node_by_name("scan").unwrap(), policy).unwrap()
    }

    fn scan_row(id: i64, x: i64) -> DriverRow {
        DriverRow::new(
            NodeId::from_name("scan"),
            Some(Id::from_values(&[Value::Long(id)])),
            attrs(vec![Value::Long(id), Value::Long(x)]),
            Lineage::default(),
        )
    }

    #[test]
    fn test_projects_fields_functions_and_constants() {
        let plan = plan();
        let builder = builder(&plan);
        let mut harness = Harness::default().source(NodeId::from_name("scan"), Key::All, vec![scan_row(1, 21)]);
        let rows = harness.run(&builder, &Key::All);
        assert_eq!(
            rows[0].attributes().unwrap(),
            &[Value::Long(1), Value::Long(42), Value::from("v1")]
        );
    }

    #[test]
    fn test_renamed_key_pushed_down_and_computed_key_filtered() {
        let plan = plan();
        let builder = builder(&plan);
        let source_key = Key::of([("id", 1)]);
        let mut harness = Harness::default().source(NodeId::from_name("scan"), source_key.clone(), vec![scan_row(1, 21)]);

        let rows = harness.run(&builder, &Key::of([("key", 1)]));
        assert_eq!(harness.requests, vec![(NodeId::from_name("scan"), source_key)]);
        assert!(!rows[0].is_null());

        let mut harness = Harness::default().source(NodeId::from_name("scan"), Key::All, vec![scan_row(1, 21)]);
        let rows = harness.run(&builder, &Key::of([("doubled", 7)]));
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_null());
        assert_eq!(rows[0].id(), None);
    }
}
