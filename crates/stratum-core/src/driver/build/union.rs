//! Concatenation of same-schema sources.

use std::sync::Arc;

use crate::plan::{Fields, NodeId, PNode, UnionNode};
use crate::types::{Id, Key, Value};

use super::super::lineage::LineagePolicy;
use super::super::ops::{OpResult, Ops};
use super::super::row::{attrs, DriverRow};
use super::{check_key, respond, Builder};

/// Builds a union. Output ids pair the source position with the source id,
/// so rows of different sources never collide. A key binding the index
/// field selects a single source.
pub struct UnionBuilder {
    node: NodeId,
    name: String,
    fields: Fields,
    sources: Vec<NodeId>,
    index_field: Option<String>,
    lineage: Arc<LineagePolicy>,
}

impl UnionBuilder {
    /// Creates the builder for `node` over `inputs`.
    #[must_use]
    pub fn new(node: &PNode, union: &UnionNode, inputs: &[&PNode], lineage: Arc<LineagePolicy>) -> Self {
        Self {
            node: node.id(),
            name: node.name().to_string(),
            fields: node.fields().clone(),
            sources: inputs.iter().map(|i| i.id()).collect(),
            index_field: union.index_field.clone(),
            lineage,
        }
    }

    fn relabel(&self, index: usize, row: &DriverRow) -> DriverRow {
        let position = Value::Long(i64::try_from(index).unwrap_or(i64::MAX));
        let id = Id::from_values(&[position.clone(), row.id_value()]);
        let attributes = row.attributes().map(|values| {
            let mut values = values.to_vec();
            if self.index_field.is_some() {
                values.push(position);
            }
            values
        });
        DriverRow::new(
            self.node,
            Some(id),
            attributes.and_then(attrs),
            self.lineage.derive([row]),
        )
    }
}

impl Builder for UnionBuilder {
    fn node(&self) -> NodeId {
        self.node
    }

    fn build<'a>(&'a self, key: &Key, ops: &mut Ops<'a>) -> OpResult {
        check_key(&self.name, &self.fields, key)?;
        let selected = self
            .index_field
            .as_ref()
            .and_then(|f| key.get(f))
            .map(|v| v.as_long().and_then(|i| usize::try_from(i).ok()));
        let source_key = Key::of(
            key.fields()
                .filter(|(f, _)| Some(*f) != self.index_field.as_deref())
                .map(|(f, v)| (f, v.clone())),
        );
        let positions: Vec<usize> = match selected {
            None => (0..self.sources.len()).collect(),
            Some(Some(i)) if i < self.sources.len() => vec![i],
            Some(_) => Vec::new(),
        };
        let key = key.clone();
        if positions.is_empty() {
            respond(ops, self.node, key, Vec::new());
            return Ok(());
        }
        let requests = positions
            .iter()
            .map(|i| (self.sources[*i], source_key.clone()))
            .collect();
        ops.request(self.node, requests, move |results, ops| {
            let rows = positions
                .iter()
                .zip(&results)
                .flat_map(|(i, rows)| rows.iter().map(move |row| self.relabel(*i, row)))
                .collect();
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
    use crate::types::{Field, FieldType};

    fn setup() -> (Plan, NodeId, NodeId) {
        let plan = PlanBuilder::new()
            .scan("a", "a", vec![Field::new("x", FieldType::Long)], &["x"])
            .scan("b", "b", vec![Field::new("x", FieldType::Long)], &["x"])
            .node(
                "union",
                NodeKind::Union(UnionNode {
                    sources: vec!["a".into(), "b".into()],
                    index_field: Some("src".into()),
                }),
            )
            .build("union")
            .unwrap();
        (plan, NodeId::from_name("a"), NodeId::from_name("b"))
    }

    fn builder(plan: &Plan) -> UnionBuilder {
        let node = plan.node_by_name("union").unwrap();
        let NodeKind::Union(union) = node.kind() else {
            unreachable!()
        };
        let inputs = [plan.node_by_name("a").unwrap(), plan.node_by_name("b").unwrap()];
        let policy = Arc::new(LineagePolicy::new(plan, LineageGranularity::Id, LineageRetention::Minimal));
        UnionBuilder::new(node, union, &inputs, policy)
    }

    fn row(node: NodeId, x: i64) -> DriverRow {
        DriverRow::new(
            node,
            Some(Id::from_values(&[Value::Long(x)])),
            attrs(vec![Value::Long(x)]),
            Lineage::default(),
        )
    }

    #[test]
    fn test_same_id_from_two_sources_stays_distinct() {
        let (plan, a, b) = setup();
        let builder = builder(&plan);
        let mut harness = Harness::default()
            .source(a, Key::All, vec![row(a, 1)])
            .source(b, Key::All, vec![row(b, 1)]);
        let rows = harness.run(&builder, &Key::All);
        assert_eq!(rows.len(), 2);
        assert_ne!(rows[0].id(), rows[1].id());
        assert_eq!(rows[1].attributes().unwrap(), &[Value::Long(1), Value::Long(1)]);
    }

    #[test]
    fn test_index_key_selects_one_source() {
        let (plan, _, b) = setup();
        let builder = builder(&plan);
        let mut harness = Harness::default();
        harness.run(&builder, &Key::of([("src", 1), ("x", 5)]));
        assert_eq!(harness.requests, vec![(b, Key::of([("x", 5)]))]);

        let mut harness = Harness::default();
        let rows = harness.run(&builder, &Key::of([("src", 9)]));
        assert!(harness.requests.is_empty());
        assert!(rows[0].is_null());
    }
}
