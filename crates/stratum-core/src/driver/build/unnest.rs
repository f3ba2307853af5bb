//! List expansion.

use std::sync::Arc;

use crate::plan::{Fields, NodeId, PNode, UnnestNode};
use crate::types::{Id, Key, Value};

use super::super::error::DriverError;
use super::super::lineage::LineagePolicy;
use super::super::ops::{OpResult, Ops};
use super::super::row::{attrs, DriverRow};
use super::{check_key, respond, restrict_key, retain_matching, Builder};

/// Builds an unnest: one output row per element of the list field. Rows
/// with a null or empty list produce nothing.
pub struct UnnestBuilder {
    node: NodeId,
    name: String,
    fields: Fields,
    source: NodeId,
    pushable: Fields,
    list_position: usize,
    with_index: bool,
    lineage: Arc<LineagePolicy>,
}

impl UnnestBuilder {
    /// Creates the builder for `node` reading `input`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Plan`] if the list field is missing.
    pub fn new(
        node: &PNode,
        unnest: &UnnestNode,
        input: &PNode,
        lineage: Arc<LineagePolicy>,
    ) -> Result<Self, DriverError> {
        let list_position = input
            .fields()
            .positions_of(node.name(), std::slice::from_ref(&unnest.list_field))?[0];
        let pushable = Fields::new(
            node.name(),
            input
                .fields()
                .iter()
                .filter(|f| f.name != unnest.list_field)
                .cloned()
                .collect(),
        )?;
        Ok(Self {
            node: node.id(),
            name: node.name().to_string(),
            fields: node.fields().clone(),
            source: input.id(),
            pushable,
            list_position,
            with_index: unnest.index_field.is_some(),
            lineage,
        })
    }

    fn expand(&self, row: &DriverRow, out: &mut Vec<DriverRow>) {
        let Some(values) = row.attributes() else {
            return;
        };
        let Some(list) = values.get(self.list_position).and_then(Value::as_list) else {
            return;
        };
        let lineage = self.lineage.derive([row]);
        for (i, element) in list.iter().enumerate() {
            let position = Value::Long(i64::try_from(i).unwrap_or(i64::MAX));
            let mut expanded: Vec<Value> = values
                .iter()
                .enumerate()
                .filter(|(p, _)| *p != self.list_position)
                .map(|(_, v)| v.clone())
                .collect();
            expanded.push(element.clone());
            if self.with_index {
                expanded.push(position.clone());
            }
            out.push(DriverRow::new(
                self.node,
                Some(Id::from_values(&[row.id_value(), position])),
                attrs(expanded),
                lineage.clone(),
            ));
        }
    }
}

impl Builder for UnnestBuilder {
    fn node(&self) -> NodeId {
        self.node
    }

    fn build<'a>(&'a self, key: &Key, ops: &mut Ops<'a>) -> OpResult {
        check_key(&self.name, &self.fields, key)?;
        let key = key.clone();
        ops.request(self.node, vec![(self.source, restrict_key(&key, &self.pushable))], move |results, ops| {
            let mut rows = Vec::new();
            for row in results.iter().flatten() {
                self.expand(row, &mut rows);
            }
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
    use crate::types::{Field, FieldType};

    fn plan() -> Plan {
        PlanBuilder::new()
            .scan(
                "orders",
                "orders",
                vec![
                    Field::new("id", FieldType::Long),
                    Field::new("items", FieldType::List(Box::new(FieldType::String))),
                ],
                &["id"],
            )
            .node(
                "unnest",
                NodeKind::Unnest(UnnestNode {
                    source: "orders".into(),
                    list_field: "items".into(),
                    element_field: "item".into(),
                    index_field: Some("pos".into()),
                }),
            )
            .build("unnest")
            .unwrap()
    }

    #[test]
    fn test_expands_lists_and_filters_on_element() {
        let plan = plan();
        let node = plan.node_by_name("unnest").unwrap();
        let NodeKind::Unnest(unnest) = node.kind() else {
            unreachable!()
        };
        let policy = Arc::new(LineagePolicy::new(&plan, LineageGranularity::Id, LineageRetention::Minimal));
        let builder = UnnestBuilder::new(node, unnest, plan.node_by_name("orders").unwrap(), policy).unwrap();

        let orders = NodeId::from_name("orders");
        let order = |id: i64, items: Value| {
            DriverRow::new(
                orders,
                Some(Id::from_values(&[Value::Long(id)])),
                attrs(vec![Value::Long(id), items]),
                Lineage::default(),
            )
        };
        let rows = vec![
            order(1, Value::List(vec![Value::from("a"), Value::from("b")])),
            order(2, Value::List(Vec::new())),
            order(3, Value::Null),
        ];
        let mut harness = Harness::default().source(orders, Key::All, rows.clone());
        let out = harness.run(&builder, &Key::All);
        assert_eq!(out.len(), 2);
        assert_eq!(
            out[1].attributes().unwrap(),
            &[Value::Long(1), Value::from("b"), Value::Long(1)]
        );

        let mut harness = Harness::default().source(orders, Key::All, rows);
        let out = harness.run(&builder, &Key::of([("item", "a")]));
        assert_eq!(harness.requests, vec![(orders, Key::All)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].attributes().unwrap()[1], Value::from("a"));
    }
}
