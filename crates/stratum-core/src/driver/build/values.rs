//! Inline constant rows.

use crate::plan::{Fields, NodeId, PNode, ValuesNode};
use crate::types::{Id, Key, Value};

use super::super::error::DriverError;
use super::super::lineage::Lineage;
use super::super::ops::{OpResult, Ops};
use super::super::row::{attrs, DriverRow};
use super::{check_key, respond, retain_matching, Builder};

/// Builds a values node from rows materialized once at construction.
pub struct ValuesBuilder {
    node: NodeId,
    name: String,
    fields: Fields,
    rows: Vec<DriverRow>,
}

impl ValuesBuilder {
    /// Creates the builder for `node`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Plan`] if the id field is missing.
    pub fn new(node: &PNode, values: &ValuesNode) -> Result<Self, DriverError> {
        let id_position = values
            .id_field
            .as_ref()
            .map(|f| node.fields().positions_of(node.name(), std::slice::from_ref(f)))
            .transpose()?
            .map(|p| p[0]);
        let rows = values
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let id = match id_position {
                    Some(p) => row[p].clone(),
                    None => Value::Long(i64::try_from(i).unwrap_or(i64::MAX)),
                };
                DriverRow::new(
                    node.id(),
                    Some(Id::from_values(&[id])),
                    attrs(row.clone()),
                    Lineage::default(),
                )
            })
            .collect();
        Ok(Self {
            node: node.id(),
            name: node.name().to_string(),
            fields: node.fields().clone(),
            rows,
        })
    }
}

impl Builder for ValuesBuilder {
    fn node(&self) -> NodeId {
        self.node
    }

    fn build<'a>(&'a self, key: &Key, ops: &mut Ops<'a>) -> OpResult {
        check_key(&self.name, &self.fields, key)?;
        let mut rows = self.rows.clone();
        retain_matching(&mut rows, &self.fields, key);
        respond(ops, self.node, key.clone(), rows);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::build::testing::Harness;
    use crate::plan::{NodeKind, PlanBuilder};
    use crate::types::{Field, FieldType};

    #[test]
    fn test_rows_keyed_by_position_or_id_field() {
        let fields = vec![Field::new("code", FieldType::String), Field::new("rank", FieldType::Long)];
        let rows = vec![
            vec![Value::from("a"), Value::Long(1)],
            vec![Value::from("b"), Value::Long(2)],
        ];
        for (id_field, expected) in [(None, Value::Long(1)), (Some("code".to_string()), Value::from("b"))] {
            let plan = PlanBuilder::new()
                .node(
                    "values",
                    NodeKind::Values(ValuesNode {
                        fields: fields.clone(),
                        rows: rows.clone(),
                        id_field,
                    }),
                )
                .build("values")
                .unwrap();
            let node = plan.root();
            let NodeKind::Values(values) = node.kind() else {
                unreachable!()
            };
            let builder = ValuesBuilder::new(node, values).unwrap();
            let out = Harness::default().run(&builder, &Key::of([("rank", 2)]));
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].id(), Some(&Id::from_values(&[expected])));
        }
    }
}
