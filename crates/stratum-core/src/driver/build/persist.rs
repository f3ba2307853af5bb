//! Materialized rows.

use std::sync::Arc;

use crate::plan::{Fields, NodeId, PNode, PersistNode};
use crate::state::State;
use crate::types::{Id, Key, Value};

use super::super::cache::GetFlags;
use super::super::error::DriverError;
use super::super::lineage::{Lineage, LineagePolicy};
use super::super::ops::{OpResult, Ops};
use super::super::row::DriverRow;
use super::{check_key, respond, values_at, Builder};

/// Builds a persist node.
///
/// A key naming exactly the id fields is answered from a usable state
/// without touching the source. Otherwise the source is built and each row
/// is re-identified by the persist node's own id fields. When the key names
/// the id, a row filtered out upstream comes back as a null row under that
/// id, so the state records the disappearance.
pub struct PersistBuilder {
    node: NodeId,
    name: String,
    fields: Fields,
    source: NodeId,
    id_fields: Vec<String>,
    id_positions: Vec<usize>,
    lineage: Arc<LineagePolicy>,
}

impl PersistBuilder {
    /// Creates the builder for `node` reading `input`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Plan`] if an id field is missing.
    pub fn new(
        node: &PNode,
        persist: &PersistNode,
        input: &PNode,
        lineage: Arc<LineagePolicy>,
    ) -> Result<Self, DriverError> {
        Ok(Self {
            node: node.id(),
            name: node.name().to_string(),
            fields: node.fields().clone(),
            source: input.id(),
            id_fields: persist.id_fields.clone(),
            id_positions: node.fields().positions_of(node.name(), &persist.id_fields)?,
            lineage,
        })
    }

    fn key_id(&self, key: &Key) -> Id {
        let values: Vec<Value> = self
            .id_fields
            .iter()
            .map(|f| key.get(f).cloned().unwrap_or(Value::Null))
            .collect();
        Id::from_values(&values)
    }

    fn state_row(&self, state: &State) -> Result<DriverRow, DriverError> {
        Ok(DriverRow::new(
            self.node,
            Some(state.key().id.clone()),
            state.attributes()?.cloned(),
            Lineage::default(),
        ))
    }

    fn materialize(&self, inputs: &[DriverRow], keyed: Option<&Id>) -> Vec<DriverRow> {
        let mut rows = Vec::with_capacity(inputs.len());
        for input in inputs {
            let lineage = self.lineage.derive([input]);
            match values_at(input, &self.id_positions) {
                Some(id) => rows.push(DriverRow::new(
                    self.node,
                    Some(Id::from_values(&id)),
                    input.shared_attributes(),
                    lineage,
                )),
                None => {
                    if let Some(id) = keyed {
                        rows.push(DriverRow::new(self.node, Some(id.clone()), None, lineage));
                    }
                }
            }
        }
        if rows.is_empty() {
            if let Some(id) = keyed {
                rows.push(DriverRow::null(self.node, Some(id.clone())));
            }
        }
        rows
    }

    fn request<'a>(&'a self, key: Key, keyed: Option<Id>, ops: &mut Ops<'a>) {
        ops.request(self.node, vec![(self.source, key.clone())], move |results, ops| {
            let inputs = results.into_iter().flatten().collect::<Vec<_>>();
            let rows = self.materialize(&inputs, keyed.as_ref());
            respond(ops, self.node, key, rows);
            Ok(())
        });
    }
}

impl Builder for PersistBuilder {
    fn node(&self) -> NodeId {
        self.node
    }

    fn build<'a>(&'a self, key: &Key, ops: &mut Ops<'a>) -> OpResult {
        check_key(&self.name, &self.fields, key)?;
        if !key.covers_exactly(&self.id_fields) {
            self.request(key.clone(), None, ops);
            return Ok(());
        }
        let id = self.key_id(key);
        let key = key.clone();
        ops.get_state(self.node, self.node, vec![id.clone()], GetFlags::NONE, move |states, ops| {
            match states.get(&id) {
                Some(state) if state.is_usable() => {
                    let row = self.state_row(state)?;
                    ops.respond(self.node, key, vec![row]);
                }
                _ => self.request(key, Some(id), ops),
            }
            Ok(())
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::build::testing::Harness;
    use crate::driver::lineage::{LineageGranularity, LineageRetention};
    use crate::driver::row::attrs;
    use crate::plan::{NodeKind, Plan, PlanBuilder};
    use crate::state::{Mode, StateKey};
    use crate::types::{Field, FieldType};

    fn plan() -> Plan {
        PlanBuilder::new()
            .scan(
                "scan",
                "t",
                vec![Field::new("id", FieldType::Long), Field::new("x", FieldType::Long)],
                &["id"],
            )
            .persist("persist", "scan", &["id"])
            .build("persist")
            .unwrap()
    }

    fn builder(plan: &Plan) -> PersistBuilder {
        let node = plan.node_by_name("persist").unwrap();
        let NodeKind::Persist(persist) = node.kind() else {
            unreachable!()
        };
        let policy = Arc::new(LineagePolicy::new(plan, LineageGranularity::Id, LineageRetention::Minimal));
        PersistBuilder::new(node, persist, plan.node_by_name("scan").unwrap(), policy).unwrap()
    }

    fn id(v: i64) -> Id {
        Id::from_values(&[Value::Long(v)])
    }

    #[test]
    fn test_usable_state_short_circuits_source() {
        let plan = plan();
        let builder = builder(&plan);
        let key = StateKey::new(NodeId::from_name("persist"), id(1));
        let state = State::restore(
            key,
            Mode::Exclusive,
            1,
            attrs(vec![Value::Long(1), Value::Long(10)]),
            crate::state::Linkage::default(),
        );
        let mut harness = Harness::default();
        harness.states.insert(id(1), state);

        let rows = harness.run(&builder, &Key::of([("id", 1)]));
        assert!(harness.requests.is_empty());
        assert_eq!(rows[0].attributes().unwrap()[1], Value::Long(10));
    }

    #[test]
    fn test_missing_row_becomes_keyed_null_row() {
        let plan = plan();
        let builder = builder(&plan);
        let mut harness = Harness::default();
        let rows = harness.run(&builder, &Key::of([("id", 4)]));
        assert_eq!(harness.requests, vec![(NodeId::from_name("scan"), Key::of([("id", 4)]))]);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_null());
        assert_eq!(rows[0].id(), Some(&id(4)));
    }

    #[test]
    fn test_rows_reidentified_with_lineage() {
        let plan = plan();
        let builder = builder(&plan);
        let scan = NodeId::from_name("scan");
        let input = DriverRow::new(
            scan,
            Some(id(2)),
            attrs(vec![Value::Long(2), Value::Long(20)]),
            Lineage::default(),
        );
        let mut harness = Harness::default().source(scan, Key::All, vec![input]);
        let rows = harness.run(&builder, &Key::All);
        assert_eq!(rows[0].id(), Some(&id(2)));
        assert!(rows[0].lineage().contains(scan, &id(2)));
    }
}
