//! Leaf reads of external tables.

use std::sync::Arc;

use crate::codec::CodecError;
use crate::connector::{ScanRow, TableBinding};
use crate::plan::{Fields, NodeId, PNode, ScanNode};
use crate::state::State;
use crate::types::{Id, Key, Value};

use super::super::cache::GetFlags;
use super::super::error::DriverError;
use super::super::lineage::Lineage;
use super::super::ops::{OpResult, Ops};
use super::super::row::{attrs, DriverRow};
use super::{check_key, respond, Builder};

/// Builds a scan node through its table's scanner.
///
/// A key naming exactly the id fields is first served from the state cache;
/// only a missing or unusable state goes to the scanner.
pub struct ScanBuilder {
    node: NodeId,
    name: String,
    fields: Fields,
    id_fields: Vec<String>,
    id_positions: Vec<usize>,
    binding: TableBinding,
}

impl ScanBuilder {
    /// Creates the builder for `node`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Plan`] if an id field is not in the schema.
    pub fn new(node: &PNode, scan: &ScanNode, binding: TableBinding) -> Result<Self, DriverError> {
        Ok(Self {
            node: node.id(),
            name: node.name().to_string(),
            fields: node.fields().clone(),
            id_positions: node.fields().positions_of(node.name(), &scan.id_fields)?,
            id_fields: scan.id_fields.clone(),
            binding,
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
        let attributes = state.attributes()?.cloned();
        Ok(DriverRow::new(
            self.node,
            Some(state.key().id.clone()),
            attributes,
            Lineage::default(),
        ))
    }

    fn to_row(&self, mut raw: ScanRow) -> Result<DriverRow, DriverError> {
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = raw.remove(&field.name).unwrap_or(Value::Null);
            if !value.matches(&field.ty) {
                return Err(CodecError::TypeMismatch {
                    expected: field.ty.to_string(),
                    value: value.to_string(),
                }
                .into());
            }
            values.push(value);
        }
        let id: Vec<Value> = self.id_positions.iter().map(|p| values[*p].clone()).collect();
        Ok(DriverRow::new(
            self.node,
            Some(Id::from_values(&id)),
            attrs(values),
            Lineage::default(),
        ))
    }

    fn scan<'a>(&'a self, key: Key, missing: Option<Id>, ops: &mut Ops<'a>) {
        ops.scan(
            self.node,
            Arc::clone(&self.binding.scanner),
            Arc::clone(&self.binding.connector),
            key.clone(),
            move |scanned, ops| {
                let mut rows = scanned
                    .into_iter()
                    .map(|raw| self.to_row(raw))
                    .collect::<Result<Vec<_>, _>>()?;
                if rows.is_empty() {
                    if let Some(id) = missing {
                        rows.push(DriverRow::null(self.node, Some(id)));
                    }
                }
                respond(ops, self.node, key, rows);
                Ok(())
            },
        );
    }
}

impl Builder for ScanBuilder {
    fn node(&self) -> NodeId {
        self.node
    }

    fn build<'a>(&'a self, key: &Key, ops: &mut Ops<'a>) -> OpResult {
        check_key(&self.name, &self.fields, key)?;
        if !key.covers_exactly(&self.id_fields) {
            self.scan(key.clone(), None, ops);
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
                _ => self.scan(key, Some(id), ops),
            }
            Ok(())
        });
        Ok(())
    }
}
