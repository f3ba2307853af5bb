//! Rows exchanged between builders.

use std::sync::Arc;

use crate::plan::{Fields, NodeId};
use crate::state::Attributes;
use crate::types::{Id, Value};

use super::lineage::Lineage;

/// A row produced by a builder.
///
/// `id` is `None` for rows with no persisted identity; `attributes` is
/// `None` for a row that exists only to carry an id (a filtered-out or
/// vanished row).
#[derive(Debug, Clone)]
pub struct DriverRow {
    node: NodeId,
    id: Option<Id>,
    attributes: Attributes,
    lineage: Lineage,
}

impl DriverRow {
    /// Creates a row.
    #[must_use]
    pub fn new(node: NodeId, id: Option<Id>, attributes: Attributes, lineage: Lineage) -> Self {
        Self {
            node,
            id,
            attributes,
            lineage,
        }
    }

    /// A row with no attributes and no lineage.
    #[must_use]
    pub fn null(node: NodeId, id: Option<Id>) -> Self {
        Self::new(node, id, None, Lineage::default())
    }

    /// Producing node.
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Row id.
    #[must_use]
    pub fn id(&self) -> Option<&Id> {
        self.id.as_ref()
    }

    /// Attribute values in the producing node's field order.
    #[must_use]
    pub fn attributes(&self) -> Option<&[Value]> {
        self.attributes.as_deref()
    }

    /// Shared handle to the attributes.
    #[must_use]
    pub fn shared_attributes(&self) -> Attributes {
        self.attributes.clone()
    }

    /// True when the row carries no attributes.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.attributes.is_none()
    }

    /// Upstream rows this row was derived from.
    #[must_use]
    pub fn lineage(&self) -> &Lineage {
        &self.lineage
    }

    /// Value of `field` under `fields`.
    #[must_use]
    pub fn get<'a>(&'a self, fields: &Fields, field: &str) -> Option<&'a Value> {
        let pos = fields.position(field)?;
        self.attributes.as_ref().and_then(|a| a.get(pos))
    }

    /// Id as a value, for composite ids of derived rows.
    pub(crate) fn id_value(&self) -> Value {
        self.id
            .as_ref()
            .map_or(Value::Null, |id| Value::Bytes(id.as_bytes().to_vec()))
    }
}

/// Wraps owned values as shared attributes.
pub(crate) fn attrs(values: Vec<Value>) -> Attributes {
    Some(Arc::from(values))
}
