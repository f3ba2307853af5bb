//! Ordered node schemas.

use std::ops::Index;

use fxhash::FxHashMap;

use crate::types::{Field, FieldType};

use super::error::PlanError;

/// Ordered, name-indexed field schema of a node.
#[derive(Debug, Clone, Default)]
pub struct Fields {
    fields: Vec<Field>,
    positions: FxHashMap<String, usize>,
}

impl Fields {
    /// Builds a schema, rejecting repeated names.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::DuplicateField`] naming `node`.
    pub fn new(node: &str, fields: Vec<Field>) -> Result<Self, PlanError> {
        let mut positions = FxHashMap::default();
        for (i, field) in fields.iter().enumerate() {
            if positions.insert(field.name.clone(), i).is_some() {
                return Err(PlanError::DuplicateField {
                    node: node.to_string(),
                    field: field.name.clone(),
                });
            }
        }
        Ok(Self { fields, positions })
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True for an empty schema.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Position of `name`.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    /// Field named `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Field> {
        self.position(name).map(|i| &self.fields[i])
    }

    /// Type of `name`.
    #[must_use]
    pub fn type_of(&self, name: &str) -> Option<&FieldType> {
        self.get(name).map(|f| &f.ty)
    }

    /// Fields in schema order.
    pub fn iter(&self) -> std::slice::Iter<'_, Field> {
        self.fields.iter()
    }

    /// Field names in schema order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Resolves `names` to positions, failing on the first unknown name.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::UnknownField`] naming `node`.
    pub fn positions_of<S: AsRef<str>>(&self, node: &str, names: &[S]) -> Result<Vec<usize>, PlanError> {
        names
            .iter()
            .map(|n| {
                self.position(n.as_ref())
                    .ok_or_else(|| PlanError::unknown_field(node, n.as_ref()))
            })
            .collect()
    }

    pub(crate) fn as_vec(&self) -> &[Field] {
        &self.fields
    }
}

impl Index<usize> for Fields {
    type Output = Field;

    fn index(&self, index: usize) -> &Field {
        &self.fields[index]
    }
}

impl<'a> IntoIterator for &'a Fields {
    type Item = &'a Field;
    type IntoIter = std::slice::Iter<'a, Field>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}
