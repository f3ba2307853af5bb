use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical type of a field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    /// `true` / `false`.
    Boolean,
    /// 64-bit signed integer.
    Long,
    /// 64-bit float.
    Double,
    /// UTF-8 string.
    String,
    /// Opaque bytes.
    Bytes,
    /// Homogeneous list.
    List(Box<FieldType>),
    /// Positional struct with named members.
    Struct(Vec<Field>),
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean => write!(f, "boolean"),
            Self::Long => write!(f, "long"),
            Self::Double => write!(f, "double"),
            Self::String => write!(f, "string"),
            Self::Bytes => write!(f, "bytes"),
            Self::List(elem) => write!(f, "list<{elem}>"),
            Self::Struct(fields) => {
                write!(f, "struct<")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", field.name, field.ty)?;
                }
                write!(f, ">")
            }
        }
    }
}

/// A named, typed field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    /// Field name, unique within its schema.
    pub name: String,
    /// Field type.
    pub ty: FieldType,
}

impl Field {
    /// Creates a new field.
    #[must_use]
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Absent value; conforms to every type.
    Null,
    /// Boolean value.
    Boolean(bool),
    /// Integer value.
    Long(i64),
    /// Float value.
    Double(f64),
    /// String value.
    String(String),
    /// Byte string value.
    Bytes(Vec<u8>),
    /// List value.
    List(Vec<Value>),
    /// Struct value, positional.
    Struct(Vec<Value>),
}

impl Value {
    /// Returns true if this value is `Null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the boolean payload, if any.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer payload, if any.
    #[must_use]
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the list payload, if any.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(values) => Some(values),
            _ => None,
        }
    }

    /// Checks whether this value conforms to `ty`.
    #[must_use]
    pub fn matches(&self, ty: &FieldType) -> bool {
        match (self, ty) {
            (Self::Null, _)
            | (Self::Boolean(_), FieldType::Boolean)
            | (Self::Long(_), FieldType::Long)
            | (Self::Double(_), FieldType::Double)
            | (Self::String(_), FieldType::String)
            | (Self::Bytes(_), FieldType::Bytes) => true,
            (Self::List(values), FieldType::List(elem)) => values.iter().all(|v| v.matches(elem)),
            (Self::Struct(values), FieldType::Struct(fields)) => {
                values.len() == fields.len()
                    && values.iter().zip(fields).all(|(v, f)| v.matches(&f.ty))
            }
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Long(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => write!(f, "0x{}", b.iter().map(|x| format!("{x:02x}")).collect::<String>()),
            Self::List(values) | Self::Struct(values) => {
                let open = if matches!(self, Self::List(_)) { '[' } else { '{' };
                let close = if open == '[' { ']' } else { '}' };
                write!(f, "{open}")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "{close}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Long(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_matches_every_type() {
        assert!(Value::Null.matches(&FieldType::Long));
        assert!(Value::Null.matches(&FieldType::List(Box::new(FieldType::String))));
    }

    #[test]
    fn test_nested_type_conformance() {
        let ty = FieldType::List(Box::new(FieldType::Struct(vec![
            Field::new("a", FieldType::Long),
            Field::new("b", FieldType::String),
        ])));
        let ok = Value::List(vec![Value::Struct(vec![1.into(), "x".into()])]);
        let bad = Value::List(vec![Value::Struct(vec!["x".into(), 1.into()])]);
        assert!(ok.matches(&ty));
        assert!(!bad.matches(&ty));
    }

    #[test]
    fn test_display() {
        let v = Value::List(vec![1.into(), Value::Null, "a".into()]);
        assert_eq!(v.to_string(), "[1, null, \"a\"]");
        assert_eq!(FieldType::List(Box::new(FieldType::Long)).to_string(), "list<long>");
    }
}
