use std::collections::BTreeMap;
use std::fmt;

use super::Value;

/// Selects the rows a build should produce.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Key {
    /// Every row.
    #[default]
    All,
    /// Rows whose named fields equal the given values.
    Fields(BTreeMap<String, Value>),
}

impl Key {
    /// Key over a set of `(field, value)` pairs. An empty set selects all rows.
    pub fn of<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let fields: BTreeMap<String, Value> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        if fields.is_empty() {
            Self::All
        } else {
            Self::Fields(fields)
        }
    }

    /// Returns true for [`Key::All`].
    #[must_use]
    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Value bound to `field`, if this key constrains it.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        match self {
            Self::All => None,
            Self::Fields(fields) => fields.get(field),
        }
    }

    /// Iterates over the constrained fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        let map = match self {
            Self::All => None,
            Self::Fields(fields) => Some(fields),
        };
        map.into_iter()
            .flat_map(|m| m.iter().map(|(k, v)| (k.as_str(), v)))
    }

    /// True when the constrained fields are exactly `names`.
    #[must_use]
    pub fn covers_exactly(&self, names: &[String]) -> bool {
        match self {
            Self::All => false,
            Self::Fields(fields) => {
                fields.len() == names.len() && names.iter().all(|n| fields.contains_key(n))
            }
        }
    }

    /// Tests a row, given a field-position lookup, against this key.
    pub fn matches<'v>(&self, mut lookup: impl FnMut(&str) -> Option<&'v Value>) -> bool {
        self.fields().all(|(name, value)| lookup(name) == Some(value))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "*"),
            Self::Fields(fields) => {
                write!(f, "{{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}={v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_key_is_all() {
        assert!(Key::of(Vec::<(String, Value)>::new()).is_all());
    }

    #[test]
    fn test_covers_exactly() {
        let key = Key::of([("a", 1), ("b", 2)]);
        assert!(key.covers_exactly(&["b".to_string(), "a".to_string()]));
        assert!(!key.covers_exactly(&["a".to_string()]));
        assert!(!Key::All.covers_exactly(&[]));
        assert_eq!(key.to_string(), "{a=1, b=2}");
    }
}
