use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};

use super::Value;

/// Opaque, totally ordered row identity.
///
/// Stateful rows derive their id by tuple-encoding their id-field values,
/// so [`Id::to_values`] recovers them.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id(Bytes);

impl Id {
    /// Wraps raw id bytes.
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Encodes an ordered tuple of values into an id.
    #[must_use]
    pub fn from_values(values: &[Value]) -> Self {
        Self(codec::encode_tuple(values))
    }

    /// Decodes the tuple this id was built from.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the id was not produced by [`Id::from_values`].
    pub fn to_values(&self) -> Result<Vec<Value>, CodecError> {
        codec::decode_tuple(&self.0)
    }

    /// Raw bytes of the id.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_values() {
            Ok(values) if values.len() == 1 => write!(f, "{}", values[0]),
            Ok(values) => write!(f, "{}", Value::List(values)),
            Err(_) => {
                for b in self.0.iter() {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_decodes_its_values() {
        let id = Id::from_values(&[Value::Long(7), "a".into()]);
        assert_eq!(id.to_values().unwrap(), vec![Value::Long(7), "a".into()]);
        assert_eq!(id.to_string(), "[7, \"a\"]");
    }

    #[test]
    fn test_ids_from_equal_values_are_equal() {
        assert_eq!(Id::from_values(&[1.into()]), Id::from_values(&[1.into()]));
        assert_ne!(Id::from_values(&[1.into()]), Id::from_values(&[2.into()]));
    }

    #[test]
    fn test_raw_id_displays_hex() {
        let id = Id::new(vec![0xff, 0x01]);
        assert!(id.to_values().is_err());
        assert_eq!(id.to_string(), "ff01");
    }
}
