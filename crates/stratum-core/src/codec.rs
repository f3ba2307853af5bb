//! Binary codecs for ids, attribute rows and linkage.
//!
//! Values are written as a one-byte tag followed by the payload. Scalars are
//! order-preserving, so id span scans follow value order:
//!
//! - longs are big-endian with the sign bit flipped;
//! - doubles flip the sign bit when positive and every bit when negative;
//! - strings and bytes escape `0x00` as `0x00 0xFF` and end with `0x00 0x00`.
//!
//! Tuples, lists and structs carry a length prefix, so they order by length
//! first. Ids of one node share an arity, which keeps that prefix constant.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::plan::{NodeId, Plan};
use crate::state::{Linkage, Mode, State, StateKey};
use crate::storage::StorageState;
use crate::types::{FieldType, Id, Value};

const TAG_NULL: u8 = 0;
const TAG_BOOLEAN: u8 = 1;
const TAG_LONG: u8 = 2;
const TAG_DOUBLE: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_LIST: u8 = 6;
const TAG_STRUCT: u8 = 7;

const SIGN_BIT: u64 = 1 << 63;

const ESCAPE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0xFF;
const TERMINATOR: u8 = 0x00;

/// Errors raised while encoding or decoding values.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Input ended before a complete value was read.
    #[error("truncated input")]
    Truncated,

    /// Input continued after the last expected value.
    #[error("{0} trailing bytes after decoded value")]
    TrailingBytes(usize),

    /// Unrecognized value tag.
    #[error("unknown value tag: {0}")]
    UnknownTag(u8),

    /// String payload was not UTF-8.
    #[error("invalid utf-8 in string value")]
    InvalidUtf8,

    /// Value does not conform to its declared field type.
    #[error("type mismatch: expected {expected}, got {value}")]
    TypeMismatch {
        /// Declared type.
        expected: String,
        /// Offending value.
        value: String,
    },

    /// Row width differs from the node schema.
    #[error("arity mismatch: expected {expected} values, got {actual}")]
    Arity {
        /// Schema width.
        expected: usize,
        /// Row width.
        actual: usize,
    },

    /// No schema is registered for the node.
    #[error("no schema registered for node {0}")]
    UnknownNode(NodeId),

    /// Linkage JSON failed to (de)serialize.
    #[error("linkage encoding: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encodes an ordered tuple of values.
#[must_use]
pub fn encode_tuple(values: &[Value]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + values.len() * 9);
    put_len(&mut buf, values.len());
    for value in values {
        encode_value(value, &mut buf);
    }
    buf.freeze()
}

/// Decodes a tuple written by [`encode_tuple`].
///
/// # Errors
///
/// Returns [`CodecError`] on truncated, trailing or malformed input.
pub fn decode_tuple(mut bytes: &[u8]) -> Result<Vec<Value>, CodecError> {
    let len = get_len(&mut bytes)?;
    let mut values = Vec::with_capacity(len.min(64));
    for _ in 0..len {
        values.push(decode_value(&mut bytes)?);
    }
    if bytes.has_remaining() {
        return Err(CodecError::TrailingBytes(bytes.remaining()));
    }
    Ok(values)
}

/// Appends one tagged value to `buf`.
pub fn encode_value(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Null => buf.put_u8(TAG_NULL),
        Value::Boolean(b) => {
            buf.put_u8(TAG_BOOLEAN);
            buf.put_u8(u8::from(*b));
        }
        Value::Long(v) => {
            buf.put_u8(TAG_LONG);
            buf.put_u64(u64::from_be_bytes(v.to_be_bytes()) ^ SIGN_BIT);
        }
        Value::Double(v) => {
            buf.put_u8(TAG_DOUBLE);
            let bits = v.to_bits();
            buf.put_u64(if bits & SIGN_BIT == 0 { bits ^ SIGN_BIT } else { !bits });
        }
        Value::String(s) => {
            buf.put_u8(TAG_STRING);
            put_escaped(buf, s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.put_u8(TAG_BYTES);
            put_escaped(buf, b);
        }
        Value::List(values) | Value::Struct(values) => {
            buf.put_u8(if matches!(value, Value::List(_)) {
                TAG_LIST
            } else {
                TAG_STRUCT
            });
            put_len(buf, values.len());
            for v in values {
                encode_value(v, buf);
            }
        }
    }
}

/// Reads one tagged value from the front of `buf`.
///
/// # Errors
///
/// Returns [`CodecError`] on truncated or malformed input.
pub fn decode_value(buf: &mut &[u8]) -> Result<Value, CodecError> {
    need(buf, 1)?;
    match buf.get_u8() {
        TAG_NULL => Ok(Value::Null),
        TAG_BOOLEAN => {
            need(buf, 1)?;
            Ok(Value::Boolean(buf.get_u8() != 0))
        }
        TAG_LONG => {
            need(buf, 8)?;
            let raw = buf.get_u64() ^ SIGN_BIT;
            Ok(Value::Long(i64::from_be_bytes(raw.to_be_bytes())))
        }
        TAG_DOUBLE => {
            need(buf, 8)?;
            let raw = buf.get_u64();
            let bits = if raw & SIGN_BIT == 0 { !raw } else { raw ^ SIGN_BIT };
            Ok(Value::Double(f64::from_bits(bits)))
        }
        TAG_STRING => {
            let bytes = get_escaped(buf)?;
            let s = String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
            Ok(Value::String(s))
        }
        TAG_BYTES => Ok(Value::Bytes(get_escaped(buf)?)),
        tag @ (TAG_LIST | TAG_STRUCT) => {
            let len = get_len(buf)?;
            let mut values = Vec::with_capacity(len.min(64));
            for _ in 0..len {
                values.push(decode_value(buf)?);
            }
            Ok(if tag == TAG_LIST {
                Value::List(values)
            } else {
                Value::Struct(values)
            })
        }
        other => Err(CodecError::UnknownTag(other)),
    }
}

fn put_escaped(buf: &mut BytesMut, bytes: &[u8]) {
    for chunk in bytes.split_inclusive(|b| *b == ESCAPE) {
        buf.put_slice(chunk);
        if chunk.last() == Some(&ESCAPE) {
            buf.put_u8(ESCAPED_ZERO);
        }
    }
    buf.put_u8(ESCAPE);
    buf.put_u8(TERMINATOR);
}

fn get_escaped(buf: &mut &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    loop {
        let Some(pos) = buf.iter().position(|b| *b == ESCAPE) else {
            return Err(CodecError::Truncated);
        };
        need(buf, pos + 2)?;
        out.extend_from_slice(&buf[..pos]);
        let marker = buf[pos + 1];
        buf.advance(pos + 2);
        match marker {
            TERMINATOR => return Ok(out),
            ESCAPED_ZERO => out.push(ESCAPE),
            other => return Err(CodecError::UnknownTag(other)),
        }
    }
}

fn put_len(buf: &mut BytesMut, len: usize) {
    buf.put_u32(u32::try_from(len).unwrap_or(u32::MAX));
}

fn get_len(buf: &mut &[u8]) -> Result<usize, CodecError> {
    need(buf, 4)?;
    usize::try_from(buf.get_u32()).map_err(|_| CodecError::Truncated)
}

fn need(buf: &&[u8], n: usize) -> Result<(), CodecError> {
    if buf.remaining() < n {
        Err(CodecError::Truncated)
    } else {
        Ok(())
    }
}

/// Codec for attribute values, keyed by field type.
pub trait ValueSerde: Send + Sync {
    /// Appends `value`, declared as `ty`, to `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TypeMismatch`] if `value` does not conform to `ty`.
    fn encode(&self, ty: &FieldType, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError>;

    /// Reads a value declared as `ty` from the front of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on malformed input or a type mismatch.
    fn decode(&self, ty: &FieldType, buf: &mut &[u8]) -> Result<Value, CodecError>;
}

/// The default [`ValueSerde`]: tagged encoding with type checks on both sides.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaggedValueSerde;

impl ValueSerde for TaggedValueSerde {
    fn encode(&self, ty: &FieldType, value: &Value, buf: &mut BytesMut) -> Result<(), CodecError> {
        check_type(ty, value)?;
        encode_value(value, buf);
        Ok(())
    }

    fn decode(&self, ty: &FieldType, buf: &mut &[u8]) -> Result<Value, CodecError> {
        let value = decode_value(buf)?;
        check_type(ty, &value)?;
        Ok(value)
    }
}

fn check_type(ty: &FieldType, value: &Value) -> Result<(), CodecError> {
    if value.matches(ty) {
        Ok(())
    } else {
        Err(CodecError::TypeMismatch {
            expected: ty.to_string(),
            value: value.to_string(),
        })
    }
}

/// Serialized form of [`Linkage`]: JSON with node ids as array entries.
#[derive(Serialize, Deserialize)]
struct LinkageRepr {
    inputs: Vec<(NodeId, Vec<Id>)>,
    outputs: Vec<(NodeId, Vec<Id>)>,
}

/// Converts states to and from their durable [`StorageState`] form using
/// the stateful node schemas of one plan.
pub struct SerdeManager {
    value_serde: Arc<dyn ValueSerde>,
    schemas: FxHashMap<NodeId, Vec<FieldType>>,
}

impl SerdeManager {
    /// Registers the schema of every stateful node in `plan`.
    #[must_use]
    pub fn new(plan: &Plan, value_serde: Arc<dyn ValueSerde>) -> Self {
        let schemas = plan
            .stateful_nodes()
            .map(|node| {
                let types = node.fields().iter().map(|f| f.ty.clone()).collect();
                (node.id(), types)
            })
            .collect();
        Self {
            value_serde,
            schemas,
        }
    }

    fn schema(&self, node: NodeId) -> Result<&[FieldType], CodecError> {
        self.schemas
            .get(&node)
            .map(Vec::as_slice)
            .ok_or(CodecError::UnknownNode(node))
    }

    /// Encodes one attribute row of `node`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on an arity or type mismatch.
    pub fn encode_attributes(&self, node: NodeId, values: &[Value]) -> Result<Bytes, CodecError> {
        let types = self.schema(node)?;
        if types.len() != values.len() {
            return Err(CodecError::Arity {
                expected: types.len(),
                actual: values.len(),
            });
        }
        let mut buf = BytesMut::new();
        for (ty, value) in types.iter().zip(values) {
            self.value_serde.encode(ty, value, &mut buf)?;
        }
        Ok(buf.freeze())
    }

    /// Decodes one attribute row of `node`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on malformed input.
    pub fn decode_attributes(&self, node: NodeId, mut bytes: &[u8]) -> Result<Vec<Value>, CodecError> {
        let types = self.schema(node)?;
        let values = types
            .iter()
            .map(|ty| self.value_serde.decode(ty, &mut bytes))
            .collect::<Result<Vec<_>, _>>()?;
        if bytes.has_remaining() {
            return Err(CodecError::TrailingBytes(bytes.remaining()));
        }
        Ok(values)
    }

    /// Encodes a state linkage.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] if serialization fails.
    pub fn encode_linkage(&self, linkage: &Linkage) -> Result<Bytes, CodecError> {
        let flatten = |side: &std::collections::BTreeMap<NodeId, std::collections::BTreeSet<Id>>| {
            side.iter()
                .map(|(node, ids)| (*node, ids.iter().cloned().collect()))
                .collect()
        };
        let repr = LinkageRepr {
            inputs: flatten(linkage.inputs()),
            outputs: flatten(linkage.outputs()),
        };
        Ok(Bytes::from(serde_json::to_vec(&repr)?))
    }

    /// Decodes a state linkage.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] on malformed input.
    pub fn decode_linkage(&self, bytes: &[u8]) -> Result<Linkage, CodecError> {
        let repr: LinkageRepr = serde_json::from_slice(bytes)?;
        let mut linkage = Linkage::default();
        for (node, ids) in repr.inputs {
            for id in ids {
                linkage.add_input(node, id);
            }
        }
        for (node, ids) in repr.outputs {
            for id in ids {
                linkage.add_output(node, id);
            }
        }
        Ok(linkage)
    }

    /// Produces the durable snapshot of `state`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if attributes or linkage fail to encode.
    pub fn encode_state(&self, state: &State) -> Result<StorageState, CodecError> {
        let attributes = match state.raw_attributes() {
            Some(values) => Some(self.encode_attributes(state.key().node, values)?),
            None => None,
        };
        let linkage = if state.linkage().is_empty() {
            None
        } else {
            Some(self.encode_linkage(state.linkage())?)
        };
        Ok(StorageState {
            node: state.key().node,
            id: state.key().id.clone(),
            version: state.version(),
            created: false,
            invalid: state.mode() == Mode::Invalid,
            attributes,
            linkage,
        })
    }

    /// Rebuilds a cached state from its durable snapshot.
    ///
    /// Created placeholders load as `Phantom`, invalid markers as `Invalid`,
    /// and everything else as `Shared` or `Exclusive` depending on `share`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if attributes or linkage fail to decode.
    pub fn decode_state(&self, stored: &StorageState, share: bool) -> Result<State, CodecError> {
        let key = StateKey::new(stored.node, stored.id.clone());
        let mode = if stored.created {
            Mode::Phantom
        } else if stored.invalid {
            Mode::Invalid
        } else if share {
            Mode::Shared
        } else {
            Mode::Exclusive
        };
        let attributes = match &stored.attributes {
            Some(bytes) if !stored.created => Some(Arc::from(self.decode_attributes(stored.node, bytes)?)),
            _ => None,
        };
        let linkage = match &stored.linkage {
            Some(bytes) => self.decode_linkage(bytes)?,
            None => Linkage::default(),
        };
        Ok(State::restore(key, mode, stored.version, attributes, linkage))
    }
}

impl std::fmt::Debug for SerdeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerdeManager")
            .field("nodes", &self.schemas.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_tuple_roundtrip() {
        let values = vec![
            Value::Null,
            Value::Boolean(true),
            Value::Long(-3),
            Value::Double(1.5),
            Value::String("héllo".into()),
            Value::Bytes(vec![0, 1, 2]),
            Value::List(vec![Value::Struct(vec![1.into(), "x".into()])]),
        ];
        assert_eq!(decode_tuple(&encode_tuple(&values)).unwrap(), values);
    }

    #[test]
    fn test_long_encoding_preserves_order() {
        let ordered = [i64::MIN, -10, -1, 0, 1, 42, i64::MAX];
        let encoded: Vec<Bytes> = ordered
            .iter()
            .map(|v| encode_tuple(&[Value::Long(*v)]))
            .collect();
        assert!(encoded.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_double_encoding_preserves_order() {
        let ordered = [f64::NEG_INFINITY, -1.5e10, -2.0, -0.5, 0.0, 0.25, 3.0, f64::INFINITY];
        let encoded: Vec<Bytes> = ordered
            .iter()
            .map(|v| encode_tuple(&[Value::Double(*v)]))
            .collect();
        assert!(encoded.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(decode_tuple(&encoded[1]).unwrap(), vec![Value::Double(-1.5e10)]);
    }

    #[test]
    fn test_string_and_bytes_encoding_is_lexicographic() {
        let ordered = ["", "a", "a\0", "a\u{1}", "ab", "b"];
        let encoded: Vec<Bytes> = ordered
            .iter()
            .map(|v| encode_tuple(&[Value::from(*v)]))
            .collect();
        assert!(encoded.windows(2).all(|w| w[0] < w[1]));

        let raw = vec![0, 0xFF, 0, 7];
        let bytes = encode_tuple(&[Value::Bytes(raw.clone())]);
        assert_eq!(decode_tuple(&bytes).unwrap(), vec![Value::Bytes(raw)]);
    }

    #[test]
    fn test_truncated_input_is_rejected() {
        let bytes = encode_tuple(&["abcdef".into()]);
        let err = decode_tuple(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated));
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        let mut bytes = encode_tuple(&[1.into()]).to_vec();
        bytes.push(0);
        assert!(matches!(
            decode_tuple(&bytes),
            Err(CodecError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_tagged_serde_checks_types() {
        let serde = TaggedValueSerde;
        let mut buf = BytesMut::new();
        let err = serde
            .encode(&FieldType::Long, &"x".into(), &mut buf)
            .unwrap_err();
        assert!(matches!(err, CodecError::TypeMismatch { .. }));

        serde.encode(&FieldType::String, &"x".into(), &mut buf).unwrap();
        let mut slice: &[u8] = &buf;
        assert!(serde.decode(&FieldType::Long, &mut slice).is_err());
    }
}
