//! Tagged payload values and their MessagePack encoding
//!
//! Payloads are heterogeneous. Rather than reflect over arbitrary types, every
//! payload element is a [`Value`]; handlers match on the variant they expect.

use std::collections::BTreeMap;
use std::io::Cursor;

use super::CodecError;

/// Map key: MessagePack maps are keyed by strings or byte strings
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MapKey {
    Str(String),
    Bytes(Vec<u8>),
}

impl MapKey {
    /// Raw bytes of the key regardless of variant
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MapKey::Str(s) => s.as_bytes(),
            MapKey::Bytes(b) => b,
        }
    }
}

impl From<&str> for MapKey {
    fn from(s: &str) -> Self {
        MapKey::Str(s.to_string())
    }
}

impl From<String> for MapKey {
    fn from(s: String) -> Self {
        MapKey::Str(s)
    }
}

impl From<Vec<u8>> for MapKey {
    fn from(b: Vec<u8>) -> Self {
        MapKey::Bytes(b)
    }
}

impl From<&[u8]> for MapKey {
    fn from(b: &[u8]) -> Self {
        MapKey::Bytes(b.to_vec())
    }
}

/// A packable value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<MapKey, Value>),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Bytes of a `Bytes` or `Str` value.
    ///
    /// Ids and keys may arrive as either; callers that only care about the
    /// octets use this.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Str(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// A `Str`, or a `Bytes` that holds valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<MapKey, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Short name of the variant, for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Build a map value from `(key, value)` pairs
    pub fn map<K, V, I>(pairs: I) -> Self
    where
        K: Into<MapKey>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    fn to_rmpv(&self) -> rmpv::Value {
        match self {
            Value::Nil => rmpv::Value::Nil,
            Value::Bool(b) => rmpv::Value::Boolean(*b),
            Value::Int(i) => rmpv::Value::from(*i),
            Value::Float(f) => rmpv::Value::F64(*f),
            Value::Bytes(b) => rmpv::Value::Binary(b.clone()),
            Value::Str(s) => rmpv::Value::String(s.as_str().into()),
            Value::List(items) => rmpv::Value::Array(items.iter().map(Value::to_rmpv).collect()),
            Value::Map(map) => rmpv::Value::Map(
                map.iter()
                    .map(|(k, v)| {
                        let key = match k {
                            MapKey::Str(s) => rmpv::Value::String(s.as_str().into()),
                            MapKey::Bytes(b) => rmpv::Value::Binary(b.clone()),
                        };
                        (key, v.to_rmpv())
                    })
                    .collect(),
            ),
        }
    }

    fn from_rmpv(value: rmpv::Value) -> Result<Self, CodecError> {
        Ok(match value {
            rmpv::Value::Nil => Value::Nil,
            rmpv::Value::Boolean(b) => Value::Bool(b),
            rmpv::Value::Integer(i) => match i.as_i64() {
                Some(v) => Value::Int(v),
                None => {
                    return Err(CodecError::UnsupportedType(format!(
                        "integer {} exceeds i64",
                        i
                    )))
                }
            },
            rmpv::Value::F32(f) => Value::Float(f as f64),
            rmpv::Value::F64(f) => Value::Float(f),
            rmpv::Value::String(s) => {
                if s.is_str() {
                    Value::Str(s.into_str().unwrap_or_default())
                } else {
                    Value::Bytes(s.into_bytes())
                }
            }
            rmpv::Value::Binary(b) => Value::Bytes(b),
            rmpv::Value::Array(items) => Value::List(
                items
                    .into_iter()
                    .map(Value::from_rmpv)
                    .collect::<Result<_, _>>()?,
            ),
            rmpv::Value::Map(pairs) => {
                let mut map = BTreeMap::new();
                for (k, v) in pairs {
                    let key = match Value::from_rmpv(k)? {
                        Value::Str(s) => MapKey::Str(s),
                        Value::Bytes(b) => MapKey::Bytes(b),
                        other => {
                            return Err(CodecError::UnsupportedType(format!(
                                "map key of type {}",
                                other.type_name()
                            )))
                        }
                    };
                    map.insert(key, Value::from_rmpv(v)?);
                }
                Value::Map(map)
            }
            rmpv::Value::Ext(tag, _) => {
                return Err(CodecError::UnsupportedType(format!("ext type {}", tag)))
            }
        })
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<u16> for Value {
    fn from(i: u16) -> Self {
        Value::Int(i as i64)
    }
}

impl From<u8> for Value {
    fn from(i: u8) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Value {
    fn from(b: &[u8; N]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<MapKey, Value>> for Value {
    fn from(map: BTreeMap<MapKey, Value>) -> Self {
        Value::Map(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Nil)
    }
}

/// Encode a value as MessagePack
pub fn pack(value: &Value) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &value.to_rmpv())
        .map_err(|e| CodecError::Pack(e.to_string()))?;
    Ok(buf)
}

/// Decode exactly one MessagePack value; trailing bytes are an error
pub fn unpack(data: &[u8]) -> Result<Value, CodecError> {
    let mut cursor = Cursor::new(data);
    let raw = rmpv::decode::read_value(&mut cursor).map_err(|e| CodecError::Unpack(e.to_string()))?;
    let consumed = cursor.position() as usize;
    if consumed != data.len() {
        return Err(CodecError::Unpack(format!(
            "{} trailing bytes after value",
            data.len() - consumed
        )));
    }
    Value::from_rmpv(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Nil),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            (-1.0e12f64..1.0e12).prop_map(Value::Float),
            proptest::collection::vec(any::<u8>(), 0..32).prop_map(Value::Bytes),
            "[a-z0-9]{0,16}".prop_map(Value::Str),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::List),
                proptest::collection::btree_map("[a-z]{1,6}".prop_map(MapKey::Str), inner, 0..6)
                    .prop_map(Value::Map),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_pack_unpack_identity(v in arb_value()) {
            let packed = pack(&v).unwrap();
            prop_assert_eq!(unpack(&packed).unwrap(), v);
        }
    }

    #[test]
    fn test_scalars_roundtrip() {
        for v in [
            Value::Nil,
            Value::Bool(true),
            Value::Int(-42),
            Value::Int(i64::MAX),
            Value::Float(1.5),
            Value::from("hello"),
            Value::from(b"hello"),
        ] {
            assert_eq!(unpack(&pack(&v).unwrap()).unwrap(), v);
        }
    }

    #[test]
    fn test_bytes_and_str_stay_distinct() {
        let b = unpack(&pack(&Value::from(b"id")).unwrap()).unwrap();
        let s = unpack(&pack(&Value::from("id")).unwrap()).unwrap();
        assert!(matches!(b, Value::Bytes(_)));
        assert!(matches!(s, Value::Str(_)));
        assert_eq!(b.as_bytes(), s.as_bytes());
    }

    #[test]
    fn test_map_with_mixed_keys() {
        let mut map = BTreeMap::new();
        map.insert(MapKey::from("x"), Value::Int(1));
        map.insert(MapKey::from(b"y".as_slice()), Value::Int(2));
        let v = Value::Map(map);
        assert_eq!(unpack(&pack(&v).unwrap()).unwrap(), v);
    }

    #[test]
    fn test_u64_overflow_rejected() {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &rmpv::Value::from(u64::MAX)).unwrap();
        assert!(matches!(unpack(&buf), Err(CodecError::UnsupportedType(_))));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut buf = pack(&Value::Int(7)).unwrap();
        buf.push(0xc0);
        assert!(matches!(unpack(&buf), Err(CodecError::Unpack(_))));
    }

    #[test]
    fn test_truncated_rejected() {
        let buf = pack(&Value::from("a longer string")).unwrap();
        assert!(unpack(&buf[..buf.len() - 3]).is_err());
    }

    #[test]
    fn test_map_builder() {
        let v = Value::map([("x", 1i64), ("y", 2i64)]);
        let map = v.as_map().unwrap();
        assert_eq!(map.get(&MapKey::from("x")), Some(&Value::Int(1)));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_option_into_value() {
        assert_eq!(Value::from(None::<i64>), Value::Nil);
        assert_eq!(Value::from(Some("a")), Value::from("a"));
    }
}
