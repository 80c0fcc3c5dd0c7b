//! Dynamic tagged value exchanged at the channel boundary.
//!
//! The channel never assumes a schema for request params or response
//! results; callers decode to their own static types via a serialization
//! codec. `Value` is the sum type that crosses that boundary.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Number;

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    #[serde(with = "bytes_as_base64")]
    Bytes(Bytes),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Value::Array(a) => f.debug_list().entries(a).finish(),
            Value::Map(m) => f.debug_map().entries(m.iter()).finish(),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Convert into a `T` via the JSON bridge. This is the typed-decode step
    /// most applications want at the channel boundary.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let json = serde_json::to_value(self)?;
        serde_json::from_value(json)
    }

    /// Build a `Value` from anything `Serialize`, via the JSON bridge.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_value(value)?;
        Ok(Value::from(json))
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(a) => Value::Array(a.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(m) => {
                Value::Map(m.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl TryFrom<Value> for serde_json::Value {
    type Error = serde_json::Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        serde_json::to_value(&value)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(Number::from(n))
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

mod bytes_as_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        // Tagged so the JSON bridge can tell a byte string apart from a
        // plain string on the way back in; `untagged` on `Value` means we
        // cannot rely on type alone.
        serializer.serialize_str(&format!("\u{0}base64:{}", STANDARD.encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(deserializer)?;
        let encoded = s
            .strip_prefix("\u{0}base64:")
            .ok_or_else(|| serde::de::Error::custom("not a tagged byte string"))?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_bridge_roundtrip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Point {
            x: i64,
            y: i64,
        }

        let value = Value::encode(&Point { x: 1, y: 2 }).unwrap();
        assert_eq!(value.as_map().unwrap().get("x").unwrap().as_i64(), Some(1));

        let back: Point = value.decode().unwrap();
        assert_eq!(back, Point { x: 1, y: 2 });
    }

    #[test]
    fn bytes_variant_roundtrips_through_json() {
        let original = Value::Bytes(Bytes::from_static(b"hello world"));
        let json = serde_json::to_value(&original).unwrap();
        let back: Value = serde_json::from_value(json).unwrap();
        assert_eq!(original, back);
    }

    #[test]
    fn null_is_default() {
        assert!(Value::default().is_null());
    }
}
