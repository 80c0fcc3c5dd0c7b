use bytes::Bytes;
use serde_json::Value as JsonValue;

use crate::error::ProtocolError;

use super::Codec;

/// The default serialization codec: UTF-8 JSON via `serde_json`.
#[derive(Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &str {
        "json"
    }

    fn content_type(&self) -> &str {
        "application/json"
    }

    fn serialize(&self, value: &JsonValue) -> Result<Bytes, ProtocolError> {
        let bytes = serde_json::to_vec(value)?;
        Ok(Bytes::from(bytes))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<JsonValue, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roundtrips_an_envelope() {
        let codec = JsonCodec;
        let envelope = json!({"jsonrpc":"2.0","id":1,"method":"echo","params":{"x":1}});
        let bytes = codec.serialize(&envelope).unwrap();
        let decoded = codec.deserialize(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn deserialize_rejects_malformed_json() {
        let codec = JsonCodec;
        assert!(codec.deserialize(b"{not json").is_err());
    }

    #[test]
    fn names_are_stable() {
        let codec = JsonCodec;
        assert_eq!(codec.name(), "json");
        assert_eq!(codec.content_type(), "application/json");
    }
}
