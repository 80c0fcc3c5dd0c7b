//! Serialization codecs (part of C10's registry, contract defined in §6):
//! a stateless, synchronous pair that turns a protocol envelope
//! (`serde_json::Value`) into bytes and back, identified by a stable
//! `name` and `contentType`.

mod json;
mod registry;

pub use json::JsonCodec;
pub use registry::CodecRegistry;

use bytes::Bytes;
use serde_json::Value as JsonValue;

use crate::error::ProtocolError;

/// `serialize`/`deserialize` are required to be synchronous and, for any
/// codec used where a caller signs or deduplicates on the encoded bytes,
/// deterministic for the same input.
pub trait Codec: Send + Sync {
    fn name(&self) -> &str;

    fn content_type(&self) -> &str;

    fn serialize(&self, value: &JsonValue) -> Result<Bytes, ProtocolError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<JsonValue, ProtocolError>;
}
