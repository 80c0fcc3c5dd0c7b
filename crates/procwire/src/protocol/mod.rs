//! Envelope classification and construction (C4): two interchangeable
//! protocols share one interface, each producing and parsing wire envelopes
//! as `serde_json::Value` (the serialization codec turns that into bytes).

mod jsonrpc;
mod simple;

pub use jsonrpc::JsonRpcProtocol;
pub use simple::SimpleProtocol;

use serde_json::Value as JsonValue;

use crate::value::Value;

/// Reserved method names owned by the runtime (§6); never delivered to an
/// application handler.
pub const METHOD_SHUTDOWN: &str = "__shutdown__";
pub const NOTIFICATION_SHUTDOWN_COMPLETE: &str = "__shutdown_complete__";
pub const NOTIFICATION_HEARTBEAT_PING: &str = "__heartbeat_ping__";
pub const NOTIFICATION_HEARTBEAT_PONG: &str = "__heartbeat_pong__";

/// JSON-RPC's fixed error-code table (§3).
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Correlation id. JSON-RPC permits string, number, or null ids on the wire
/// (§4.4); the channel itself never generates `Null` for a request it
/// expects to correlate, since a null id carries no correlation power.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RequestId {
    Number(i64),
    String(String),
    Null,
}

impl RequestId {
    pub(crate) fn to_json(&self) -> JsonValue {
        match self {
            RequestId::Number(n) => JsonValue::from(*n),
            RequestId::String(s) => JsonValue::String(s.clone()),
            RequestId::Null => JsonValue::Null,
        }
    }

    /// Accepts string, number, or null (the three wire-legal id shapes);
    /// any other JSON type (array, object, bool) is not a legal id.
    fn from_json(value: &JsonValue) -> Option<Self> {
        if value.is_null() {
            return Some(RequestId::Null);
        }
        if let Some(n) = value.as_i64() {
            return Some(RequestId::Number(n));
        }
        if let Some(s) = value.as_str() {
            return Some(RequestId::String(s.to_string()));
        }
        None
    }
}

#[derive(Clone, Debug)]
pub struct RemoteErrorPayload {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

#[derive(Debug)]
pub enum ResponseOutcome {
    Ok(Value),
    Err(RemoteErrorPayload),
}

/// Result of classifying one deserialized wire envelope.
#[derive(Debug)]
pub enum ParsedMessage {
    Request {
        id: RequestId,
        method: String,
        params: Value,
    },
    Response {
        id: RequestId,
        outcome: ResponseOutcome,
    },
    Notification {
        method: String,
        params: Value,
    },
    /// Not a well-formed request, response, or notification. `id` carries
    /// whatever correlation id could still be picked out of the envelope
    /// (e.g. an empty `method` alongside a legal `id`), so the channel can
    /// still reply with an error instead of silently dropping it.
    Invalid { id: Option<RequestId> },
}

/// A protocol's envelope shape, shared by JSON-RPC and the Simple protocol.
pub trait Protocol: Send + Sync {
    /// Monotonically increasing id generator owned by this protocol
    /// instance. The channel may override with an application-supplied id.
    fn next_id(&self) -> RequestId;

    fn create_request(&self, id: &RequestId, method: &str, params: &Value) -> JsonValue;

    fn create_response(&self, id: &RequestId, result: &Value) -> JsonValue;

    fn create_error_response(
        &self,
        id: &RequestId,
        code: i64,
        message: &str,
        data: Option<&Value>,
    ) -> JsonValue;

    fn create_notification(&self, method: &str, params: &Value) -> JsonValue;

    fn parse_message(&self, data: &JsonValue) -> ParsedMessage;
}

fn params_of(value: &JsonValue, key: &str) -> Value {
    value
        .get(key)
        .cloned()
        .map(Value::from)
        .unwrap_or(Value::Null)
}
