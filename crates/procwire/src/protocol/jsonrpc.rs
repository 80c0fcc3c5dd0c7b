use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::{json, Value as JsonValue};

use crate::value::Value;

use super::{params_of, ParsedMessage, Protocol, RemoteErrorPayload, RequestId, ResponseOutcome};

const VERSION: &str = "2.0";

/// JSON-RPC 2.0 envelopes, version-tagged, with a fixed error-code table.
pub struct JsonRpcProtocol {
    next_id: AtomicI64,
}

impl Default for JsonRpcProtocol {
    fn default() -> Self {
        Self {
            next_id: AtomicI64::new(1),
        }
    }
}

impl Protocol for JsonRpcProtocol {
    fn next_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn create_request(&self, id: &RequestId, method: &str, params: &Value) -> JsonValue {
        json!({
            "jsonrpc": VERSION,
            "id": id.to_json(),
            "method": method,
            "params": params,
        })
    }

    fn create_response(&self, id: &RequestId, result: &Value) -> JsonValue {
        json!({
            "jsonrpc": VERSION,
            "id": id.to_json(),
            "result": result,
        })
    }

    fn create_error_response(
        &self,
        id: &RequestId,
        code: i64,
        message: &str,
        data: Option<&Value>,
    ) -> JsonValue {
        json!({
            "jsonrpc": VERSION,
            "id": id.to_json(),
            "error": {
                "code": code,
                "message": message,
                "data": data,
            },
        })
    }

    fn create_notification(&self, method: &str, params: &Value) -> JsonValue {
        json!({
            "jsonrpc": VERSION,
            "method": method,
            "params": params,
        })
    }

    fn parse_message(&self, data: &JsonValue) -> ParsedMessage {
        let Some(obj) = data.as_object() else {
            return ParsedMessage::Invalid { id: None };
        };

        // Picked out up front so any `Invalid` return below can still carry
        // a correlation id, even when some other part of the envelope is
        // malformed (e.g. an empty `method`).
        let recoverable_id = obj.get("id").and_then(RequestId::from_json);

        match obj.get("jsonrpc") {
            Some(JsonValue::String(v)) if v == VERSION => {}
            _ => return ParsedMessage::Invalid { id: recoverable_id },
        }

        let id = obj.get("id");
        let method = obj.get("method");
        let has_result = obj.contains_key("result");
        let has_error = obj.contains_key("error");

        if let Some(id_value) = id {
            if let Some(method_value) = method {
                return match (RequestId::from_json(id_value), method_value.as_str()) {
                    (Some(id), Some(method)) if !method.is_empty() => ParsedMessage::Request {
                        id,
                        method: method.to_string(),
                        params: params_of(data, "params"),
                    },
                    _ => ParsedMessage::Invalid { id: recoverable_id },
                };
            }

            return match (has_result, has_error, RequestId::from_json(id_value)) {
                (true, false, Some(id)) => ParsedMessage::Response {
                    id,
                    outcome: ResponseOutcome::Ok(params_of(data, "result")),
                },
                (false, true, Some(id)) => {
                    let error_obj = obj.get("error").and_then(JsonValue::as_object);
                    let code = error_obj
                        .and_then(|e| e.get("code"))
                        .and_then(JsonValue::as_i64)
                        .unwrap_or(super::error_codes::INTERNAL_ERROR);
                    let message = error_obj
                        .and_then(|e| e.get("message"))
                        .and_then(JsonValue::as_str)
                        .unwrap_or("")
                        .to_string();
                    let error_data = error_obj
                        .and_then(|e| e.get("data"))
                        .cloned()
                        .map(Value::from);
                    ParsedMessage::Response {
                        id,
                        outcome: ResponseOutcome::Err(RemoteErrorPayload {
                            code,
                            message,
                            data: error_data,
                        }),
                    }
                }
                _ => ParsedMessage::Invalid { id: recoverable_id },
            };
        }

        if let Some(method_value) = method {
            if let Some(method) = method_value.as_str() {
                if !method.is_empty() {
                    return ParsedMessage::Notification {
                        method: method.to_string(),
                        params: params_of(data, "params"),
                    };
                }
            }
        }

        ParsedMessage::Invalid { id: recoverable_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_request() {
        let protocol = JsonRpcProtocol::default();
        let id = RequestId::Number(1);
        let envelope = protocol.create_request(&id, "echo", &Value::encode(&1).unwrap());
        match protocol.parse_message(&envelope) {
            ParsedMessage::Request { id, method, .. } => {
                assert_eq!(id, RequestId::Number(1));
                assert_eq!(method, "echo");
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn classifies_response_ok() {
        let protocol = JsonRpcProtocol::default();
        let envelope = serde_json::json!({"jsonrpc":"2.0","id":1,"result":{"x":1}});
        match protocol.parse_message(&envelope) {
            ParsedMessage::Response { id, outcome } => {
                assert_eq!(id, RequestId::Number(1));
                assert!(matches!(outcome, ResponseOutcome::Ok(_)));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn response_with_both_result_and_error_is_invalid() {
        let protocol = JsonRpcProtocol::default();
        let envelope =
            serde_json::json!({"jsonrpc":"2.0","id":1,"result":1,"error":{"code":-1,"message":"x"}});
        assert!(matches!(
            protocol.parse_message(&envelope),
            ParsedMessage::Invalid { .. }
        ));
    }

    #[test]
    fn missing_version_tag_is_invalid_but_id_is_recovered() {
        let protocol = JsonRpcProtocol::default();
        let envelope = serde_json::json!({"id":1,"method":"echo"});
        match protocol.parse_message(&envelope) {
            ParsedMessage::Invalid { id } => assert_eq!(id, Some(RequestId::Number(1))),
            other => panic!("expected invalid, got {other:?}"),
        }
    }

    #[test]
    fn classifies_notification() {
        let protocol = JsonRpcProtocol::default();
        let envelope = serde_json::json!({"jsonrpc":"2.0","method":"log","params":{"msg":"hi"}});
        assert!(matches!(
            protocol.parse_message(&envelope),
            ParsedMessage::Notification { .. }
        ));
    }

    #[test]
    fn empty_method_is_invalid_but_id_is_recovered() {
        let protocol = JsonRpcProtocol::default();
        let envelope = serde_json::json!({"jsonrpc":"2.0","id":1,"method":""});
        match protocol.parse_message(&envelope) {
            ParsedMessage::Invalid { id } => assert_eq!(id, Some(RequestId::Number(1))),
            other => panic!("expected invalid, got {other:?}"),
        }
    }

    #[test]
    fn ids_increase_monotonically() {
        let protocol = JsonRpcProtocol::default();
        let a = protocol.next_id();
        let b = protocol.next_id();
        assert_ne!(a, b);
    }
}
