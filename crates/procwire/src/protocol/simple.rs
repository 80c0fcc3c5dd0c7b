use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::{json, Value as JsonValue};

use crate::value::Value;

use super::{params_of, ParsedMessage, Protocol, RemoteErrorPayload, RequestId, ResponseOutcome};

/// Same shape as JSON-RPC but tagged with an explicit `type` field instead
/// of a version string, and responses may legally carry both `result` and
/// `error` — the channel's response accessor decides which wins. This
/// implementation's accessor prefers `error` (see `DESIGN.md`).
pub struct SimpleProtocol {
    next_id: AtomicI64,
}

impl Default for SimpleProtocol {
    fn default() -> Self {
        Self {
            next_id: AtomicI64::new(1),
        }
    }
}

impl Protocol for SimpleProtocol {
    fn next_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn create_request(&self, id: &RequestId, method: &str, params: &Value) -> JsonValue {
        json!({
            "type": "request",
            "id": id.to_json(),
            "method": method,
            "params": params,
        })
    }

    fn create_response(&self, id: &RequestId, result: &Value) -> JsonValue {
        json!({
            "type": "response",
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
            "type": "response",
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
            "type": "notification",
            "method": method,
            "params": params,
        })
    }

    fn parse_message(&self, data: &JsonValue) -> ParsedMessage {
        let Some(obj) = data.as_object() else {
            return ParsedMessage::Invalid { id: None };
        };

        let recoverable_id = obj.get("id").and_then(RequestId::from_json);

        let message_type = match obj.get("type").and_then(JsonValue::as_str) {
            Some(t) => t,
            None => return ParsedMessage::Invalid { id: recoverable_id },
        };

        match message_type {
            "request" => {
                let Some(id) = obj.get("id").and_then(RequestId::from_json) else {
                    return ParsedMessage::Invalid { id: recoverable_id };
                };
                let Some(method) = obj.get("method").and_then(JsonValue::as_str) else {
                    return ParsedMessage::Invalid { id: Some(id) };
                };
                if method.is_empty() {
                    return ParsedMessage::Invalid { id: Some(id) };
                }
                ParsedMessage::Request {
                    id,
                    method: method.to_string(),
                    params: params_of(data, "params"),
                }
            }
            "response" => {
                let Some(id) = obj.get("id").and_then(RequestId::from_json) else {
                    return ParsedMessage::Invalid { id: recoverable_id };
                };
                let has_result = obj.contains_key("result");
                let has_error = obj.contains_key("error");
                if !has_result && !has_error {
                    return ParsedMessage::Invalid { id: Some(id) };
                }
                // Both present is legal for this protocol; error wins.
                let outcome = if has_error {
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
                    ResponseOutcome::Err(RemoteErrorPayload {
                        code,
                        message,
                        data: error_data,
                    })
                } else {
                    ResponseOutcome::Ok(params_of(data, "result"))
                };
                ParsedMessage::Response { id, outcome }
            }
            "notification" => {
                let Some(method) = obj.get("method").and_then(JsonValue::as_str) else {
                    return ParsedMessage::Invalid { id: recoverable_id };
                };
                if method.is_empty() {
                    return ParsedMessage::Invalid { id: recoverable_id };
                }
                ParsedMessage::Notification {
                    method: method.to_string(),
                    params: params_of(data, "params"),
                }
            }
            _ => ParsedMessage::Invalid { id: recoverable_id },
        }
    }
}
