//! JSON-RPC 2.0 envelopes.
//!
//! Classification happens in two steps, mirroring the wire rules: first decide
//! whether the object carries an `id` and whether it carries `method`,
//! `result`, or `error`; then refine into the concrete variant. Anything that
//! fails refinement becomes a [`Malformed`] value that preserves the request
//! id when one could be recovered, so the endpoint can still answer with an
//! `Invalid request` error.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Implementation-defined: the inbound request queue overflowed.
pub const SERVER_OVERLOADED: i64 = -32000;

/// A JSON-RPC request id: a string or a 64-bit integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Id {
    String(String),
    Integer(i64),
}

impl From<i64> for Id {
    fn from(value: i64) -> Self {
        Id::Integer(value)
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Id::String(value.to_string())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::String(s) => s.fmt(f),
            Id::Integer(n) => n.fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// A decoded JSON-RPC 2.0 envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: Id,
        method: String,
        params: Option<Value>,
    },
    Response {
        id: Id,
        result: Value,
    },
    /// `id` is `None` when the envelope echoes a JSON `null` id, as error
    /// responses to unparseable requests do.
    Error {
        id: Option<Id>,
        error: RpcError,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

/// An envelope that failed classification.
///
/// `id` is populated when a valid request id could be recovered, in which
/// case the endpoint answers with an error response carrying `code`. For
/// request-shaped envelopes whose id is present but not a valid id, `raw_id`
/// preserves the verbatim value so the reply can still echo it (normalized to
/// `null`). With neither, the message is dropped with a log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Malformed {
    pub id: Option<Id>,
    pub raw_id: Option<Value>,
    pub code: i64,
    pub message: String,
}

impl Malformed {
    fn new(id: Option<Id>, raw_id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            raw_id,
            code,
            message: message.into(),
        }
    }
}

impl Message {
    pub fn request(id: Id, method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Request {
            id,
            method: method.into(),
            params: params.filter(|v| !v.is_null()),
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Notification {
            method: method.into(),
            params: params.filter(|v| !v.is_null()),
        }
    }

    pub fn response(id: Id, result: Value) -> Self {
        Message::Response { id, result }
    }

    pub fn error(id: Id, error: RpcError) -> Self {
        Message::Error {
            id: Some(id),
            error,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => Some(method),
            _ => None,
        }
    }

    pub fn id(&self) -> Option<&Id> {
        match self {
            Message::Request { id, .. } | Message::Response { id, .. } => Some(id),
            Message::Error { id, .. } => id.as_ref(),
            Message::Notification { .. } => None,
        }
    }

    /// Classifies a raw JSON value into an envelope.
    pub fn from_value(value: Value) -> Result<Message, Malformed> {
        let Value::Object(map) = value else {
            return Err(Malformed::new(
                None,
                None,
                INVALID_REQUEST,
                "json-rpc message must be an object",
            ));
        };

        let raw_id = map.get("id").cloned();
        let recovered_id = raw_id.as_ref().and_then(parse_id);
        let request_shaped = map.contains_key("method");
        // Only request-shaped envelopes get their raw id echoed back; a
        // response with a broken id has nothing useful to correlate against.
        let echo_raw = if request_shaped && recovered_id.is_none() {
            raw_id.clone()
        } else {
            None
        };

        if map.get("jsonrpc").and_then(|v| v.as_str()) != Some(JSONRPC_VERSION) {
            return Err(Malformed::new(
                recovered_id,
                echo_raw,
                INVALID_REQUEST,
                "invalid jsonrpc version",
            ));
        }

        if let Some(method_value) = map.get("method") {
            let Some(method) = method_value.as_str() else {
                return Err(Malformed::new(
                    recovered_id,
                    echo_raw,
                    INVALID_REQUEST,
                    "method must be a string",
                ));
            };
            let params = map.get("params").cloned().filter(|v| !v.is_null());

            return match raw_id {
                Some(raw) => {
                    let Some(id) = recovered_id else {
                        return Err(Malformed::new(
                            None,
                            Some(raw),
                            INVALID_REQUEST,
                            "invalid request id",
                        ));
                    };
                    Ok(Message::Request {
                        id,
                        method: method.to_string(),
                        params,
                    })
                }
                None => Ok(Message::Notification {
                    method: method.to_string(),
                    params,
                }),
            };
        }

        // No method: this must be a response. A `null` id is accepted on
        // error responses only (the peer answering something it could not
        // parse); results must correlate.
        let id_is_null = matches!(raw_id, Some(Value::Null));

        match (map.get("result"), map.get("error")) {
            (Some(result), None) => {
                let Some(id) = recovered_id else {
                    return Err(Malformed::new(
                        None,
                        None,
                        INVALID_REQUEST,
                        "response without a valid id",
                    ));
                };
                Ok(Message::Response {
                    id,
                    result: result.clone(),
                })
            }
            (None, Some(error)) => {
                if recovered_id.is_none() && !id_is_null {
                    return Err(Malformed::new(
                        None,
                        None,
                        INVALID_REQUEST,
                        "response without a valid id",
                    ));
                }
                let error = parse_rpc_error(error).ok_or_else(|| {
                    Malformed::new(
                        recovered_id.clone(),
                        None,
                        INVALID_REQUEST,
                        "invalid error response",
                    )
                })?;
                Ok(Message::Error {
                    id: recovered_id,
                    error,
                })
            }
            _ => Err(Malformed::new(
                recovered_id,
                None,
                INVALID_REQUEST,
                "response must include exactly one of result/error",
            )),
        }
    }

    /// Encodes this envelope back into a raw JSON value.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(
            "jsonrpc".to_string(),
            Value::String(JSONRPC_VERSION.to_string()),
        );
        match self {
            Message::Request { id, method, params } => {
                map.insert("id".to_string(), id_to_value(id));
                map.insert("method".to_string(), Value::String(method.clone()));
                if let Some(params) = params {
                    map.insert("params".to_string(), params.clone());
                }
            }
            Message::Response { id, result } => {
                map.insert("id".to_string(), id_to_value(id));
                map.insert("result".to_string(), result.clone());
            }
            Message::Error { id, error } => {
                let mut err = Map::new();
                err.insert("code".to_string(), Value::Number(error.code.into()));
                err.insert("message".to_string(), Value::String(error.message.clone()));
                if let Some(data) = &error.data {
                    err.insert("data".to_string(), data.clone());
                }
                let id = id.as_ref().map(id_to_value).unwrap_or(Value::Null);
                map.insert("id".to_string(), id);
                map.insert("error".to_string(), Value::Object(err));
            }
            Message::Notification { method, params } => {
                map.insert("method".to_string(), Value::String(method.clone()));
                if let Some(params) = params {
                    map.insert("params".to_string(), params.clone());
                }
            }
        }
        Value::Object(map)
    }
}

fn id_to_value(id: &Id) -> Value {
    match id {
        Id::String(s) => Value::String(s.clone()),
        Id::Integer(n) => Value::Number((*n).into()),
    }
}

pub(crate) fn parse_id(value: &Value) -> Option<Id> {
    match value {
        Value::String(value) => Some(Id::String(value.clone())),
        Value::Number(value) => value.as_i64().map(Id::Integer).or_else(|| {
            value
                .as_u64()
                .and_then(|v| i64::try_from(v).ok())
                .map(Id::Integer)
        }),
        _ => None,
    }
}

fn parse_rpc_error(value: &Value) -> Option<RpcError> {
    let Value::Object(map) = value else {
        return None;
    };
    let code = map.get("code")?.as_i64()?;
    let message = map.get("message")?.as_str()?.to_string();
    let data = map.get("data").cloned();
    Some(RpcError {
        code,
        message,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(message: Message) {
        let value = message.to_value();
        let decoded = Message::from_value(value).expect("classify");
        assert_eq!(decoded, message);
    }

    #[test]
    fn envelope_roundtrips() {
        roundtrip(Message::request(
            Id::Integer(0),
            "tools/call",
            Some(json!({ "name": "echo", "arguments": { "x": 1 } })),
        ));
        roundtrip(Message::request(Id::String("abc".into()), "ping", None));
        roundtrip(Message::response(Id::Integer(7), json!({ "ok": true })));
        roundtrip(Message::error(
            Id::Integer(7),
            RpcError::new(METHOD_NOT_FOUND, "method not found").with_data(json!({ "m": "x" })),
        ));
        roundtrip(Message::Error {
            id: None,
            error: RpcError::new(INVALID_REQUEST, "invalid request"),
        });
        roundtrip(Message::notification(
            "notifications/initialized",
            Some(json!({})),
        ));
        roundtrip(Message::notification("notifications/tools/list_changed", None));
    }

    #[test]
    fn classifies_response_before_request() {
        let value = json!({ "jsonrpc": "2.0", "id": 3, "result": {} });
        assert!(matches!(
            Message::from_value(value).unwrap(),
            Message::Response { id: Id::Integer(3), .. }
        ));
    }

    #[test]
    fn request_and_notification_split_on_id() {
        let with_id = json!({ "jsonrpc": "2.0", "id": "r-1", "method": "roots/list" });
        assert!(matches!(
            Message::from_value(with_id).unwrap(),
            Message::Request { .. }
        ));

        let without_id = json!({ "jsonrpc": "2.0", "method": "notifications/progress" });
        assert!(matches!(
            Message::from_value(without_id).unwrap(),
            Message::Notification { .. }
        ));
    }

    #[test]
    fn rejects_wrong_jsonrpc_version_but_recovers_id() {
        let value = json!({ "jsonrpc": "1.0", "id": 5, "method": "ping" });
        let malformed = Message::from_value(value).unwrap_err();
        assert_eq!(malformed.id, Some(Id::Integer(5)));
        assert_eq!(malformed.code, INVALID_REQUEST);
    }

    #[test]
    fn rejects_non_string_method() {
        let value = json!({ "jsonrpc": "2.0", "id": 1, "method": 42 });
        let malformed = Message::from_value(value).unwrap_err();
        assert_eq!(malformed.id, Some(Id::Integer(1)));
    }

    #[test]
    fn invalid_request_id_is_preserved_verbatim_for_the_reply() {
        let value = json!({ "jsonrpc": "2.0", "id": [1], "method": "ping" });
        let malformed = Message::from_value(value).unwrap_err();
        assert_eq!(malformed.id, None);
        assert_eq!(malformed.raw_id, Some(json!([1])));
    }

    #[test]
    fn null_id_error_response_classifies() {
        let value = json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": { "code": -32700, "message": "parse error" },
        });
        let message = Message::from_value(value).unwrap();
        assert!(matches!(message, Message::Error { id: None, .. }));
    }

    #[test]
    fn null_id_result_response_is_rejected() {
        let value = json!({ "jsonrpc": "2.0", "id": null, "result": {} });
        let malformed = Message::from_value(value).unwrap_err();
        assert_eq!(malformed.id, None);
        assert_eq!(malformed.raw_id, None);
    }

    #[test]
    fn rejects_result_and_error_together() {
        let value = json!({ "jsonrpc": "2.0", "id": 2, "result": {}, "error": { "code": 1, "message": "x" } });
        let malformed = Message::from_value(value).unwrap_err();
        assert_eq!(malformed.id, Some(Id::Integer(2)));
    }

    #[test]
    fn rejects_non_object_message() {
        let malformed = Message::from_value(json!(42)).unwrap_err();
        assert_eq!(malformed.id, None);
    }

    #[test]
    fn id_parses_u64_within_i64_range() {
        assert_eq!(parse_id(&json!(9)), Some(Id::Integer(9)));
        assert_eq!(parse_id(&json!(u64::MAX)), None);
        assert_eq!(parse_id(&json!(1.5)), None);
    }

    #[test]
    fn null_params_are_omitted() {
        let message = Message::request(Id::Integer(1), "ping", Some(Value::Null));
        let value = message.to_value();
        assert!(value.get("params").is_none());
    }
}
