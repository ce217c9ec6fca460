// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! JSON-RPC 2.0 wire shapes shared by both directions of the transport:
//! client-to-server requests/responses and the server-to-client
//! `client/confirm`/`client/input` requests the RPC server issues on its own
//! initiative.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// A request/response id. Kept as a raw [`Value`] rather than a `String`/`i64`
/// union so whatever id shape a client sends (number or string) round-trips
/// unchanged, per the protocol's `decode(encode(m)) = m` property.
pub type RequestId = Value;

/// One line read off the transport, before it's known whether it's a request
/// or a notification (a request carries `id`; a notification omits it).
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub id: Option<RequestId>,
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    /// Present when this line is actually a *response* to one of the
    /// server's own `client/confirm`/`client/input` requests.
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ErrorObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    pub fn with_data(code: i64, message: impl Into<String>, data: Value) -> Self {
        Self { code, message: message.into(), data: Some(data) }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    pub fn ok(id: RequestId, result: Value) -> Self {
        Self { jsonrpc: "2.0", id, result: Some(result), error: None }
    }

    pub fn err(id: RequestId, error: ErrorObject) -> Self {
        Self { jsonrpc: "2.0", id, result: None, error: Some(error) }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutgoingNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl OutgoingNotification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self { jsonrpc: "2.0", method: method.into(), params: Some(params) }
    }
}

/// A server-initiated request (`client/confirm`, `client/input`); its `id`
/// is the `s2c-<n>` string the server assigned so the matching response can
/// be routed back to the waiting caller.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingRequest {
    pub jsonrpc: &'static str,
    pub id: String,
    pub method: &'static str,
    pub params: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_never_carries_both_result_and_error() {
        let ok = Response::ok(Value::from(1), serde_json::json!({"a": 1}));
        assert!(ok.error.is_none());
        let err = Response::err(Value::from(1), ErrorObject::new(METHOD_NOT_FOUND, "nope"));
        assert!(err.result.is_none());
    }

    #[test]
    fn incoming_message_with_no_id_is_a_notification() {
        let raw = r#"{"jsonrpc":"2.0","method":"initialized"}"#;
        let msg: IncomingMessage = serde_json::from_str(raw).unwrap();
        assert!(msg.id.is_none());
        assert_eq!(msg.method.as_deref(), Some("initialized"));
    }

    #[test]
    fn incoming_message_missing_jsonrpc_field_still_parses() {
        // Decoder (not this type) is responsible for rejecting it with -32600.
        let raw = r#"{"id":1,"method":"opal/ping"}"#;
        let msg: IncomingMessage = serde_json::from_str(raw).unwrap();
        assert!(msg.jsonrpc.is_none());
    }

    #[test]
    fn response_with_string_id_round_trips() {
        let resp = Response::ok(Value::from("s2c-1"), serde_json::json!({"answer": "yes"}));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["id"], "s2c-1");
    }
}
