//! The JSON-RPC 2.0 message shapes, as they appear on the wire.
//!
//! Field order matters here: with `serde_json`'s `preserve_order` feature enabled, the order in
//! which fields are declared is the order in which they go out over the wire, which is
//! `jsonrpc`, `id`, `method`, `params` for requests and `jsonrpc`, `id`, `result|error` for
//! responses.
use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::JsonRpcError;
pub use jsonrpsee_types::{error::ErrorCode, params::TwoPointZero};
pub use serde_json::Value as JsonValue;

/// Request Id
///
/// Ids we allocate ourselves are always positive [`Id::Number`]s; the remote peer is free to use
/// strings or any integer, negative ones included.
/// [`Id::Null`] only ever shows up on error responses the peer could not correlate with a request.
#[derive(Debug, PartialEq, Clone, Hash, Eq, Deserialize, Serialize, PartialOrd, Ord)]
#[serde(deny_unknown_fields)]
#[serde(untagged)]
pub enum Id {
    /// Null
    Null,
    /// Numeric id
    Number(i64),
    /// String id
    Str(String),
}

impl Id {
    /// Interpret a raw JSON value as a request id, if it has one of the shapes JSON-RPC allows.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Null => Some(Id::Null),
            JsonValue::Number(n) => n.as_i64().map(Id::Number),
            JsonValue::String(s) => Some(Id::Str(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Null => f.write_str("null"),
            Id::Number(n) => write!(f, "{n}"),
            Id::Str(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<i64> for Id {
    fn from(value: i64) -> Self {
        Id::Number(value)
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Id::Str(value.to_string())
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Id::Str(value)
    }
}

/// Name of a JSON-RPC method.
///
/// Most method names are known at compile time, so this avoids allocating for them while still
/// allowing dynamically-constructed names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Method(Cow<'static, str>);

impl Method {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::ops::Deref for Method {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for Method {
    fn from(value: &'static str) -> Self {
        Method(Cow::Borrowed(value))
    }
}

impl From<String> for Method {
    fn from(value: String) -> Self {
        Method(Cow::Owned(value))
    }
}

impl From<&Method> for Method {
    fn from(value: &Method) -> Self {
        value.clone()
    }
}

impl From<Method> for String {
    fn from(value: Method) -> Self {
        value.0.into_owned()
    }
}

impl PartialEq<str> for Method {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Method {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// A method call: the peer owes us a [`Response`] carrying the same `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub jsonrpc: TwoPointZero,
    pub id: Id,
    pub method: String,
    /// Omitted from the wire entirely when `None`
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub params: Option<JsonValue>,
}

impl Request {
    pub fn new(id: Id, method: impl Into<Method>, params: impl Into<Option<JsonValue>>) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            id,
            method: String::from(method.into()),
            params: params.into(),
        }
    }
}

/// Fire-and-forget message.  Having no `id` is what makes it a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Notification {
    pub jsonrpc: TwoPointZero,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub params: Option<JsonValue>,
}

impl Notification {
    pub fn new(method: impl Into<Method>, params: impl Into<Option<JsonValue>>) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            method: String::from(method.into()),
            params: params.into(),
        }
    }
}

/// Outcome of a [`Request`], correlated by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: TwoPointZero,
    pub id: Id,
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

impl Response {
    pub fn new(id: Id, payload: ResponsePayload) -> Self {
        Self {
            jsonrpc: TwoPointZero,
            id,
            payload,
        }
    }

    pub fn success(id: Id, result: JsonValue) -> Self {
        Self::new(id, ResponsePayload::success(result))
    }

    pub fn error(
        id: Id,
        code: ErrorCode,
        message: impl Into<String>,
        data: impl Into<Option<JsonValue>>,
    ) -> Self {
        Self::error_detail(id, ErrorDetails::new(code, message, data))
    }

    pub fn error_detail(id: Id, details: ErrorDetails) -> Self {
        Self::new(id, ResponsePayload::error(details))
    }
}

/// Either the `result` or the `error` member of a response, flattened into it.
///
/// The codec rejects responses carrying both or neither of `result` and `error`, so by the time
/// serde sees one of these exactly one variant can match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    Error(ErrorResponse),
    Success(SuccessResponse),
}

impl ResponsePayload {
    pub fn success(result: JsonValue) -> Self {
        Self::Success(result.into())
    }

    /// Turn a handler's return value into a payload.  A value that fails to serialize becomes an
    /// internal error, since the peer still has to get an answer.
    pub fn serialize_to_success<T: Serialize>(result: T) -> Self {
        serde_json::to_value(result)
            .map(Self::success)
            .unwrap_or_else(|source| {
                Self::error(JsonRpcError::SerResponse {
                    source,
                    type_name: std::any::type_name::<T>(),
                })
            })
    }

    pub fn error(details: impl Into<ErrorDetails>) -> Self {
        Self::Error(ErrorResponse { error: details.into() })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub result: JsonValue,
}

impl From<JsonValue> for SuccessResponse {
    fn from(result: JsonValue) -> Self {
        SuccessResponse { result }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

impl From<ErrorDetails> for ErrorResponse {
    fn from(error: ErrorDetails) -> Self {
        ErrorResponse { error }
    }
}

/// The `error` member of a failed response.
///
/// Errors reported by the remote peer are surfaced exactly as received: code, message and data
/// are never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<JsonValue>,
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code.code())
    }
}

/// Shorthand constructors, one per standard error code
macro_rules! error_constructors {
    ($($name:ident => $code:ident),* $(,)?) => {
        $(
            pub fn $name(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
                Self::new(ErrorCode::$code, message, data)
            }
        )*
    };
}

impl ErrorDetails {
    pub fn new(code: ErrorCode, message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self {
            code,
            message: message.into(),
            data: data.into(),
        }
    }

    error_constructors! {
        parse_error => ParseError,
        oversized_request => OversizedRequest,
        invalid_request => InvalidRequest,
        method_not_found => MethodNotFound,
        invalid_params => InvalidParams,
        internal_error => InternalError,
    }

    /// Application-defined error, outside the range reserved by JSON-RPC
    pub fn server_error(code: i32, message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::ServerError(code), message, data)
    }
}

/// Every possible (valid) JSON-RPC message that can be sent over the wire.
///
/// Batches are not part of this protocol; a JSON array on the wire is treated as malformed by
/// the codec.  Classification of inbound messages is done explicitly in [`crate::codec`] rather
/// than by letting serde guess, so this is only `Serialize`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Message {
    /// Short description of the message, its ID and its method, for use in logging
    pub(crate) fn diagnostic_context(&self) -> (&'static str, Option<&Id>, Option<&str>) {
        match self {
            Message::Request(request) => ("request", Some(&request.id), Some(request.method.as_str())),
            Message::Notification(notification) => ("notification", None, Some(notification.method.as_str())),
            Message::Response(response) => ("response", Some(&response.id), None),
        }
    }
}

impl From<Request> for Message {
    fn from(value: Request) -> Self {
        Message::Request(value)
    }
}

impl From<Notification> for Message {
    fn from(value: Notification) -> Self {
        Message::Notification(value)
    }
}

impl From<Response> for Message {
    fn from(value: Response) -> Self {
        Message::Response(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn wire<T: Serialize>(value: &T) -> String {
        serde_json::to_string(value).unwrap()
    }

    #[test]
    fn request_fields_go_out_in_protocol_order() {
        let request = Request::new(Id::Number(1), "initialize", json!({"protocolVersion": 1}));
        assert_eq!(
            wire(&request),
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":1}}"#
        );

        let parsed: Request = serde_json::from_str(&wire(&request)).unwrap();
        assert_eq!(parsed.id, Id::Number(1));
        assert_eq!(parsed.method, "initialize");
        assert_eq!(parsed.params, Some(json!({"protocolVersion": 1})));
    }

    #[test]
    fn notification_omits_id_and_absent_params() {
        assert_eq!(
            wire(&Notification::new("session/cancel", None)),
            r#"{"jsonrpc":"2.0","method":"session/cancel"}"#
        );
        assert_eq!(
            wire(&Notification::new("session/update", json!({"sessionId": "s1"}))),
            r#"{"jsonrpc":"2.0","method":"session/update","params":{"sessionId":"s1"}}"#
        );
    }

    #[test]
    fn successful_response() {
        let response = Response::success(Id::Number(42), json!({"stopReason": "end_turn"}));
        assert_eq!(wire(&response), r#"{"jsonrpc":"2.0","id":42,"result":{"stopReason":"end_turn"}}"#);

        let parsed: Response = serde_json::from_str(&wire(&response)).unwrap();
        assert_matches!(parsed.payload, ResponsePayload::Success(SuccessResponse { result }) => {
            assert_eq!(result["stopReason"], "end_turn");
        });
    }

    #[test]
    fn failed_response() {
        let response = Response::error(
            Id::from("agent-7"),
            ErrorCode::InvalidRequest,
            "Invalid request",
            json!({"reason": "missing method"}),
        );
        let text = wire(&response);
        assert_eq!(
            text,
            r#"{"jsonrpc":"2.0","id":"agent-7","error":{"code":-32600,"message":"Invalid request","data":{"reason":"missing method"}}}"#
        );

        let parsed: Response = serde_json::from_str(&text).unwrap();
        assert_matches!(parsed.payload, ResponsePayload::Error(ErrorResponse { error }) => {
            assert_eq!(error.code, ErrorCode::InvalidRequest);
            assert_eq!(error.data, Some(json!({"reason": "missing method"})));
        });
    }

    #[test]
    fn application_error_codes_are_kept_verbatim() {
        let text = r#"{"jsonrpc":"2.0","id":7,"error":{"code":-32000,"message":"Auth required"}}"#;
        let response: Response = serde_json::from_str(text).unwrap();
        assert_matches!(&response.payload, ResponsePayload::Error(ErrorResponse { error }) => {
            assert_eq!(error.code.code(), -32000);
            assert_eq!(error.message, "Auth required");
            assert_eq!(error.data, None);
        });
        assert_eq!(wire(&response), text);
    }

    #[test]
    fn params_key_order_is_preserved() {
        let message = Message::from(Request::new(Id::Number(3), "session/prompt", json!({"zeta": 1, "alpha": 2})));
        assert_eq!(
            wire(&message),
            r#"{"jsonrpc":"2.0","id":3,"method":"session/prompt","params":{"zeta":1,"alpha":2}}"#
        );
    }

    #[test]
    fn unserializable_result_becomes_internal_error() {
        let mut map = std::collections::HashMap::new();
        map.insert(vec![1u8], "keys must be strings");
        assert_matches!(
            ResponsePayload::serialize_to_success(map),
            ResponsePayload::Error(ErrorResponse { error }) if error.code == ErrorCode::InternalError
        );
    }

    #[test]
    fn ids() {
        for (id, expected) in [
            (Id::Null, json!(null)),
            (Id::from("abc123"), json!("abc123")),
            (Id::from(42), json!(42)),
        ] {
            let request = serde_json::to_value(Request::new(id, "m", None)).unwrap();
            assert_eq!(request["id"], expected);
        }

        assert_eq!(Id::from_json(&json!(5)), Some(Id::Number(5)));
        assert_eq!(Id::from_json(&json!("x1")), Some(Id::Str("x1".into())));
        assert_eq!(Id::from_json(&json!(-1)), Some(Id::Number(-1)));
        assert_eq!(Id::from_json(&json!(u64::MAX)), None);
        assert_eq!(Id::from_json(&json!(1.5)), None);
        assert_eq!(Id::from_json(&json!({"id": 1})), None);
        assert_eq!(Id::Str("x1".into()).to_string(), "\"x1\"");
    }

    #[test]
    fn method_names() {
        let method: Method = "session/new".into();
        assert_eq!(method, "session/new");
        assert_eq!(method.to_string(), "session/new");

        let owned: Method = format!("fs/{}", "read_text_file").into();
        assert_eq!(owned.as_str(), "fs/read_text_file");
    }
}
