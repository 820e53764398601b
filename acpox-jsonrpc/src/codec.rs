//! Newline-delimited JSON framing and JSON-RPC message classification.
//!
//! Every message on the wire is one JSON object on one line.  Encoding is trivial since the
//! compact JSON serializer never emits a raw newline.  Decoding is where the work is: the shape of
//! an inbound object determines whether it's a request, a notification or a response, and
//! anything that doesn't fit is rejected with a [`DecodeError`] that is reported but never fatal
//! to the connection.
use std::io;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::types::{ErrorDetails, Id, Message, Notification, Request, Response, ResponsePayload};
use crate::{JsonRpcError, Result};

/// Max length of a single line of JSON-RPC text accepted by default
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

/// Reasons an inbound line could not be turned into a [`Message`]
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Line is not valid JSON")]
    Parse { source: serde_json::Error },

    #[error("Not a valid JSON-RPC 2.0 message: {reason}")]
    Invalid {
        reason: &'static str,
        /// The `id` of the message, if one could be recovered
        id: Option<Id>,
        /// The `method` of the message, if one could be recovered
        method: Option<String>,
    },

    #[error("Line exceeds the maximum length of {max_length} bytes")]
    Oversized { max_length: usize },
}

impl DecodeError {
    fn invalid(reason: &'static str, id: Option<&Id>, method: Option<&str>) -> Self {
        DecodeError::Invalid {
            reason,
            id: id.cloned(),
            method: method.map(str::to_string),
        }
    }

    /// If the malformed message looked enough like a request that it's possible to tell the
    /// remote peer what was wrong with it, this is the ID to respond to.
    pub fn request_id(&self) -> Option<&Id> {
        match self {
            DecodeError::Invalid {
                id: Some(id),
                method: Some(_),
                ..
            } => Some(id),
            _ => None,
        }
    }

    /// The JSON-RPC error object that describes this failure
    pub fn to_error_details(&self) -> ErrorDetails {
        match self {
            DecodeError::Parse { source } => ErrorDetails::parse_error("Parse error", JsonValue::String(source.to_string())),
            DecodeError::Invalid { reason, .. } => ErrorDetails::invalid_request("Invalid request", JsonValue::from(*reason)),
            DecodeError::Oversized { max_length } => ErrorDetails::oversized_request(
                format!("Message exceeds the maximum length of {max_length} bytes"),
                None,
            ),
        }
    }
}

/// Encode a message as one line of JSON, including the terminating newline.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(message).map_err(|source| JsonRpcError::SerMessage { source })?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Encode a message as JSON text without the line terminator, for sinks that frame lines
/// themselves (like [`NdjsonCodec`]).
pub fn encode_line(message: &Message) -> Result<String> {
    serde_json::to_string(message).map_err(|source| JsonRpcError::SerMessage { source })
}

/// Decode one line of text into a JSON-RPC message.
pub fn decode_line(line: &str) -> Result<Message, DecodeError> {
    decode(line.as_bytes())
}

/// Decode the bytes of one line (with or without the trailing newline) into a JSON-RPC message.
///
/// Classification goes by which fields are present:
///
/// - `method` and no `id`: notification
/// - `method` and `id`: request
/// - `id` and no `method`: response, which must have exactly one of `result` or `error`
///
/// Everything else is malformed, including JSON arrays (batches are not part of this protocol).
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let value: JsonValue = serde_json::from_slice(bytes).map_err(|source| DecodeError::Parse { source })?;

    let JsonValue::Object(mut object) = value else {
        let reason = if value.is_array() {
            "batch messages are not supported"
        } else {
            "message is not a JSON object"
        };
        return Err(DecodeError::invalid(reason, None, None));
    };

    // Recover whatever can be recovered about the message before validating, so that errors
    // about requests can still be correlated with them
    let raw_id = object.remove("id");
    let id = raw_id.as_ref().and_then(Id::from_json);
    let raw_method = object.remove("method");
    let method = raw_method.as_ref().and_then(JsonValue::as_str).map(str::to_string);

    match object.remove("jsonrpc") {
        Some(JsonValue::String(version)) if version == "2.0" => {}
        _ => {
            return Err(DecodeError::invalid(
                "missing or unsupported \"jsonrpc\" version",
                id.as_ref(),
                method.as_deref(),
            ));
        }
    }

    if raw_id.is_some() && id.is_none() {
        return Err(DecodeError::invalid(
            "\"id\" must be a string or an integer",
            None,
            method.as_deref(),
        ));
    }

    if raw_method.is_some() && method.is_none() {
        return Err(DecodeError::invalid(
            "\"method\" must be a string",
            id.as_ref(),
            None,
        ));
    }

    let params = object.remove("params");

    match (method, id) {
        (Some(method), None) => Ok(Message::Notification(Notification::new(method, params))),
        (Some(method), Some(Id::Null)) => Err(DecodeError::invalid(
            "request \"id\" must not be null",
            Some(&Id::Null),
            Some(&method),
        )),
        (Some(method), Some(id)) => Ok(Message::Request(Request::new(id, method, params))),
        (None, Some(id)) => {
            let payload = match (object.remove("result"), object.remove("error")) {
                (Some(_), None) if id == Id::Null => {
                    return Err(DecodeError::invalid(
                        "success response must have a non-null \"id\"",
                        None,
                        None,
                    ));
                }
                (Some(result), None) => ResponsePayload::success(result),
                (None, Some(error)) => {
                    let details: ErrorDetails = serde_json::from_value(error).map_err(|_| {
                        DecodeError::invalid("malformed \"error\" object", Some(&id), None)
                    })?;
                    ResponsePayload::error(details)
                }
                _ => {
                    return Err(DecodeError::invalid(
                        "response must have exactly one of \"result\" or \"error\"",
                        Some(&id),
                        None,
                    ));
                }
            };

            Ok(Message::Response(Response::new(id, payload)))
        }
        (None, None) => Err(DecodeError::invalid(
            "message has neither \"method\" nor \"id\"",
            None,
            None,
        )),
    }
}

/// A [`tokio_util::codec`] codec for newline-delimited JSON-RPC text.
///
/// This wraps [`LinesCodec`] with two differences that matter for a long-lived connection:
/// blank lines are skipped, and a line that exceeds the maximum length is reported as an
/// item-level error (after which decoding resumes at the next line) rather than as a stream
/// error, which would end the framed stream.
#[derive(Debug, Clone)]
pub struct NdjsonCodec {
    lines: LinesCodec,
    max_length: usize,
}

impl NdjsonCodec {
    pub fn new() -> Self {
        Self::new_with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn new_with_max_length(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
            max_length,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn next_line(
        &mut self,
        buf: &mut BytesMut,
        eof: bool,
    ) -> Result<Option<Result<String, DecodeError>>, io::Error> {
        loop {
            let result = if eof {
                self.lines.decode_eof(buf)
            } else {
                self.lines.decode(buf)
            };

            return match result {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => Ok(Some(Ok(line))),
                Ok(None) => Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Err(DecodeError::Oversized {
                    max_length: self.max_length,
                }))),
                Err(LinesCodecError::Io(e)) => Err(e),
            };
        }
    }
}

impl Default for NdjsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NdjsonCodec {
    type Item = Result<String, DecodeError>;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.next_line(buf, false)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.next_line(buf, true)
    }
}

impl<T: AsRef<str>> Encoder<T> for NdjsonCodec {
    type Error = io::Error;

    fn encode(&mut self, line: T, buf: &mut BytesMut) -> Result<(), Self::Error> {
        self.lines.encode(line, buf).map_err(|e| match e {
            LinesCodecError::Io(e) => e,
            LinesCodecError::MaxLineLengthExceeded => io::Error::other(e),
        })
    }
}
