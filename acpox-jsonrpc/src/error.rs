use std::any::Any;
use std::time::Duration;

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::capabilities::CapabilityKey;
use crate::codec::DecodeError;
use crate::types::{ErrorDetails, Method};

pub type Result<T, E = JsonRpcError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum JsonRpcError {
    #[error("Received a malformed message from the remote peer")]
    Decode {
        #[from]
        source: DecodeError,
    },

    #[error("Method '{method}' requires capability '{capability}', which the remote peer did not advertise")]
    CapabilityNotSupported { method: Method, capability: CapabilityKey },

    #[error("Call to method '{method}' timed out after {timeout:?}")]
    Timeout { method: Method, timeout: Duration },

    #[error("The request was cancelled")]
    Cancelled,

    #[error("Method '{method}' returned an error: {error}")]
    MethodError { method: Method, error: ErrorDetails },

    #[error("Transport error")]
    Transport {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("Line of JSON-RPC text exceeds the maximum length of {max_length} bytes")]
    OversizedMessage { max_length: usize },

    #[error("The connection to the remote peer is closed")]
    ConnectionClosed,

    #[error("Cannot invoke methods on the remote peer until the handshake completes")]
    HandshakeNotComplete,

    #[error("The handshake with the remote peer has already completed")]
    HandshakeAlreadyComplete,

    #[error("Capabilities for this connection have already been set")]
    CapabilitiesAlreadySet,

    #[error("Error serializing request {type_name} to JSON")]
    SerRequest {
        source: serde_json::Error,
        type_name: &'static str,
    },

    #[error("Error deserializing response as {type_name}")]
    DeserResponse {
        source: serde_json::Error,
        type_name: &'static str,
        response: JsonValue,
    },

    #[error("Invalid parameters; expected {type_name}")]
    DeserRequest {
        source: serde_json::Error,
        type_name: &'static str,
        request: JsonValue,
    },

    #[error("Error serializing response {type_name} to JSON")]
    SerResponse {
        source: serde_json::Error,
        type_name: &'static str,
    },

    #[error("Error serializing message to JSON")]
    SerMessage { source: serde_json::Error },

    #[error("BUG: {message}")]
    Bug { message: String },
}

impl JsonRpcError {
    /// Wrap any transport-level error
    pub fn transport(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        JsonRpcError::Transport {
            source: Box::new(source),
        }
    }
}

/// Local errors that end up being reported to the remote peer (for example, because a handler
/// returned one) are translated into JSON-RPC error objects here.
impl From<JsonRpcError> for ErrorDetails {
    fn from(value: JsonRpcError) -> Self {
        match value {
            JsonRpcError::MethodError { error, .. } => error,
            JsonRpcError::DeserRequest {
                source, type_name, ..
            } => ErrorDetails::invalid_params(
                format!("Invalid parameters: {source}"),
                serde_json::json!({ "expected": type_name }),
            ),
            JsonRpcError::Decode { source } => source.to_error_details(),
            JsonRpcError::OversizedMessage { max_length } => ErrorDetails::oversized_request(
                format!("Message exceeds the maximum length of {max_length} bytes"),
                None,
            ),
            other => ErrorDetails::internal_error(other.to_string(), None),
        }
    }
}

/// Render the payload of a caught panic as a string
pub(crate) fn panic_err_to_string(err: Box<dyn Any + Send + 'static>) -> String {
    if let Some(s) = err.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
