//! A Rust implementation of the JSON-RPC 2.0 protocol, specific to `acpox`.
//!
//! This crate is the engine underneath the Agent Client Protocol client: newline-delimited
//! JSON-RPC over a duplex byte stream (usually the stdio of an agent subprocess), in both
//! directions at once.  Either side may call methods on the other, while its own calls are still
//! outstanding.
//!
//! The pieces, from the wire up:
//!
//! - [`codec`] turns lines into [`Message`]s and back again.
//! - [`Transport`] abstracts the byte stream; a reader task and a writer task service it so that
//!   neither direction ever blocks the other.
//! - A connection (see [`ConnectionBuilder`] and [`ConnectionHandle`]) correlates responses with
//!   the calls that are waiting for them, enforces timeouts and cancellation, gates calls on the
//!   capabilities negotiated in the handshake, and dispatches inbound calls to handlers.
//! - A [`Router`] maps method names to [`Handler`]s, which are plain async functions taking
//!   extractors like [`Params`] and [`State`].
//!
//! Nothing here knows about ACP methods beyond the capability names in [`CapabilityKey`]; that
//! lives in the `acpox-client` crate.
//!
//! This library owes a debt to the [`jsonrpsee`](https://github.com/paritytech/jsonrpsee) project,
//! which is a more general-purpose JSON-RPC framework in Rust.

mod capabilities;
pub mod codec;
mod connection;
mod error;
mod handler;
mod router;
#[cfg(test)]
pub mod testing;
mod transport;
mod types;

pub use capabilities::{Capabilities, CapabilityKey, CapabilityRegistry};
pub use codec::{DecodeError, NdjsonCodec};
pub use connection::{
    CallCanceller, ConnectionBuilder, ConnectionConfig, ConnectionHandle, ConnectionState, DEFAULT_CANCEL_METHOD, Diagnostic,
    RawRequestHandle, RequestHandle,
};
pub use error::{JsonRpcError, Result};
pub use handler::{
    FromRequest, Handler, IntoResponse, InvocationRequest, MethodName, MethodResponse, Params, State,
};
pub use router::{OrderingScopeFn, Router};
pub use transport::{CloseHandle, LineSink, LineStream, Transport, TransportParts, ndjson_item_to_line};
pub use types::{
    ErrorCode, ErrorDetails, ErrorResponse, Id, JsonValue, Message, Method, Notification, Request, Response,
    ResponsePayload, SuccessResponse, TwoPointZero,
};
