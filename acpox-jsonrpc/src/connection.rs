//! A connection to a remote peer: the correlation engine at the heart of this crate.
//!
//! Binding a [`crate::Transport`] with [`ConnectionBuilder::bind`] starts an event loop which is
//! the single owner of all per-connection bookkeeping: the table of calls waiting for responses,
//! their deadlines, and the inbound method calls currently being handled.  Everything else talks
//! to it over channels using a cheaply-clonable [`ConnectionHandle`].
//!
//! A connection starts out [`ConnectionState::Uninitialized`].  Until the handshake completes only
//! the handshake call itself may be sent; once it does (and the negotiated capabilities are
//! recorded) the connection is [`ConnectionState::Ready`].  When the transport closes or the
//! connection is shut down it becomes [`ConnectionState::Closed`], for good.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, handler, router, transport};

mod event_loop;
mod handle;

pub use handle::{CallCanceller, ConnectionHandle, RawRequestHandle, RequestHandle};

/// Default method of the notification sent to the remote peer when a pending call is cancelled or
/// times out
pub const DEFAULT_CANCEL_METHOD: &str = "$/cancel_request";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Method of the notification telling the remote peer that we're no longer interested in the
    /// result of a call, with params `{"requestId": <id>}`.  Receiving this notification from the
    /// remote peer cancels the matching inbound call.
    ///
    /// `None` disables cancel notifications in both directions.
    pub cancel_method: Option<String>,

    /// Timeout applied to outbound calls that don't specify their own.
    ///
    /// `None` means calls wait for as long as it takes.
    #[serde(with = "humantime_serde")]
    pub default_call_timeout: Option<Duration>,

    /// After the connection starts shutting down, how long to wait for in-flight inbound calls to
    /// complete before aborting them.
    ///
    /// `None` indicates no limit, which is probably not a good idea.
    #[serde(with = "humantime_serde")]
    pub graceful_shutdown_timeout: Option<Duration>,

    /// How many [`Diagnostic`] events are buffered for each subscriber before the oldest are
    /// dropped
    pub diagnostics_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            cancel_method: Some(DEFAULT_CANCEL_METHOD.to_string()),
            default_call_timeout: None,
            graceful_shutdown_timeout: Some(Duration::from_secs(5)),
            diagnostics_capacity: 64,
        }
    }
}

/// Lifecycle state of a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum ConnectionState {
    /// Bound to a transport, but the handshake hasn't completed yet
    Uninitialized,
    /// Handshake complete and capabilities recorded; calls may be made
    Ready,
    /// Transport closed or connection shut down.  Terminal.
    Closed,
}

/// Something noteworthy but non-fatal that happened on a connection.
///
/// These are also logged; subscribe with [`ConnectionHandle::diagnostics`] to observe them
/// programmatically.
#[derive(Clone, Debug, PartialEq)]
pub enum Diagnostic {
    /// A line from the remote peer wasn't a valid JSON-RPC message
    MalformedMessage { reason: String, line: String },

    /// A response arrived whose ID doesn't match any pending call.  Perhaps it was cancelled or
    /// timed out.
    UnknownResponse { id: crate::Id },

    /// The remote peer reused the ID of a request that's still being handled
    DuplicateRequestId { id: crate::Id, method: String },

    /// A handler panicked while handling an inbound message
    HandlerPanicked { method: String, message: String },

    /// The transport failed to read a line, but can keep going
    ReadError { message: String },
}

/// Builder for a connection, in two stages: first decide on the handler state type, then register
/// handlers and bind to a transport.
pub struct ConnectionBuilder<Stage> {
    stage: Stage,
}

impl Default for ConnectionBuilder<Stage1> {
    fn default() -> Self {
        Self {
            stage: Stage1 {
                config: ConnectionConfig::default(),
            },
        }
    }
}

impl ConnectionBuilder<Stage1> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.stage.config = config;
        self
    }

    pub fn with_state<S: Clone + Send + Sync + 'static>(self, state: S) -> ConnectionBuilder<Stage2<S>> {
        self.with_router(router::Router::new_with_state(state))
    }

    pub fn without_state(self) -> ConnectionBuilder<Stage2<()>> {
        self.with_router(router::Router::new_stateless())
    }

    pub fn with_router<S: Clone + Send + Sync + 'static>(
        self,
        router: router::Router<S>,
    ) -> ConnectionBuilder<Stage2<S>> {
        ConnectionBuilder {
            stage: Stage2 {
                config: self.stage.config,
                router,
            },
        }
    }
}

impl<S: Clone + Send + Sync + 'static> ConnectionBuilder<Stage2<S>> {
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.stage.config = config;
        self
    }

    pub fn with_fallback_handler<H, HackT>(mut self, handler: H) -> Self
    where
        H: handler::Handler<HackT, S> + 'static,
        HackT: Send + Sync + 'static,
    {
        self.stage.router.register_fallback_handler(handler);
        self
    }

    pub fn with_handler<H, HackT>(mut self, method: impl Into<String>, handler: H) -> Self
    where
        H: handler::Handler<HackT, S> + 'static,
        HackT: Send + Sync + 'static,
    {
        self.stage.router.register_handler(method, handler);
        self
    }

    /// See [`router::Router::set_ordering_scope`]
    pub fn with_ordering_scope<F>(mut self, scope: F) -> Self
    where
        F: Fn(&str, Option<&serde_json::Value>) -> Option<String> + Send + Sync + 'static,
    {
        self.stage.router.set_ordering_scope(scope);
        self
    }

    /// Start servicing the transport, returning a handle to the new connection.
    ///
    /// The event loop is spawned onto the current tokio runtime; this must be called from within
    /// one.
    pub fn bind(self, transport: impl transport::Transport) -> Result<ConnectionHandle> {
        let Stage2 { config, router } = self.stage;
        let (event_loop_fut, handle) =
            event_loop::service_connection(config, router, transport::Peer::new(transport))?;

        tokio::spawn(event_loop_fut);

        Ok(handle)
    }
}

#[doc(hidden)]
pub struct Stage1 {
    config: ConnectionConfig,
}

#[doc(hidden)]
pub struct Stage2<S: Clone + Send + Sync + 'static> {
    config: ConnectionConfig,
    router: router::Router<S>,
}
