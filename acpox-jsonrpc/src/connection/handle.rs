//! The caller-facing side of a connection: [`ConnectionHandle`] and the handles of calls in flight.
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::event_loop::{Command, ConnectionEventLoopFuture, OutboundMessage};
use super::{ConnectionConfig, ConnectionState, Diagnostic};
use crate::capabilities::{Capabilities, CapabilityKey, CapabilityRegistry};
use crate::{JsonRpcError, Result, types};

/// Lightweight and cheaply-clonable handle to a connection and its event loop.
///
/// This handle is used to make calls and send notifications to the remote peer at the other end
/// of the connection.  It is also able to shut the connection down.
///
/// Obtained from [`super::ConnectionBuilder::bind`], or inside a handler by using
/// `ConnectionHandle` as an extractor.
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    outbound_messages: mpsc::Sender<OutboundMessage>,
    next_id: Arc<AtomicI64>,
    state: Arc<watch::Sender<ConnectionState>>,
    capabilities: CapabilityRegistry,
    diagnostics: broadcast::Sender<Diagnostic>,
    config: Arc<ConnectionConfig>,
    cancellation_token: CancellationToken,
    event_loop_fut: ConnectionEventLoopFuture,
}

impl ConnectionHandle {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        commands: mpsc::UnboundedSender<Command>,
        outbound_messages: mpsc::Sender<OutboundMessage>,
        state: Arc<watch::Sender<ConnectionState>>,
        capabilities: CapabilityRegistry,
        diagnostics: broadcast::Sender<Diagnostic>,
        config: Arc<ConnectionConfig>,
        cancellation_token: CancellationToken,
        event_loop_fut: ConnectionEventLoopFuture,
    ) -> Self {
        Self {
            commands,
            outbound_messages,
            // IDs start at 1
            next_id: Arc::new(AtomicI64::new(1)),
            state,
            capabilities,
            diagnostics,
            config,
            cancellation_token,
            event_loop_fut,
        }
    }

    /// Current lifecycle state of the connection
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Capabilities negotiated with the remote peer.  Empty until the handshake completes.
    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    /// Subscribe to non-fatal events on this connection, like malformed lines from the remote
    /// peer.  Only events that happen after subscribing are received.
    pub fn diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.diagnostics.subscribe()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Signal the connection to shut down, and wait until the event loop has finished.
    ///
    /// Every call still waiting for a response fails with [`JsonRpcError::ConnectionClosed`].
    /// Inbound calls still being handled have their cancellation tokens signalled, and are
    /// aborted if they don't finish within the configured graceful shutdown timeout.  Then
    /// anything still queued is written to the transport, and the transport is closed.
    ///
    /// This can be called any number of times from any number of handles; every call waits for
    /// the same shutdown and gets the same result, which is the result of the event loop itself.
    pub async fn shutdown(&self) -> Result<(), String> {
        self.cancellation_token.cancel();
        self.event_loop_fut.clone().await
    }

    /// Wait for the connection to close, for any reason, without causing it to.
    pub async fn wait_closed(&self) -> Result<(), String> {
        self.event_loop_fut.clone().await
    }

    /// Perform the handshake that moves the connection from [`ConnectionState::Uninitialized`]
    /// to [`ConnectionState::Ready`].
    ///
    /// This is the only call that may be made before the connection is ready.  On success,
    /// `extract` picks the remote peer's capabilities out of the result, they are recorded in
    /// the capability registry, and the result is returned.
    #[instrument(skip_all, fields(method))]
    pub async fn handshake<Req, F>(
        &self,
        method: impl Into<types::Method>,
        params: Req,
        extract: F,
    ) -> Result<JsonValue>
    where
        Req: Serialize,
        F: FnOnce(&JsonValue) -> Capabilities,
    {
        match self.state() {
            ConnectionState::Uninitialized => {}
            ConnectionState::Ready => return Err(JsonRpcError::HandshakeAlreadyComplete),
            ConnectionState::Closed => return Err(JsonRpcError::ConnectionClosed),
        }

        let params = serialize_params(params)?;
        let result = self
            .enqueue_call(method.into(), Some(params), self.config.default_call_timeout)
            .await?
            .await?;

        self.complete_handshake(extract(&result))?;

        Ok(result)
    }

    /// Record the negotiated capabilities and mark the connection ready.
    ///
    /// [`Self::handshake`] does this for the side that initiates the handshake.  The side that
    /// receives the handshake request calls this from its handler.
    pub fn complete_handshake(&self, capabilities: Capabilities) -> Result<()> {
        match self.state() {
            ConnectionState::Uninitialized => {}
            ConnectionState::Ready => return Err(JsonRpcError::HandshakeAlreadyComplete),
            ConnectionState::Closed => return Err(JsonRpcError::ConnectionClosed),
        }

        self.capabilities.set(capabilities)?;

        let became_ready = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Uninitialized {
                *state = ConnectionState::Ready;
                true
            } else {
                false
            }
        });

        if became_ready {
            tracing::debug!("Handshake complete; connection is ready");
            Ok(())
        } else {
            // Closed while we were busy
            Err(JsonRpcError::ConnectionClosed)
        }
    }

    /// Call a method that takes no params and wait for its result.  See [`Self::start_call`] for
    /// a call that can be cancelled.
    pub async fn call<Resp>(&self, method: impl Into<types::Method>) -> Result<Resp>
    where
        Resp: DeserializeOwned,
    {
        self.start_call(method).await?.await
    }

    /// Call a method and wait for its result.
    pub async fn call_with_params<Req, Resp>(&self, method: impl Into<types::Method>, params: Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.start_call_with_params(method, params).await?.await
    }

    /// Like [`Self::call_with_params`], but give up after `timeout` (overriding the connection's
    /// default call timeout).  Timing out sends a cancel notification to the remote peer.
    pub async fn call_with_timeout<Req, Resp>(
        &self,
        method: impl Into<types::Method>,
        params: Req,
        timeout: Duration,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let params = serialize_params(params)?;
        let raw_handle = self.start_call_raw(method, Some(params), Some(timeout)).await?;

        RequestHandle::<Resp>::new(raw_handle).await
    }

    /// Call a method that the remote peer only supports if it advertised `capability`.
    ///
    /// If it didn't, this fails immediately with [`JsonRpcError::CapabilityNotSupported`] and
    /// nothing is written to the transport.
    pub async fn call_gated<Req, Resp>(
        &self,
        capability: CapabilityKey,
        method: impl Into<types::Method>,
        params: Req,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let method = method.into();
        self.ensure_capability(capability, &method)?;

        self.call_with_params(method, params).await
    }

    /// Fail with [`JsonRpcError::CapabilityNotSupported`] unless the remote peer advertised
    /// `capability`
    pub fn ensure_capability(&self, capability: CapabilityKey, method: &types::Method) -> Result<()> {
        if self.capabilities.is_enabled(capability) {
            Ok(())
        } else {
            tracing::debug!(%method, %capability, "Remote peer does not support capability; call not sent");
            Err(JsonRpcError::CapabilityNotSupported {
                method: method.clone(),
                capability,
            })
        }
    }

    /// Send a call without params, returning as soon as it is queued for writing.
    pub async fn start_call<Resp>(&self, method: impl Into<types::Method>) -> Result<RequestHandle<Resp>>
    where
        Resp: DeserializeOwned,
    {
        let raw_handle = self.start_call_raw(method, None, None).await?;

        Ok(RequestHandle::new(raw_handle))
    }

    /// Send a call, returning as soon as it is queued for writing.
    ///
    /// Await the returned handle for the result, or cancel it.  Dropping it also cancels the call.
    pub async fn start_call_with_params<Req, Resp>(
        &self,
        method: impl Into<types::Method>,
        params: Req,
    ) -> Result<RequestHandle<Resp>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let params = serialize_params(params)?;
        let raw_handle = self.start_call_raw(method, Some(params), None).await?;

        Ok(RequestHandle::new(raw_handle))
    }

    /// Untyped call: raw JSON params in, raw JSON result out.  Every other call method ends up
    /// here.
    ///
    /// With `timeout` of `None` the connection's default call timeout applies.
    #[instrument(skip_all, fields(method))]
    pub async fn start_call_raw(
        &self,
        method: impl Into<types::Method>,
        params: Option<JsonValue>,
        timeout: Option<Duration>,
    ) -> Result<RawRequestHandle> {
        self.ensure_ready()?;

        self.enqueue_call(
            method.into(),
            params,
            timeout.or(self.config.default_call_timeout),
        )
        .await
    }

    async fn enqueue_call(
        &self,
        method: types::Method,
        params: Option<JsonValue>,
        timeout: Option<Duration>,
    ) -> Result<RawRequestHandle> {
        let (response_tx, receiver) = oneshot::channel();
        let request_id = types::Id::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let message = OutboundMessage::Method {
            request: types::Request::new(request_id.clone(), &method, params),
            timeout,
            response_tx,
        };

        if self.outbound_messages.send(message).await.is_err() {
            tracing::debug!(%request_id, "Event loop has exited; call not sent");
            return Err(JsonRpcError::ConnectionClosed);
        }

        Ok(RawRequestHandle {
            receiver,
            request_id,
            method,
            commands: self.commands.clone(),
            completed: false,
        })
    }

    /// Send a notification without params.
    ///
    /// Returns once the line has been handed to the transport.  Nothing comes back from the
    /// remote peer, so that's all `Ok` can mean.
    pub async fn notify(&self, method: impl Into<types::Method>) -> Result<()> {
        self.notify_raw(method, None).await
    }

    pub async fn notify_with_params<Req>(&self, method: impl Into<types::Method>, params: Req) -> Result<()>
    where
        Req: Serialize,
    {
        self.notify_raw(method, Some(serialize_params(params)?)).await
    }

    /// Notification with raw JSON params
    #[instrument(skip_all, fields(method))]
    pub async fn notify_raw(&self, method: impl Into<types::Method>, params: Option<JsonValue>) -> Result<()> {
        self.ensure_ready()?;

        let (send_confirmation_tx, written) = oneshot::channel();
        let message = OutboundMessage::Notification {
            notification: types::Notification::new(method, params),
            send_confirmation_tx,
        };

        if self.outbound_messages.send(message).await.is_err() {
            tracing::debug!("Event loop has exited; notification not sent");
            return Err(JsonRpcError::ConnectionClosed);
        }

        match written.await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!("BUG: event loop dropped a notification without confirming it");
                Err(JsonRpcError::ConnectionClosed)
            }
        }
    }

    /// Cancel an inbound method call that is currently being handled, by signalling the
    /// cancellation token given to its handler.
    ///
    /// Handlers that don't watch their token keep running regardless.
    pub fn cancel_inbound_request(&self, request_id: types::Id) {
        let _ = self
            .commands
            .send(Command::CancelPendingInboundRequest { request_id });
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Ready => Ok(()),
            ConnectionState::Uninitialized => Err(JsonRpcError::HandshakeNotComplete),
            ConnectionState::Closed => Err(JsonRpcError::ConnectionClosed),
        }
    }
}

fn serialize_params<Req: Serialize>(params: Req) -> Result<JsonValue> {
    serde_json::to_value(params).map_err(|source| JsonRpcError::SerRequest {
        source,
        type_name: std::any::type_name::<Req>(),
    })
}

/// A call in flight whose result is left as raw JSON.
///
/// Dropping this before the call resolves cancels the call, exactly as [`Self::cancel`] does.
pub struct RawRequestHandle {
    receiver: oneshot::Receiver<Result<types::Response>>,
    request_id: types::Id,
    method: types::Method,
    commands: mpsc::UnboundedSender<Command>,
    completed: bool,
}

impl RawRequestHandle {
    /// Stop waiting for the response to this call, and return how it ended.
    ///
    /// The pending call is removed, a cancel notification is sent to the remote peer (unless
    /// disabled), and a response that arrives later is ignored.  The result is
    /// [`JsonRpcError::Cancelled`], unless the call had already been resolved by the time the
    /// event loop got to the cancellation, in which case that outcome is returned instead.
    pub async fn cancel(self) -> Result<JsonValue> {
        if self.completed {
            return Err(JsonRpcError::Cancelled);
        }

        self.canceller().cancel();
        self.await
    }

    /// A handle that cancels this call from somewhere other than the task awaiting it.  Whoever is
    /// awaiting the call then gets [`JsonRpcError::Cancelled`].
    pub fn canceller(&self) -> CallCanceller {
        CallCanceller {
            request_id: self.request_id.clone(),
            commands: self.commands.clone(),
        }
    }

    pub fn request_id(&self) -> types::Id {
        self.request_id.clone()
    }

    pub fn method(&self) -> &types::Method {
        &self.method
    }
}

/// Cancels one outbound call.  Cloneable, and harmless to use after the call has resolved.
#[derive(Clone, Debug)]
pub struct CallCanceller {
    request_id: types::Id,
    commands: mpsc::UnboundedSender<Command>,
}

impl CallCanceller {
    pub fn request_id(&self) -> &types::Id {
        &self.request_id
    }

    /// Ask the event loop to cancel the call.  Returns immediately; the cancel notification goes
    /// out and the waiting caller is released once the event loop processes it.
    pub fn cancel(&self) {
        let _ = self.commands.send(Command::CancelPendingOutboundRequest {
            request_id: self.request_id.clone(),
        });
    }
}

impl Future for RawRequestHandle {
    type Output = Result<JsonValue>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = futures::ready!(Pin::new(&mut self.receiver).poll(cx));
        self.completed = true;

        let response = match outcome {
            Ok(response) => response?,
            Err(_) => {
                // The event loop drains every pending call when it exits, so this only happens
                // if it died abnormally
                tracing::error!(request_id = %self.request_id, "BUG: event loop dropped a pending call");
                return Poll::Ready(Err(JsonRpcError::ConnectionClosed));
            }
        };

        Poll::Ready(match response.payload {
            types::ResponsePayload::Success(success) => Ok(success.result),
            types::ResponsePayload::Error(failure) => Err(JsonRpcError::MethodError {
                method: self.method.clone(),
                error: failure.error,
            }),
        })
    }
}

impl Drop for RawRequestHandle {
    fn drop(&mut self) {
        if !self.completed {
            tracing::debug!(request_id = %self.request_id, method = %self.method,
                "Request handle dropped before the call resolved; cancelling it");
            let _ = self.commands.send(Command::CancelPendingOutboundRequest {
                request_id: self.request_id.clone(),
            });
        }
    }
}

/// A call in flight whose result is deserialized into `T` when it arrives.
///
/// Await it for the result.  Dropping it cancels the call.
#[pin_project]
pub struct RequestHandle<T> {
    #[pin]
    raw: RawRequestHandle,
    _result: PhantomData<fn() -> T>,
}

impl<T> RequestHandle<T> {
    fn new(raw: RawRequestHandle) -> Self {
        Self {
            raw,
            _result: PhantomData,
        }
    }

    /// Cancel this request; see [`RawRequestHandle::cancel`]
    pub async fn cancel(self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        if self.raw.completed {
            return Err(JsonRpcError::Cancelled);
        }

        self.raw.canceller().cancel();
        self.await
    }

    pub fn canceller(&self) -> CallCanceller {
        self.raw.canceller()
    }

    pub fn request_id(&self) -> types::Id {
        self.raw.request_id()
    }
}

impl<T> Future for RequestHandle<T>
where
    T: DeserializeOwned,
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = futures::ready!(self.project().raw.poll(cx))?;
        Poll::Ready(T::deserialize(&result).map_err(|source| JsonRpcError::DeserResponse {
            source,
            type_name: std::any::type_name::<T>(),
            response: result.clone(),
        }))
    }
}
