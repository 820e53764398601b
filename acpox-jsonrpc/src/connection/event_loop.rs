//! The event loop that services a single connection.
//!
//! This is the only place where per-connection bookkeeping lives.  Handles and handler tasks talk
//! to it exclusively through channels, so none of the maps below need any locking.
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{DelayQueue, delay_queue};
use tracing::Instrument;

use super::{ConnectionConfig, ConnectionHandle, ConnectionState, Diagnostic};
use crate::capabilities::CapabilityRegistry;
use crate::{JsonRpcError, Result};
use crate::{codec, error, handler, router, transport, types};

/// Outbound messages queued ahead of the writer before callers start waiting for room
const OUTBOUND_QUEUE_DEPTH: usize = 16;

/// The running event loop, shared so that every handle can wait for it to finish.
pub(crate) type ConnectionEventLoopFuture =
    futures::future::Shared<Pin<Box<dyn Future<Output = Result<(), String>> + Send>>>;

/// Out-of-band instructions from handles to the event loop
pub(super) enum Command {
    /// Stop waiting for the response to an outbound call, and tell the remote peer so
    CancelPendingOutboundRequest { request_id: types::Id },

    /// Signal the cancellation token of an inbound call that's being handled
    CancelPendingInboundRequest { request_id: types::Id },
}

/// A message for the writer, with the channel on which its caller waits
pub(super) enum OutboundMessage {
    /// Answered with the remote peer's response, once correlated
    Method {
        request: types::Request,
        timeout: Option<Duration>,
        response_tx: oneshot::Sender<Result<types::Response>>,
    },
    /// Answered as soon as the line has been handed to the transport
    Notification {
        notification: types::Notification,
        send_confirmation_tx: oneshot::Sender<Result<()>>,
    },
}

/// Start servicing a connection to a remote peer, returning the future that runs the event loop
/// and a handle to the connection.
///
/// NOTE: The caller is responsible for polling the returned future; normally it is spawned into
/// its own task.
pub(super) fn service_connection<S: Clone + Send + Sync + 'static>(
    config: ConnectionConfig,
    router: router::Router<S>,
    peer: transport::Peer,
) -> Result<(ConnectionEventLoopFuture, ConnectionHandle)> {
    // The loop logs under whatever span the connection was bound in
    let callers_span = tracing::Span::current();

    let config = Arc::new(config);
    let cancellation_token = CancellationToken::new();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let state = Arc::new(watch::Sender::new(ConnectionState::Uninitialized));
    let (diagnostics, _) = broadcast::channel(config.diagnostics_capacity.max(1));
    let capabilities = CapabilityRegistry::new();

    // Handlers run by the event loop can ask for a handle to the connection they were called
    // from, and every handle holds the event loop's own future so it can wait for shutdown.  So
    // the event loop needs a handle to itself, which can't exist until the future does.  The
    // future therefore starts by waiting for its own handle on this channel.
    let (self_handle_tx, self_handle_rx) = oneshot::channel::<ConnectionHandle>();

    let event_loop_fut = {
        let cancellation_token = cancellation_token.clone();
        let state = state.clone();
        let diagnostics = diagnostics.clone();
        let config = config.clone();

        async move {
            let handle_oneself = self_handle_rx.await.map_err(|_| JsonRpcError::Bug {
                message: "connection handle dropped before the event loop started".to_string(),
            })?;

            let conn = ConnectionEventLoop::new(
                config,
                router,
                peer,
                handle_oneself,
                cancellation_token,
                state,
                diagnostics,
                commands_rx,
                outbound_rx,
            );
            conn.run_loop().await
        }
    };

    // The output of a shared future must be `Clone`, so flatten errors (and panics, which should
    // never happen since handler invocations have their own protection) into strings.
    let event_loop_fut = async move {
        match AssertUnwindSafe(event_loop_fut).catch_unwind().await {
            Ok(Ok(())) => Result::<(), String>::Ok(()),
            Ok(Err(e)) => Result::<(), String>::Err(e.to_string()),
            Err(e) => Result::<(), String>::Err(error::panic_err_to_string(e)),
        }
    }
    .instrument(callers_span)
    .boxed()
    .shared();

    let handle = ConnectionHandle::new(
        commands_tx,
        outbound_tx,
        state,
        capabilities,
        diagnostics,
        config,
        cancellation_token,
        event_loop_fut.clone(),
    );

    if self_handle_tx.send(handle.clone()).is_err() {
        Err(JsonRpcError::Bug {
            message: "oneshot channel dropped immediately after creating connection event loop".to_string(),
        })
    } else {
        Ok((event_loop_fut, handle))
    }
}

/// An outbound call that was written to the transport and is waiting for its response
struct PendingCall {
    method: String,
    issued_at: Instant,
    timeout: Option<Duration>,
    deadline_key: Option<delay_queue::Key>,
    response_tx: oneshot::Sender<Result<types::Response>>,
}

/// The result of handling one inbound message
struct InvocationOutcome {
    request_id: Option<types::Id>,
    method: String,
    scope: Option<String>,

    /// The response to send, if any, or the panic message if the handler panicked
    result: Result<Option<types::Response>, String>,
}

/// Inbound messages in one ordering scope, waiting to be handled one at a time by that scope's
/// worker task
struct ScopeQueue {
    tx: mpsc::UnboundedSender<BoxFuture<'static, InvocationOutcome>>,
    in_flight: usize,
}

struct ConnectionEventLoop<S: Clone + Send + Sync + 'static> {
    config: Arc<ConnectionConfig>,

    router: router::Router<S>,

    peer: transport::Peer,

    handle_oneself: ConnectionHandle,

    cancellation_token: CancellationToken,

    state: Arc<watch::Sender<ConnectionState>>,

    diagnostics: broadcast::Sender<Diagnostic>,

    commands: mpsc::UnboundedReceiver<Command>,

    outbound_messages: mpsc::Receiver<OutboundMessage>,

    /// Calls written to the remote peer and not yet answered, by the ID we gave them
    pending_outbound_requests: HashMap<types::Id, PendingCall>,

    /// Deadlines of the pending outbound requests that have a timeout
    deadlines: DelayQueue<types::Id>,

    /// Inbound method calls being handled right now, with the token that cancels each
    pending_inbound_requests: HashMap<types::Id, CancellationToken>,

    /// Tasks handling inbound messages that don't belong to an ordering scope
    pending_inbound_operations: JoinSet<InvocationOutcome>,

    /// Ordering scopes with messages queued or being handled
    scopes: HashMap<String, ScopeQueue>,

    /// One worker task per entry in [`Self::scopes`]
    scope_workers: JoinSet<()>,

    /// Outcomes of messages handled by the scope workers
    scoped_outcomes_tx: mpsc::UnboundedSender<InvocationOutcome>,
    scoped_outcomes: mpsc::UnboundedReceiver<InvocationOutcome>,
}

impl<S: Clone + Send + Sync + 'static> ConnectionEventLoop<S> {
    #[allow(clippy::too_many_arguments)]
    fn new(
        config: Arc<ConnectionConfig>,
        router: router::Router<S>,
        peer: transport::Peer,
        handle_oneself: ConnectionHandle,
        cancellation_token: CancellationToken,
        state: Arc<watch::Sender<ConnectionState>>,
        diagnostics: broadcast::Sender<Diagnostic>,
        commands: mpsc::UnboundedReceiver<Command>,
        outbound_messages: mpsc::Receiver<OutboundMessage>,
    ) -> Self {
        let (scoped_outcomes_tx, scoped_outcomes) = mpsc::unbounded_channel();
        Self {
            config,
            router,
            peer,
            handle_oneself,
            cancellation_token,
            state,
            diagnostics,
            commands,
            outbound_messages,
            pending_outbound_requests: HashMap::new(),
            deadlines: DelayQueue::new(),
            pending_inbound_requests: HashMap::new(),
            pending_inbound_operations: JoinSet::new(),
            scopes: HashMap::new(),
            scope_workers: JoinSet::new(),
            scoped_outcomes_tx,
            scoped_outcomes,
        }
    }

    async fn run_loop(self) -> Result<()> {
        let transport_span = self.peer.span();
        let remote_peer = self.peer.remote_peer();

        let result = self
            .event_loop()
            .instrument(tracing::debug_span!(parent: &transport_span, "connection", %remote_peer))
            .await;

        if let Err(e) = &result {
            tracing::error!(%remote_peer, "Event loop terminated due to an error: {}", e);
        }

        result
    }

    async fn event_loop(mut self) -> Result<()> {
        tracing::debug!(state = std::any::type_name::<S>(), "Connection event loop started");

        let result = loop {
            tokio::select! {
                Some(command) = self.commands.recv() => {
                    self.handle_command(command);
                },
                Some(outbound_message) = self.outbound_messages.recv() => {
                    self.handle_outbound_message(outbound_message);
                },
                event = self.peer.next_event() => {
                    match event {
                        transport::TransportEvent::Line(line) => self.handle_inbound_line(line),
                        transport::TransportEvent::ReadError(e) => {
                            tracing::warn!(err = %e, "Failed to read a message from the remote peer; skipping it");
                            self.emit(Diagnostic::ReadError { message: e.to_string() });
                        }
                        transport::TransportEvent::Closed { reason: None } => {
                            tracing::debug!("Remote peer hung up");
                            break Ok(());
                        }
                        transport::TransportEvent::Closed { reason: Some(e) } => {
                            break Err(e);
                        }
                        transport::TransportEvent::WriteFailed { message } => {
                            break Err(JsonRpcError::Transport { source: message.into() });
                        }
                    }
                },
                Some(next) = self.pending_inbound_operations.join_next(),
                    if !self.pending_inbound_operations.is_empty() => {
                    self.handle_operation_join_result(next);
                },
                Some(outcome) = self.scoped_outcomes.recv() => {
                    self.handle_invocation_outcome(outcome);
                },
                Some(_) = self.scope_workers.join_next(), if !self.scope_workers.is_empty() => {
                    // A scope ran dry and its worker exited
                },
                Some(expired) = futures::future::poll_fn(|cx| self.deadlines.poll_expired(cx)),
                    if !self.deadlines.is_empty() => {
                    self.handle_expired_deadline(expired.into_inner());
                },
                _ = self.cancellation_token.cancelled() => {
                    tracing::debug!("Cancellation signal received, shutting down connection");
                    break Err(JsonRpcError::Cancelled)
                }
            }
        };

        self.shutdown(result).await
    }

    /// Bring everything in flight to some conclusion, close the transport, and produce the final
    /// result of the event loop.
    async fn shutdown(mut self, result: Result<()>) -> Result<()> {
        // From here on handles fail fast rather than queue anything new
        self.state.send_replace(ConnectionState::Closed);

        self.outbound_messages.close();
        while let Some(outbound_message) = self.outbound_messages.recv().await {
            match outbound_message {
                OutboundMessage::Method {
                    request, response_tx, ..
                } => {
                    tracing::debug!(request_id = %request.id,
                        method = %request.method,
                        "Connection closing; call never sent");
                    let _ = response_tx.send(Err(JsonRpcError::ConnectionClosed));
                }
                OutboundMessage::Notification {
                    notification,
                    send_confirmation_tx,
                } => {
                    tracing::debug!(notification = %notification.method,
                        "Connection closing; notification never sent");
                    let _ = send_confirmation_tx.send(Err(JsonRpcError::ConnectionClosed));
                }
            }
        }
        self.commands.close();
        while self.commands.recv().await.is_some() {}

        // Calls that were sent will never get a response now
        if !self.pending_outbound_requests.is_empty() {
            tracing::debug!(
                unanswered = self.pending_outbound_requests.len(),
                "Failing calls the remote peer never answered"
            );
        }
        for (id, pending) in self.pending_outbound_requests.drain() {
            tracing::trace!(request_id = %id, method = %pending.method, "Call failed by close");
            let _ = pending.response_tx.send(Err(JsonRpcError::ConnectionClosed));
        }
        self.deadlines.clear();

        // Every inbound handler's token is a child of this one
        self.cancellation_token.cancel();

        self.wait_for_inbound_operations().await;

        for line in self.peer.close().await {
            tracing::debug!(%line, "Line arrived after the connection stopped reading; discarding it");
        }

        let (result, termination_reason) = match result {
            Ok(()) => (Ok(()), "eof"),
            Err(JsonRpcError::Cancelled) => (Ok(()), "shutdown"),
            Err(e) => (Err(e), "failed"),
        };

        tracing::debug!(termination_reason, "Connection event loop finished");
        result
    }

    /// Give inbound handlers still running a chance to finish and have their responses written,
    /// then abort whatever is left.
    async fn wait_for_inbound_operations(&mut self) {
        let deadline = self
            .config
            .graceful_shutdown_timeout
            .and_then(|timeout| Instant::now().checked_add(timeout));
        tracing::debug!(
            running_handlers = self.pending_inbound_operations.len(),
            busy_scopes = self.scopes.len(),
            graceful_shutdown_timeout = ?self.config.graceful_shutdown_timeout,
            "Letting inbound handlers finish"
        );

        let timed_out = loop {
            if self.pending_inbound_operations.is_empty() && self.scopes.is_empty() {
                break false;
            }

            let next = async {
                tokio::select! {
                    Some(next) = self.pending_inbound_operations.join_next(),
                        if !self.pending_inbound_operations.is_empty() => Some(Ok(next)),
                    Some(outcome) = self.scoped_outcomes.recv() => Some(Err(outcome)),
                    else => None,
                }
            };

            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, next).await {
                    Ok(next) => next,
                    Err(_) => break true,
                },
                None => next.await,
            };

            match next {
                Some(Ok(join_result)) => self.handle_operation_join_result(join_result),
                Some(Err(outcome)) => self.handle_invocation_outcome(outcome),
                None => break false,
            }
        };

        if timed_out {
            tracing::warn!(
                graceful_shutdown_timeout = ?self.config.graceful_shutdown_timeout,
                running_handlers = self.pending_inbound_operations.len(),
                busy_scopes = self.scopes.len(),
                "Inbound handlers outlived the graceful shutdown window; aborting them"
            );
        }

        self.pending_inbound_operations.abort_all();
        while let Some(join_result) = self.pending_inbound_operations.join_next().await {
            self.handle_operation_join_result(join_result);
        }
        self.scope_workers.abort_all();
        while self.scope_workers.join_next().await.is_some() {}
        while let Ok(outcome) = self.scoped_outcomes.try_recv() {
            self.handle_invocation_outcome(outcome);
        }
        self.scopes.clear();

        // Any call still in this map was aborted before it could respond
        for (request_id, _) in std::mem::take(&mut self.pending_inbound_requests) {
            self.send_message(
                types::Response::error_detail(
                    request_id,
                    types::ErrorDetails::internal_error("Request aborted because the connection is closing", None),
                )
                .into(),
                None,
            );
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::CancelPendingOutboundRequest { request_id } => {
                // The handle only exists once its request was queued, so anything still queued
                // must be registered before deciding whether this ID is pending
                while let Ok(outbound_message) = self.outbound_messages.try_recv() {
                    self.handle_outbound_message(outbound_message);
                }

                match self.pending_outbound_requests.remove(&request_id) {
                    Some(pending) => {
                        tracing::debug!(%request_id, method = %pending.method, "Cancelling pending outbound request");
                        if let Some(key) = pending.deadline_key {
                            self.deadlines.remove(&key);
                        }
                        let _ = pending.response_tx.send(Err(JsonRpcError::Cancelled));
                        self.send_cancel_notification(&request_id);
                    }
                    None => {
                        tracing::trace!(%request_id, "Cancelled request is no longer pending");
                    }
                }
            }
            Command::CancelPendingInboundRequest { request_id } => {
                self.cancel_inbound_request(&request_id);
            }
        }
    }

    /// Write a message from a handle.  Failures go back to the caller over its oneshot rather than
    /// ending the loop.
    fn handle_outbound_message(&mut self, outbound_message: OutboundMessage) {
        match outbound_message {
            OutboundMessage::Method {
                request,
                timeout,
                response_tx,
            } => {
                if response_tx.is_closed() {
                    tracing::debug!(request_id = %request.id, method = %request.method,
                        "Caller gave up on the request before it was sent; dropping it");
                    return;
                }

                let line = match codec::encode_line(&request.clone().into()) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::error!(err = %e, request_id = %request.id, "Failed to encode outbound request");
                        let _ = response_tx.send(Err(e));
                        return;
                    }
                };

                let deadline_key = timeout.map(|timeout| self.deadlines.insert(request.id.clone(), timeout));
                let previous = self.pending_outbound_requests.insert(
                    request.id.clone(),
                    PendingCall {
                        method: request.method.clone(),
                        issued_at: Instant::now(),
                        timeout,
                        deadline_key,
                        response_tx,
                    },
                );
                if let Some(previous) = previous {
                    // IDs come from a counter, so this would take 2^64 calls
                    tracing::error!(request_id = %request.id, "BUG: request ID reused while still pending");
                    if let Some(key) = previous.deadline_key {
                        self.deadlines.remove(&key);
                    }
                    let _ = previous.response_tx.send(Err(JsonRpcError::Bug {
                        message: format!("request ID {} reused while still pending", request.id),
                    }));
                }

                tracing::trace!(request_id = %request.id, method = %request.method, ?timeout, "Sending request");
                self.peer.send(line, None);
            }
            OutboundMessage::Notification {
                notification,
                send_confirmation_tx,
            } => {
                tracing::trace!(method = %notification.method, "Sending notification");
                self.send_message(notification.into(), Some(send_confirmation_tx));
            }
        }
    }

    fn handle_inbound_line(&mut self, line: String) {
        match codec::decode_line(&line) {
            Ok(types::Message::Response(response)) => self.handle_inbound_response(response),
            Ok(types::Message::Request(request)) => self.handle_inbound_request(request),
            Ok(types::Message::Notification(notification)) => self.handle_inbound_notification(notification),
            Err(e) => {
                tracing::warn!(err = %e, %line, "Received malformed message from remote peer");

                if let Some(request_id) = e.request_id() {
                    self.send_message(
                        types::Response::error_detail(request_id.clone(), e.to_error_details()).into(),
                        None,
                    );
                }

                self.emit(Diagnostic::MalformedMessage {
                    reason: e.to_string(),
                    line,
                });
            }
        }
    }

    fn handle_inbound_response(&mut self, response: types::Response) {
        match self.pending_outbound_requests.remove(&response.id) {
            Some(pending) => {
                if let Some(key) = pending.deadline_key {
                    self.deadlines.remove(&key);
                }
                tracing::trace!(request_id = %response.id,
                    method = %pending.method,
                    elapsed = ?pending.issued_at.elapsed(),
                    "Received response");

                if pending.response_tx.send(Ok(response)).is_err() {
                    tracing::debug!("Caller stopped waiting before the response arrived");
                }
            }
            None => {
                tracing::warn!(request_id = %response.id, "Received response to unknown request; ignoring it");
                self.emit(Diagnostic::UnknownResponse { id: response.id });
            }
        }
    }

    fn handle_inbound_request(&mut self, request: types::Request) {
        if self.pending_inbound_requests.contains_key(&request.id) {
            tracing::warn!(request_id = %request.id, method = %request.method,
                "Remote peer reused the ID of a request that is still being handled");

            self.send_message(
                types::Response::error_detail(
                    types::Id::Null,
                    types::ErrorDetails::invalid_request(
                        "Duplicate request ID",
                        json!({
                            "duplicated_request_id": request.id,
                            "method": request.method,
                        }),
                    ),
                )
                .into(),
                None,
            );
            self.emit(Diagnostic::DuplicateRequestId {
                id: request.id,
                method: request.method,
            });
            return;
        }

        let cancellation_token = self.cancellation_token.child_token();
        let request_id = request.id.clone();
        let method = request.method.clone();
        let scope = self.router.ordering_scope_for(&method, request.params.as_ref());
        let invocation = handler::InvocationRequest::from_request_message(
            self.handle_oneself.clone(),
            request,
            cancellation_token.clone(),
        );

        // Method calls always produce a response, if only from the fallback handler
        if let Some(invocation) = self.router.handle_invocation(invocation) {
            self.pending_inbound_requests
                .insert(request_id.clone(), cancellation_token);
            self.dispatch(Some(request_id), method, scope, invocation);
        }
    }

    fn handle_inbound_notification(&mut self, notification: types::Notification) {
        if self.config.cancel_method.as_deref() == Some(notification.method.as_str()) {
            match notification
                .params
                .as_ref()
                .and_then(|params| params.get("requestId"))
                .and_then(types::Id::from_json)
            {
                Some(request_id) => self.cancel_inbound_request(&request_id),
                None => {
                    tracing::warn!(params = ?notification.params, "Cancel notification without a valid request ID");
                }
            }
            return;
        }

        let method = notification.method.clone();
        let scope = self
            .router
            .ordering_scope_for(&method, notification.params.as_ref());
        let invocation = handler::InvocationRequest::from_notification_message(
            self.handle_oneself.clone(),
            notification,
            self.cancellation_token.child_token(),
        );

        if let Some(invocation) = self.router.handle_invocation(invocation) {
            self.dispatch(None, method, scope, invocation);
        }
    }

    fn cancel_inbound_request(&mut self, request_id: &types::Id) {
        match self.pending_inbound_requests.get(request_id) {
            Some(token) => {
                tracing::debug!(%request_id, "Cancelling inbound request");
                token.cancel();
            }
            None => {
                tracing::debug!(%request_id, "Request to cancel is not being handled; ignoring");
            }
        }
    }

    /// Run a handler invocation, concurrently with everything else unless it belongs to an ordering
    /// scope, in which case it runs after everything queued ahead of it in that scope.
    fn dispatch(
        &mut self,
        request_id: Option<types::Id>,
        method: String,
        scope: Option<String>,
        invocation: BoxFuture<'static, Option<types::Response>>,
    ) {
        let span = tracing::debug_span!("invocation", %method, request_id = ?request_id, scope = ?scope);
        let operation = {
            let scope = scope.clone();
            async move {
                let result = AssertUnwindSafe(invocation)
                    .catch_unwind()
                    .await
                    .map_err(error::panic_err_to_string);
                InvocationOutcome {
                    request_id,
                    method,
                    scope,
                    result,
                }
            }
            .instrument(span)
        };

        match scope {
            None => {
                self.pending_inbound_operations.spawn(operation);
            }
            Some(scope) => {
                let queue = match self.scopes.entry(scope) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => {
                        let (tx, rx) = mpsc::unbounded_channel();
                        self.scope_workers.spawn(
                            Self::scope_worker(rx, self.scoped_outcomes_tx.clone())
                                .instrument(tracing::trace_span!("scope_worker", scope = %entry.key())),
                        );
                        entry.insert(ScopeQueue { tx, in_flight: 0 })
                    }
                };

                queue.in_flight += 1;
                if queue.tx.send(operation.boxed()).is_err() {
                    // The worker only exits once its queue is removed from the map
                    tracing::error!("BUG: scope worker exited while its queue was still in use");
                }
            }
        }
    }

    async fn scope_worker(
        mut queue: mpsc::UnboundedReceiver<BoxFuture<'static, InvocationOutcome>>,
        outcomes: mpsc::UnboundedSender<InvocationOutcome>,
    ) {
        while let Some(operation) = queue.recv().await {
            if outcomes.send(operation.await).is_err() {
                break;
            }
        }
    }

    fn handle_operation_join_result(&mut self, result: Result<InvocationOutcome, tokio::task::JoinError>) {
        match result {
            Ok(outcome) => self.handle_invocation_outcome(outcome),
            Err(join_err) => {
                // Panics are caught inside the task, so this is an abort during shutdown
                tracing::warn!(task_id = %join_err.id(), %join_err, "Inbound handler task aborted");
            }
        }
    }

    fn handle_invocation_outcome(&mut self, outcome: InvocationOutcome) {
        let InvocationOutcome {
            request_id,
            method,
            scope,
            result,
        } = outcome;

        if let Some(scope) = scope {
            if let Entry::Occupied(mut entry) = self.scopes.entry(scope) {
                let queue = entry.get_mut();
                queue.in_flight = queue.in_flight.saturating_sub(1);
                if queue.in_flight == 0 {
                    // Dropping the sender lets the worker exit
                    entry.remove();
                }
            }
        }

        if let Some(request_id) = &request_id {
            self.pending_inbound_requests.remove(request_id);
        }

        match result {
            Ok(Some(response)) => self.send_message(response.into(), None),
            Ok(None) => {}
            Err(message) => {
                tracing::error!(%method, request_id = ?request_id, panic = %message, "Handler panicked");
                if let Some(request_id) = request_id {
                    self.send_message(
                        types::Response::error_detail(
                            request_id,
                            types::ErrorDetails::internal_error(
                                format!("Handler for method '{method}' panicked"),
                                None,
                            ),
                        )
                        .into(),
                        None,
                    );
                }
                self.emit(Diagnostic::HandlerPanicked { method, message });
            }
        }
    }

    fn handle_expired_deadline(&mut self, request_id: types::Id) {
        if let Some(pending) = self.pending_outbound_requests.remove(&request_id) {
            let timeout = pending.timeout.unwrap_or_default();
            tracing::warn!(%request_id, method = %pending.method, ?timeout, "Outbound request timed out");

            let _ = pending.response_tx.send(Err(JsonRpcError::Timeout {
                method: pending.method.into(),
                timeout,
            }));
            self.send_cancel_notification(&request_id);
        }
    }

    /// Tell the remote peer we're no longer waiting for the response to a request
    fn send_cancel_notification(&self, request_id: &types::Id) {
        if let Some(cancel_method) = &self.config.cancel_method {
            let notification = types::Notification::new(cancel_method.clone(), json!({ "requestId": request_id }));
            self.send_message(notification.into(), None);
        }
    }

    /// Encode a message and queue it for the writer
    fn send_message(&self, message: types::Message, confirm: Option<oneshot::Sender<Result<()>>>) {
        match codec::encode_line(&message) {
            Ok(line) => self.peer.send(line, confirm),
            Err(e) => {
                let (kind, id, method) = message.diagnostic_context();
                tracing::error!(err = %e, kind, ?id, ?method, "Failed to serialize message to JSON");
                if let Some(confirm) = confirm {
                    let _ = confirm.send(Err(e));
                }
            }
        }
    }

    fn emit(&self, diagnostic: Diagnostic) {
        // No subscribers is fine
        let _ = self.diagnostics.send(diagnostic);
    }
}
