//! Integration tests to exercise the JSON-RPC crate using its public interface.
//!
//! Two kinds of remote peer are used here: a [`RawPeer`] at the far end of an in-memory byte
//! stream, for tests that care about the exact bytes on the wire, and another connection running
//! the test service, for tests of the two engines talking to each other.

// `testing` is `cfg(test)` only, and integration tests don't get that
#[path = "../src/testing.rs"]
mod test_helpers;
mod test_service;

use std::sync::Arc;
use std::time::Duration;

use acpox_jsonrpc::{
    Capabilities, CapabilityKey, ConnectionBuilder, ConnectionConfig, ConnectionHandle, ConnectionState,
    Diagnostic, ErrorCode, Id, JsonRpcError, JsonValue, NdjsonCodec, Params, Router, State,
};
use assert_matches::assert_matches;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

const LINE_TIMEOUT: Duration = Duration::from_secs(5);

/// The far end of a connection, reading and writing raw lines
struct RawPeer {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl RawPeer {
    /// Read the next line, including its terminating newline
    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        let bytes = tokio::time::timeout(LINE_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("Timed out waiting for a line")
            .unwrap();
        assert!(bytes > 0, "Connection closed while waiting for a line");
        line
    }

    async fn read_json(&mut self) -> JsonValue {
        serde_json::from_str(&self.read_line().await).unwrap()
    }

    async fn write_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn expect_nothing(&mut self, duration: Duration) {
        let mut line = String::new();
        if let Ok(result) = tokio::time::timeout(duration, self.reader.read_line(&mut line)).await {
            panic!("Expected nothing on the wire, got {result:?}: {line:?}");
        }
    }

}

/// Bind a connection to one end of an in-memory byte stream, framed as NDJSON, and hand back the
/// other end
fn raw_connection<S: Clone + Send + Sync + 'static>(
    router: Router<S>,
    config: ConnectionConfig,
) -> (ConnectionHandle, RawPeer) {
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let handle = ConnectionBuilder::new()
        .with_config(config)
        .with_router(router)
        .bind(Framed::new(ours, NdjsonCodec::new()))
        .unwrap();

    let (reader, writer) = tokio::io::split(theirs);
    (
        handle,
        RawPeer {
            reader: BufReader::new(reader),
            writer,
        },
    )
}

/// Run the handshake from `handle`'s side with the raw peer answering it with the given
/// capabilities.  The handshake is the first request, so it always has ID 1.
async fn raw_handshake(handle: &ConnectionHandle, peer: &mut RawPeer, agent_capabilities: JsonValue) {
    let task = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .handshake("initialize", json!({"protocolVersion": 1}), |result| {
                    Capabilities::from_json(&result["agentCapabilities"])
                })
                .await
        }
    });

    assert_eq!(
        peer.read_json().await,
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {"protocolVersion": 1}})
    );
    peer.write_line(
        &json!({"jsonrpc": "2.0", "id": 1, "result": {"protocolVersion": 1, "agentCapabilities": agent_capabilities}})
            .to_string(),
    )
    .await;

    task.await.unwrap().unwrap();
    assert_eq!(handle.state(), ConnectionState::Ready);
}

/// A pair of connections talking to each other: the "client" side with a callback method and a
/// notification handler, and the test service on the other.  The handshake is done.
async fn connected_pair() -> (ConnectionHandle, ConnectionHandle, mpsc::UnboundedReceiver<JsonValue>) {
    async fn client_callback(Params(params): Params<JsonValue>) -> JsonValue {
        json!({"message": "Hello from the client", "params": params})
    }

    async fn client_notification(State(tx): State<mpsc::UnboundedSender<JsonValue>>, params: JsonValue) {
        let _ = tx.send(params);
    }

    let (client_transport, server_transport) = test_helpers::setup_test_channel();
    let server = ConnectionBuilder::new()
        .with_router(test_service::test_service_router())
        .bind(server_transport)
        .unwrap();

    let (notifications_tx, notifications_rx) = mpsc::unbounded_channel();
    let client = ConnectionBuilder::new()
        .with_state(notifications_tx)
        .with_handler("client_callback", client_callback)
        .with_handler("client_notification", client_notification)
        .bind(client_transport)
        .unwrap();

    let result = client
        .handshake(
            "initialize",
            json!({"protocolVersion": 1, "clientCapabilities": {"fs": {"readTextFile": true}}}),
            |result| Capabilities::from_json(&result["agentCapabilities"]),
        )
        .await
        .unwrap();
    assert_eq!(result["protocolVersion"], json!(1));

    (client, server, notifications_rx)
}

#[tokio::test]
async fn handshake_writes_exact_bytes() {
    test_helpers::init_test_logging();

    let (handle, mut peer) = raw_connection(Router::new_stateless(), ConnectionConfig::default());
    assert_eq!(handle.state(), ConnectionState::Uninitialized);

    let task = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .handshake("initialize", json!({"protocolVersion": 1}), |_| Capabilities::none())
                .await
        }
    });

    assert_eq!(
        peer.read_line().await,
        "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\",\"params\":{\"protocolVersion\":1}}\n"
    );
    peer.write_line(r#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":1}}"#)
        .await;

    assert_eq!(task.await.unwrap().unwrap(), json!({"protocolVersion": 1}));
    assert_eq!(handle.state(), ConnectionState::Ready);
    assert!(handle.capabilities().is_set());
}

#[tokio::test]
async fn unsolicited_response_is_dropped() {
    test_helpers::init_test_logging();

    async fn ping() -> JsonValue {
        json!({"pong": true})
    }

    let mut router = Router::new_stateless();
    router.register_handler("ping", ping);
    let (handle, mut peer) = raw_connection(router, ConnectionConfig::default());
    let mut diagnostics = handle.diagnostics();

    peer.write_line(r#"{"jsonrpc":"2.0","id":7,"result":{}}"#).await;
    assert_eq!(
        diagnostics.recv().await.unwrap(),
        Diagnostic::UnknownResponse { id: Id::Number(7) }
    );
    peer.expect_nothing(Duration::from_millis(50)).await;

    // Still alive and well
    peer.write_line(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).await;
    assert_eq!(peer.read_json().await, json!({"jsonrpc": "2.0", "id": 1, "result": {"pong": true}}));
    assert_eq!(handle.state(), ConnectionState::Uninitialized);
}

#[tokio::test]
async fn inbound_call_is_answered_with_exact_bytes() {
    test_helpers::init_test_logging();

    async fn ping() -> JsonValue {
        json!({"pong": true})
    }

    let mut router = Router::new_stateless();
    router.register_handler("ping", ping);
    let (_handle, mut peer) = raw_connection(router, ConnectionConfig::default());

    peer.write_line(r#"{"jsonrpc":"2.0","id":3,"method":"ping","params":{}}"#)
        .await;
    assert_eq!(peer.read_line().await, "{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"pong\":true}}\n");
}

#[tokio::test]
async fn negative_request_ids_are_answered() {
    test_helpers::init_test_logging();

    async fn ping() -> JsonValue {
        json!({"pong": true})
    }

    let mut router = Router::new_stateless();
    router.register_handler("ping", ping);
    let (_handle, mut peer) = raw_connection(router, ConnectionConfig::default());

    peer.write_line(r#"{"jsonrpc":"2.0","id":-5,"method":"ping"}"#).await;
    assert_eq!(peer.read_line().await, "{\"jsonrpc\":\"2.0\",\"id\":-5,\"result\":{\"pong\":true}}\n");

    // Malformed, but the id is still recovered for the error
    peer.write_line(r#"{"jsonrpc":"1.0","id":-7,"method":"ping"}"#).await;
    let error = peer.read_json().await;
    assert_eq!(error["id"], json!(-7));
    assert_eq!(error["error"]["code"], json!(-32600));
}

#[tokio::test]
async fn timed_out_call_sends_cancel_notification() {
    test_helpers::init_test_logging();

    let (handle, mut peer) = raw_connection(Router::new_stateless(), ConnectionConfig::default());
    raw_handshake(&handle, &mut peer, json!({})).await;

    let started = tokio::time::Instant::now();
    let result = handle
        .call_with_timeout::<_, JsonValue>("session/prompt", json!({"sessionId": "s1"}), Duration::from_millis(10))
        .await;
    assert_matches!(result, Err(JsonRpcError::Timeout { method, timeout }) => {
        assert_eq!(method, "session/prompt");
        assert_eq!(timeout, Duration::from_millis(10));
    });
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(
        peer.read_json().await,
        json!({"jsonrpc": "2.0", "id": 2, "method": "session/prompt", "params": {"sessionId": "s1"}})
    );
    assert_eq!(
        peer.read_json().await,
        json!({"jsonrpc": "2.0", "method": "$/cancel_request", "params": {"requestId": 2}})
    );

    // The response is too late to matter
    let mut diagnostics = handle.diagnostics();
    peer.write_line(r#"{"jsonrpc":"2.0","id":2,"result":"finally"}"#).await;
    assert_eq!(
        diagnostics.recv().await.unwrap(),
        Diagnostic::UnknownResponse { id: Id::Number(2) }
    );
}

#[tokio::test]
async fn default_timeout_comes_from_config() {
    test_helpers::init_test_logging();

    let config = ConnectionConfig {
        default_call_timeout: Some(Duration::from_millis(20)),
        cancel_method: None,
        ..Default::default()
    };
    let (handle, mut peer) = raw_connection(Router::new_stateless(), config);
    raw_handshake(&handle, &mut peer, json!({})).await;

    assert_matches!(
        handle.call::<JsonValue>("slow").await,
        Err(JsonRpcError::Timeout { timeout, .. }) if timeout == Duration::from_millis(20)
    );

    // Cancel notifications are disabled
    assert_eq!(peer.read_json().await["method"], json!("slow"));
    peer.expect_nothing(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn gated_call_writes_nothing() {
    test_helpers::init_test_logging();

    let (handle, mut peer) = raw_connection(Router::new_stateless(), ConnectionConfig::default());
    raw_handshake(
        &handle,
        &mut peer,
        json!({"loadSession": false, "promptCapabilities": {"image": true}}),
    )
    .await;

    assert!(handle.capabilities().is_enabled(CapabilityKey::PromptImage));
    assert!(!handle.capabilities().is_enabled(CapabilityKey::LoadSession));

    let result = handle
        .call_gated::<_, JsonValue>(
            CapabilityKey::LoadSession,
            "session/load",
            json!({"sessionId": "s1"}),
        )
        .await;
    assert_matches!(result, Err(JsonRpcError::CapabilityNotSupported { method, capability }) => {
        assert_eq!(method, "session/load");
        assert_eq!(capability, CapabilityKey::LoadSession);
    });
    peer.expect_nothing(Duration::from_millis(50)).await;

    // Not even a request ID was spent on it
    let task = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .call_gated::<_, JsonValue>(CapabilityKey::PromptImage, "session/prompt", json!({}))
                .await
        }
    });
    assert_eq!(peer.read_json().await["id"], json!(2));
    peer.write_line(r#"{"jsonrpc":"2.0","id":2,"result":{"stopReason":"end_turn"}}"#)
        .await;
    assert_eq!(task.await.unwrap().unwrap(), json!({"stopReason": "end_turn"}));
}

#[tokio::test]
async fn calls_before_handshake_are_refused() {
    test_helpers::init_test_logging();

    let (handle, mut peer) = raw_connection(Router::new_stateless(), ConnectionConfig::default());

    assert_matches!(
        handle.call::<JsonValue>("session/new").await,
        Err(JsonRpcError::HandshakeNotComplete)
    );
    assert_matches!(
        handle.notify("session/cancel").await,
        Err(JsonRpcError::HandshakeNotComplete)
    );
    peer.expect_nothing(Duration::from_millis(50)).await;

    raw_handshake(&handle, &mut peer, json!({})).await;

    assert_matches!(
        handle
            .handshake("initialize", json!({}), |_| Capabilities::none())
            .await,
        Err(JsonRpcError::HandshakeAlreadyComplete)
    );
    assert_matches!(
        handle.complete_handshake(Capabilities::none()),
        Err(JsonRpcError::HandshakeAlreadyComplete)
    );
}

#[tokio::test]
async fn failed_handshake_leaves_connection_uninitialized() {
    test_helpers::init_test_logging();

    let (handle, mut peer) = raw_connection(Router::new_stateless(), ConnectionConfig::default());

    let task = tokio::spawn({
        let handle = handle.clone();
        async move {
            handle
                .handshake("initialize", json!({"protocolVersion": 99}), |_| Capabilities::none())
                .await
        }
    });
    peer.read_line().await;
    peer.write_line(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"Unsupported version","data":{"supported":[1]}}}"#)
        .await;

    assert_matches!(task.await.unwrap(), Err(JsonRpcError::MethodError { method, error }) => {
        assert_eq!(method, "initialize");
        assert_eq!(error.code, ErrorCode::InvalidParams);
        assert_eq!(error.message, "Unsupported version");
        assert_eq!(error.data, Some(json!({"supported": [1]})));
    });
    assert_eq!(handle.state(), ConnectionState::Uninitialized);
    assert!(!handle.capabilities().is_set());
}

#[tokio::test]
async fn pending_calls_fail_when_transport_closes() {
    test_helpers::init_test_logging();

    let (handle, mut peer) = raw_connection(Router::new_stateless(), ConnectionConfig::default());
    raw_handshake(&handle, &mut peer, json!({})).await;

    let mut pending = Vec::new();
    for i in 0..5 {
        pending.push(
            handle
                .start_call_with_params::<_, JsonValue>("session/prompt", json!({"n": i}))
                .await
                .unwrap(),
        );
    }
    for _ in 0..5 {
        peer.read_line().await;
    }

    drop(peer);

    for request in pending {
        assert_matches!(request.await, Err(JsonRpcError::ConnectionClosed));
    }
    assert_eq!(handle.wait_closed().await, Ok(()));
    assert_eq!(handle.state(), ConnectionState::Closed);

    assert_matches!(
        handle.call::<JsonValue>("session/new").await,
        Err(JsonRpcError::ConnectionClosed)
    );
    assert_matches!(
        handle.notify("session/cancel").await,
        Err(JsonRpcError::ConnectionClosed)
    );
}

#[tokio::test]
async fn dropping_request_handle_cancels_the_call() {
    test_helpers::init_test_logging();

    let (handle, mut peer) = raw_connection(Router::new_stateless(), ConnectionConfig::default());
    raw_handshake(&handle, &mut peer, json!({})).await;

    let request = handle
        .start_call_with_params::<_, JsonValue>("session/prompt", json!({}))
        .await
        .unwrap();
    assert_eq!(request.request_id(), Id::Number(2));
    assert_eq!(peer.read_json().await["id"], json!(2));

    drop(request);
    assert_eq!(
        peer.read_json().await,
        json!({"jsonrpc": "2.0", "method": "$/cancel_request", "params": {"requestId": 2}})
    );

    // Explicit cancellation does the same, and then it's over
    let request = handle
        .start_call_with_params::<_, JsonValue>("session/prompt", json!({}))
        .await
        .unwrap();
    assert_eq!(peer.read_json().await["id"], json!(3));
    assert_matches!(request.cancel().await, Err(JsonRpcError::Cancelled));
    assert_eq!(
        peer.read_json().await,
        json!({"jsonrpc": "2.0", "method": "$/cancel_request", "params": {"requestId": 3}})
    );
}

#[tokio::test]
async fn call_awaited_elsewhere_is_cancelled_through_its_canceller() {
    test_helpers::init_test_logging();

    let (handle, mut peer) = raw_connection(Router::new_stateless(), ConnectionConfig::default());
    raw_handshake(&handle, &mut peer, json!({})).await;

    let request = handle
        .start_call_with_params::<_, JsonValue>("session/prompt", json!({}))
        .await
        .unwrap();
    let canceller = request.canceller();
    assert_eq!(canceller.request_id(), &Id::Number(2));
    let waiter = tokio::spawn(request);
    assert_eq!(peer.read_json().await["id"], json!(2));

    canceller.cancel();
    assert_matches!(
        tokio::time::timeout(LINE_TIMEOUT, waiter).await.unwrap().unwrap(),
        Err(JsonRpcError::Cancelled)
    );
    assert_eq!(
        peer.read_json().await,
        json!({"jsonrpc": "2.0", "method": "$/cancel_request", "params": {"requestId": 2}})
    );

    // The response that turns up afterwards belongs to nobody, and cancelling again does nothing
    let mut diagnostics = handle.diagnostics();
    peer.write_line(r#"{"jsonrpc":"2.0","id":2,"result":{"stopReason":"cancelled"}}"#).await;
    assert_eq!(
        tokio::time::timeout(LINE_TIMEOUT, diagnostics.recv()).await.unwrap().unwrap(),
        Diagnostic::UnknownResponse { id: Id::Number(2) }
    );
    canceller.cancel();
    peer.expect_nothing(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn concurrent_calls_are_correlated() {
    test_helpers::init_test_logging();

    let (client, _server, _notifications) = connected_pair().await;

    // Later calls finish sooner, so responses come back in the opposite order
    let calls = (0..20u64).map(|i| {
        let client = client.clone();
        async move {
            let slept: JsonValue = client
                .call_with_params("sleep", json!({"ms": 100 - i * 5}))
                .await
                .unwrap();
            let echoed: JsonValue = client.call_with_params("echo", json!({"i": i})).await.unwrap();
            (slept, echoed)
        }
    });

    for (i, (slept, echoed)) in futures::future::join_all(calls).await.into_iter().enumerate() {
        assert_eq!(slept, json!("done"));
        assert_eq!(echoed, json!({"i": i}));
    }
}

#[tokio::test]
async fn capabilities_are_exchanged_both_ways() {
    test_helpers::init_test_logging();

    let (client, server, _notifications) = connected_pair().await;

    assert_eq!(client.state(), ConnectionState::Ready);
    assert_eq!(server.state(), ConnectionState::Ready);

    assert!(client.capabilities().is_enabled(CapabilityKey::PromptImage));
    assert!(!client.capabilities().is_enabled(CapabilityKey::PromptAudio));
    assert!(!client.capabilities().is_enabled(CapabilityKey::LoadSession));

    assert!(server.capabilities().is_enabled(CapabilityKey::FsReadTextFile));
    assert!(!server.capabilities().is_enabled(CapabilityKey::FsWriteTextFile));
    assert!(!server.capabilities().is_enabled(CapabilityKey::Terminal));
}

#[tokio::test]
async fn remote_peer_can_call_back_during_a_call() {
    test_helpers::init_test_logging();

    let (client, _server, mut notifications) = connected_pair().await;

    let result: JsonValue = client
        .call_with_params(
            "call_caller_method",
            json!({"method": "client_callback", "params": {"path": "/tmp/x"}}),
        )
        .await
        .unwrap();
    assert_eq!(
        result,
        json!({"message": "Hello from the client", "params": {"path": "/tmp/x"}})
    );

    let result: JsonValue = client
        .call_with_params(
            "raise_caller_notification",
            json!({"method": "client_notification", "params": {"update": 1}}),
        )
        .await
        .unwrap();
    assert_eq!(result, JsonValue::Null);
    assert_eq!(notifications.recv().await.unwrap(), json!({"update": 1}));

    // An error from the callback makes its way back through both calls
    let result = client
        .call_with_params::<_, JsonValue>("call_caller_method", json!({"method": "no_such_callback"}))
        .await;
    assert_matches!(result, Err(JsonRpcError::MethodError { method, error }) => {
        assert_eq!(method, "call_caller_method");
        assert_eq!(error.code, ErrorCode::MethodNotFound);
        assert_eq!(error.message, "Unknown method 'no_such_callback'");
    });
}

#[tokio::test]
async fn handler_errors_become_method_errors() {
    test_helpers::init_test_logging();

    let (client, server, _notifications) = connected_pair().await;
    let mut server_diagnostics = server.diagnostics();

    assert_matches!(
        client.call::<JsonValue>("fail_with_error").await,
        Err(JsonRpcError::MethodError { error, .. }) if error.code == ErrorCode::ServerError(1) && error.message == "Test error"
    );

    assert_matches!(
        client.call::<JsonValue>("fail_with_panic").await,
        Err(JsonRpcError::MethodError { error, .. }) if error.code == ErrorCode::InternalError
    );
    assert_matches!(
        server_diagnostics.recv().await.unwrap(),
        Diagnostic::HandlerPanicked { method, message } => {
            assert_eq!(method, "fail_with_panic");
            assert_eq!(message, "handler blew up on purpose");
        }
    );

    assert_matches!(
        client.call_with_params::<_, JsonValue>("set_value", json!({"value": 1})).await,
        Err(JsonRpcError::MethodError { error, .. }) if error.code == ErrorCode::InvalidParams
    );

    // A result of the wrong shape is the caller's problem, not the connection's
    assert_matches!(
        client.call::<String>("get_counter").await,
        Err(JsonRpcError::DeserResponse { response, .. }) if response == json!(0)
    );

    let counter: i32 = client.call("increment_counter").await.unwrap();
    assert_eq!(counter, 1);
}

#[tokio::test]
async fn cancelling_a_call_cancels_the_remote_handler() {
    test_helpers::init_test_logging();

    let (client, _server, _notifications) = connected_pair().await;
    let mut client_diagnostics = client.diagnostics();

    let request = client.start_call::<JsonValue>("wait_for_cancel").await.unwrap();
    let request_id = request.request_id();

    // Give the request a moment to reach the handler before cancelling it
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_matches!(request.cancel().await, Err(JsonRpcError::Cancelled));

    // The handler notices and answers, but nobody is waiting for that answer anymore
    assert_eq!(
        tokio::time::timeout(LINE_TIMEOUT, client_diagnostics.recv())
            .await
            .unwrap()
            .unwrap(),
        Diagnostic::UnknownResponse { id: request_id }
    );
}

#[tokio::test]
async fn inbound_call_can_be_cancelled_locally() {
    test_helpers::init_test_logging();

    let (client, server, _notifications) = connected_pair().await;

    let request = client.start_call::<JsonValue>("wait_for_cancel").await.unwrap();
    let request_id = request.request_id();
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.cancel_inbound_request(request_id);
    assert_eq!(request.await.unwrap(), json!("cancelled"));
}

#[tokio::test]
async fn shutdown_is_idempotent_and_graceful() {
    test_helpers::init_test_logging();

    let (client, server, _notifications) = connected_pair().await;

    // Still running when the server shuts down, but given time to finish
    let request = client
        .start_call_with_params::<_, JsonValue>("sleep", json!({"ms": 100}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let server_clone = server.clone();
    let (first, second) = tokio::join!(server.shutdown(), server_clone.shutdown());
    assert_eq!(first, Ok(()));
    assert_eq!(second, Ok(()));
    assert_eq!(server.shutdown().await, Ok(()));
    assert_eq!(server.state(), ConnectionState::Closed);

    assert_eq!(request.await.unwrap(), json!("done"));

    // The client sees the server hang up
    assert_eq!(client.wait_closed().await, Ok(()));
    assert_matches!(
        client.call::<JsonValue>("echo").await,
        Err(JsonRpcError::ConnectionClosed)
    );
}

#[tokio::test]
async fn shutdown_aborts_handlers_that_overstay() {
    test_helpers::init_test_logging();

    let (client_transport, server_transport) = test_helpers::setup_test_channel();
    let server = ConnectionBuilder::new()
        .with_config(ConnectionConfig {
            graceful_shutdown_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        })
        .with_router(test_service::test_service_router())
        .bind(server_transport)
        .unwrap();
    let client = ConnectionBuilder::new().without_state().bind(client_transport).unwrap();
    client
        .handshake("initialize", json!({"protocolVersion": 1}), |_| Capabilities::none())
        .await
        .unwrap();

    let request = client
        .start_call_with_params::<_, JsonValue>("sleep", json!({"ms": 10_000}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(server.shutdown().await, Ok(()));

    assert_matches!(
        request.await,
        Err(JsonRpcError::MethodError { error, .. }) if error.code == ErrorCode::InternalError
    );
}

#[tokio::test]
async fn shared_state_is_visible_to_handlers() {
    test_helpers::init_test_logging();

    let (client, _server, _notifications) = connected_pair().await;

    let counts = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let tasks = (0..10).map(|_| {
        let client = client.clone();
        let counts = counts.clone();
        async move {
            let count: i32 = client.call("increment_counter").await.unwrap();
            counts.lock().await.push(count);
        }
    });
    futures::future::join_all(tasks).await;

    let mut counts = counts.lock().await.clone();
    counts.sort();
    assert_eq!(counts, (1..=10).collect::<Vec<i32>>());
    assert_eq!(client.call::<i32>("get_counter").await.unwrap(), 10);
}
