//! A stand-in agent for end-to-end tests, served by this crate's own router.  The behavior of each
//! method is what the YAML cases under `testdata/` expect.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use acpox_jsonrpc::{
    Capabilities, ConnectionHandle, ErrorDetails, Id, JsonRpcError, JsonValue, MethodResponse, Params, Router,
    State,
};
use futures::lock::Mutex;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct AgentState {
    counter: i32,
    store: HashMap<String, JsonValue>,
    last_notification: Option<String>,
    session_logs: HashMap<String, Vec<JsonValue>>,
}

pub type SharedState = Arc<Mutex<AgentState>>;

/// What the stand-in agent claims to support when answering `initialize`
pub fn agent_capabilities() -> JsonValue {
    json!({
        "loadSession": false,
        "promptCapabilities": {
            "image": true,
            "audio": false
        }
    })
}

/// `append` and `get_log` are ordered per `sessionId`; everything else runs concurrently.
pub fn test_service_router() -> Router<SharedState> {
    let mut router = Router::new_with_state(SharedState::default());

    router.register_handler("initialize", initialize);
    router.register_handler("echo", echo);

    router.register_handler("increment_counter", increment_counter);
    router.register_handler("get_counter", get_counter);
    router.register_handler("set_value", set_value);
    router.register_handler("get_value", get_value);
    router.register_handler("record_notification", record_notification);
    router.register_handler("get_last_notification", get_last_notification);
    router.register_handler("append", append);
    router.register_handler("get_log", get_log);

    router.register_handler("fail_with_error", fail_with_error);
    router.register_handler("fail_with_panic", fail_with_panic);
    router.register_handler("sleep", sleep);
    router.register_handler("wait_for_cancel", wait_for_cancel);

    router.register_handler("call_caller_method", call_caller_method);
    router.register_handler("raise_caller_notification", raise_caller_notification);

    router.set_ordering_scope(|method, params| {
        if !matches!(method, "append" | "get_log") {
            return None;
        }
        params?.get("sessionId")?.as_str().map(String::from)
    });

    router
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Initialize {
    protocol_version: u32,
    #[serde(default)]
    client_capabilities: JsonValue,
}

async fn initialize(connection: ConnectionHandle, Params(init): Params<Initialize>) -> Result<JsonValue, JsonRpcError> {
    connection.complete_handshake(Capabilities::from_json(&init.client_capabilities))?;

    Ok(json!({
        "protocolVersion": init.protocol_version,
        "agentCapabilities": agent_capabilities(),
    }))
}

async fn echo(params: JsonValue) -> JsonValue {
    params
}

async fn increment_counter(State(state): State<SharedState>) -> MethodResponse<i32> {
    let mut agent = state.lock().await;
    agent.counter += 1;
    MethodResponse(agent.counter)
}

async fn get_counter(State(state): State<SharedState>) -> MethodResponse<i32> {
    MethodResponse(state.lock().await.counter)
}

#[derive(Deserialize)]
struct Key {
    key: String,
}

#[derive(Deserialize)]
struct KeyValue {
    key: String,
    value: JsonValue,
}

async fn set_value(State(state): State<SharedState>, Params(KeyValue { key, value }): Params<KeyValue>) {
    state.lock().await.store.insert(key, value);
}

async fn get_value(State(state): State<SharedState>, Params(Key { key }): Params<Key>) -> JsonValue {
    state.lock().await.store.get(&key).cloned().unwrap_or_default()
}

#[derive(Deserialize)]
struct Message {
    message: String,
}

async fn record_notification(id: Option<Id>, State(state): State<SharedState>, Params(msg): Params<Message>) {
    assert_eq!(id, None, "only ever sent as a notification");
    state.lock().await.last_notification = Some(msg.message);
}

async fn get_last_notification(State(state): State<SharedState>) -> MethodResponse<Option<String>> {
    MethodResponse(state.lock().await.last_notification.clone())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionEntry {
    session_id: String,
    #[serde(default)]
    value: JsonValue,
    #[serde(default)]
    delay_ms: u64,
}

/// Appends to the session's log after `delayMs`.  Without ordering, a slow early append would
/// land after a quick later one.
async fn append(State(state): State<SharedState>, Params(entry): Params<SessionEntry>) {
    tokio::time::sleep(Duration::from_millis(entry.delay_ms)).await;
    state
        .lock()
        .await
        .session_logs
        .entry(entry.session_id)
        .or_default()
        .push(entry.value);
}

async fn get_log(State(state): State<SharedState>, Params(entry): Params<SessionEntry>) -> JsonValue {
    let agent = state.lock().await;
    JsonValue::Array(agent.session_logs.get(&entry.session_id).cloned().unwrap_or_default())
}

async fn fail_with_error() -> Result<(), ErrorDetails> {
    Err(ErrorDetails::server_error(1, "Test error", None))
}

async fn fail_with_panic() -> Result<(), ErrorDetails> {
    panic!("handler blew up on purpose")
}

#[derive(Deserialize)]
struct Sleep {
    ms: u64,
}

async fn sleep(Params(Sleep { ms }): Params<Sleep>) -> JsonValue {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    json!("done")
}

/// Resolves once the caller cancels, or gives up after half a minute
async fn wait_for_cancel(token: CancellationToken) -> JsonValue {
    tokio::select! {
        _ = token.cancelled() => json!("cancelled"),
        _ = tokio::time::sleep(Duration::from_secs(30)) => json!("not cancelled"),
    }
}

#[derive(Deserialize)]
struct Relay {
    method: String,
    #[serde(default)]
    params: Option<JsonValue>,
}

/// Calls `method` back on the caller and answers with whatever it got, the way an agent reads a
/// file on the client's side in the middle of a prompt.
async fn call_caller_method(connection: ConnectionHandle, Params(relay): Params<Relay>) -> Result<JsonValue, JsonRpcError> {
    connection.start_call_raw(relay.method, relay.params, None).await?.await
}

async fn raise_caller_notification(
    connection: ConnectionHandle,
    Params(relay): Params<Relay>,
) -> Result<(), JsonRpcError> {
    connection.notify_raw(relay.method, relay.params).await
}
