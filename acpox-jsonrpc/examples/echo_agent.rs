//! A toy ACP agent that speaks JSON-RPC over its own stdin and stdout, echoing every prompt back
//! to the client as a `session/update` before finishing the turn.
//!
//! Logs go to stderr, which is where an ACP client expects to find them.  Try it with:
//!
//! ```text
//! echo '{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":1}}' \
//!     | cargo run -p acpox-jsonrpc --example echo_agent
//! ```
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use acpox_jsonrpc::{
    Capabilities, ConnectionBuilder, ConnectionHandle, ErrorDetails, JsonRpcError, JsonValue, NdjsonCodec, Params,
    State,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;

#[derive(Default)]
struct Agent {
    next_session: AtomicU64,
    sessions: Mutex<HashMap<String, Vec<JsonValue>>>,
}

type AgentArc = Arc<Agent>;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams {
    #[serde(default = "default_protocol_version")]
    protocol_version: u32,
    #[serde(default)]
    client_capabilities: JsonValue,
}

fn default_protocol_version() -> u32 {
    1
}

async fn initialize(
    connection: ConnectionHandle,
    Params(InitializeParams {
        protocol_version,
        client_capabilities,
    }): Params<InitializeParams>,
) -> Result<JsonValue, JsonRpcError> {
    tracing::info!(protocol_version, %client_capabilities, "Initializing");
    connection.complete_handshake(Capabilities::from_json(&client_capabilities))?;

    Ok(json!({
        "protocolVersion": protocol_version,
        "agentInfo": {"name": "echo-agent", "title": "Echo Agent", "version": env!("CARGO_PKG_VERSION")},
        "agentCapabilities": {"loadSession": false, "promptCapabilities": {"image": false}},
    }))
}

async fn new_session(State(agent): State<AgentArc>, params: JsonValue) -> JsonValue {
    let session_id = format!("session_{}", agent.next_session.fetch_add(1, Ordering::Relaxed));
    tracing::info!(%session_id, cwd = %params["cwd"], "Created session");

    agent.sessions.lock().await.insert(session_id.clone(), Vec::new());
    json!({"sessionId": session_id})
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptParams {
    session_id: String,
    prompt: Vec<JsonValue>,
}

async fn prompt(
    State(agent): State<AgentArc>,
    connection: ConnectionHandle,
    Params(PromptParams { session_id, prompt }): Params<PromptParams>,
) -> Result<JsonValue, ErrorDetails> {
    {
        let mut sessions = agent.sessions.lock().await;
        let history = sessions.get_mut(&session_id).ok_or_else(|| {
            ErrorDetails::invalid_params(format!("Unknown session: {session_id}"), None)
        })?;
        history.extend(prompt.iter().cloned());
    }

    let text = prompt
        .first()
        .and_then(|block| block["text"].as_str())
        .unwrap_or_default();
    connection
        .notify_with_params(
            "session/update",
            json!({
                "sessionId": session_id,
                "update": {
                    "sessionUpdate": "agent_message_chunk",
                    "content": {"type": "text", "text": format!("Echo: You said '{text}'")},
                },
            }),
        )
        .await?;

    Ok(json!({"stopReason": "end_turn"}))
}

async fn cancel(params: JsonValue) {
    tracing::info!(session_id = %params["sessionId"], "Nothing to cancel; prompts finish immediately");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let stdio = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());

    let connection = ConnectionBuilder::new()
        .with_state(AgentArc::default())
        .with_handler("initialize", initialize)
        .with_handler("session/new", new_session)
        .with_handler("session/prompt", prompt)
        .with_handler("session/cancel", cancel)
        .bind(Framed::new(stdio, NdjsonCodec::new()))?;

    tracing::info!("Echo agent started");

    connection
        .wait_closed()
        .await
        .map_err(|e| anyhow::anyhow!("Connection failed: {e}"))?;

    tracing::info!("Client hung up; exiting");
    Ok(())
}
