//! The ACP client: an editor's end of a conversation with an agent.
//!
//! [`AcpClient::connect`] launches the agent, serves the methods the agent may call back into
//! (with handlers supplied by the host application), and performs the `initialize` handshake.
//! After that the agent's methods are available as thin wrappers over the JSON-RPC connection,
//! with capability gating and per-method timeouts applied from the tables in [`crate::methods`].
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use acpox_jsonrpc::{
    self as jsonrpc, Capabilities, CapabilityRegistry, ConnectionBuilder, ConnectionConfig, ConnectionHandle,
    JsonValue, Router, Transport,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use strum::IntoEnumIterator;
use tracing::instrument;

use crate::methods::{AgentMethod, ClientMethod};
use crate::transport::{ChildProcess, ChildProcessParams};
use crate::{AcpClientError, Result};

/// Protocol versions this client can speak.  The first is the one it asks for.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[u64] = &[1];

/// A connection to an ACP agent, past the handshake.
///
/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct AcpClient {
    connection: ConnectionHandle,
    initialize_result: Arc<JsonValue>,
    timeouts: Arc<HashMap<AgentMethod, Option<Duration>>>,
}

impl AcpClient {
    /// Start building a client whose handlers need no state
    pub fn builder() -> AcpClientBuilder<()> {
        AcpClientBuilder::new(Router::new_stateless())
    }

    /// Start building a client whose handlers can extract `state` with [`jsonrpc::State`]
    pub fn builder_with_state<S: Clone + Send + Sync + 'static>(state: S) -> AcpClientBuilder<S> {
        AcpClientBuilder::new(Router::new_with_state(state))
    }

    /// The underlying JSON-RPC connection
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// What the agent advertised it can do in response to `initialize`
    pub fn agent_capabilities(&self) -> &CapabilityRegistry {
        self.connection.capabilities()
    }

    /// Everything the agent said in response to `initialize`: its capabilities, info, and auth
    /// methods
    pub fn initialize_result(&self) -> &JsonValue {
        &self.initialize_result
    }

    pub fn protocol_version(&self) -> Option<u64> {
        self.initialize_result["protocolVersion"].as_u64()
    }

    pub async fn authenticate(&self, method_id: &str) -> Result<JsonValue> {
        self.call(AgentMethod::Authenticate, json!({"methodId": method_id}))
            .await
    }

    /// Create a new session rooted at `cwd`, which must be an absolute path
    pub async fn new_session(&self, cwd: impl AsRef<Path>, mcp_servers: Vec<JsonValue>) -> Result<NewSessionResponse> {
        let params = json!({"cwd": cwd.as_ref(), "mcpServers": mcp_servers});
        self.call_typed(AgentMethod::NewSession, params).await
    }

    /// Resume an earlier session.  Only agents that advertise `loadSession` support this; with
    /// any other agent it fails without sending anything.
    ///
    /// The agent replays the session's history as `session/update` notifications before this
    /// returns.
    pub async fn load_session(
        &self,
        session_id: &str,
        cwd: impl AsRef<Path>,
        mcp_servers: Vec<JsonValue>,
    ) -> Result<JsonValue> {
        let params = json!({"sessionId": session_id, "cwd": cwd.as_ref(), "mcpServers": mcp_servers});
        self.call(AgentMethod::LoadSession, params).await
    }

    /// Send a prompt, made of content blocks, and wait for the agent to finish its turn
    pub async fn prompt(&self, session_id: &str, prompt: Vec<JsonValue>) -> Result<PromptResponse> {
        self.call_typed(
            AgentMethod::Prompt,
            json!({"sessionId": session_id, "prompt": prompt}),
        )
        .await
    }

    pub async fn set_mode(&self, session_id: &str, mode_id: &str) -> Result<JsonValue> {
        self.call(
            AgentMethod::SetMode,
            json!({"sessionId": session_id, "modeId": mode_id}),
        )
        .await
    }

    /// Ask the agent to stop the prompt turn in progress in a session.  The prompt call itself
    /// still completes, with [`StopReason::Cancelled`].
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        self.call(AgentMethod::Cancel, json!({"sessionId": session_id}))
            .await
            .map(|_| ())
    }

    /// Invoke any agent method with raw JSON parameters.
    ///
    /// The method's capability gate and timeout apply.  Notifications resolve to `null` once
    /// written.
    #[instrument(skip_all, fields(method = %method))]
    pub async fn call(&self, method: AgentMethod, params: JsonValue) -> Result<JsonValue> {
        let name = jsonrpc::Method::from(method);

        if let Some(capability) = method.required_capability() {
            self.connection
                .ensure_capability(capability, &name)
                .map_err(|e| AcpClientError::call(method, e))?;
        }

        if method.is_notification() {
            self.connection
                .notify_raw(name, Some(params))
                .await
                .map_err(|e| AcpClientError::call(method, e))?;
            return Ok(JsonValue::Null);
        }

        let timeout = self.timeouts.get(&method).copied().unwrap_or_else(|| method.default_timeout());

        let pending = self
            .connection
            .start_call_raw(name, Some(params), timeout)
            .await
            .map_err(|e| AcpClientError::call(method, e))?;

        pending.await.map_err(|e| AcpClientError::call(method, e))
    }

    async fn call_typed<T: DeserializeOwned>(&self, method: AgentMethod, params: JsonValue) -> Result<T> {
        let result = self.call(method, params).await?;

        serde_json::from_value(result.clone()).map_err(|e| {
            AcpClientError::call(
                method,
                jsonrpc::JsonRpcError::DeserResponse {
                    source: e,
                    type_name: std::any::type_name::<T>(),
                    response: result,
                },
            )
        })
    }

    /// Close the connection and terminate the agent.
    ///
    /// Calls still waiting for the agent fail with [`jsonrpc::JsonRpcError::ConnectionClosed`].
    /// Calling this again, from any clone, waits for the same outcome.
    pub async fn shutdown(&self) -> Result<()> {
        self.connection
            .shutdown()
            .await
            .map_err(AcpClientError::connection_ended)
    }

    /// Wait for the agent to go away, without causing it to
    pub async fn wait_closed(&self) -> Result<()> {
        self.connection
            .wait_closed()
            .await
            .map_err(AcpClientError::connection_ended)
    }
}

impl std::fmt::Debug for AcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcpClient")
            .field("state", &self.connection.state())
            .field("protocol_version", &self.protocol_version())
            .finish_non_exhaustive()
    }
}

/// Builder for an [`AcpClient`], where the host application registers its handlers for the
/// methods the agent calls back into, and describes itself.
pub struct AcpClientBuilder<S: Clone + Send + Sync + 'static> {
    router: Router<S>,
    config: ConnectionConfig,
    protocol_version: u64,
    client_info: JsonValue,
    client_capabilities: JsonValue,
    timeouts: HashMap<AgentMethod, Option<Duration>>,
}

impl<S: Clone + Send + Sync + 'static> AcpClientBuilder<S> {
    fn new(mut router: Router<S>) -> Self {
        // Updates for a session are applied in the order the agent sent them; different
        // sessions don't wait on each other
        router.set_ordering_scope(|method, params| {
            if method == ClientMethod::SessionUpdate.name() {
                params
                    .and_then(|params| params.get("sessionId"))
                    .and_then(JsonValue::as_str)
                    .map(str::to_string)
            } else {
                None
            }
        });

        Self {
            router,
            config: ConnectionConfig::default(),
            protocol_version: SUPPORTED_PROTOCOL_VERSIONS[0],
            client_info: json!({"name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION")}),
            client_capabilities: json!({}),
            timeouts: HashMap::new(),
        }
    }

    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_protocol_version(mut self, protocol_version: u64) -> Self {
        self.protocol_version = protocol_version;
        self
    }

    pub fn with_client_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_info = json!({"name": name.into(), "version": version.into()});
        self
    }

    /// The capabilities object sent to the agent in `initialize`, for example
    /// `{"fs": {"readTextFile": true}}`.  Register handlers for whatever methods it promises.
    pub fn with_client_capabilities(mut self, capabilities: JsonValue) -> Self {
        self.client_capabilities = capabilities;
        self
    }

    /// Override the timeout for one agent method; `None` waits indefinitely
    pub fn with_timeout(mut self, method: AgentMethod, timeout: Option<Duration>) -> Self {
        self.timeouts.insert(method, timeout);
        self
    }

    /// Serve a method the agent calls.  Methods without a handler are answered with `Method not
    /// found`, or ignored in the case of notifications.
    pub fn with_handler<H, HackT>(mut self, method: ClientMethod, handler: H) -> Self
    where
        H: jsonrpc::Handler<HackT, S> + 'static,
        HackT: Send + Sync + 'static,
    {
        self.router.register_handler(method.name(), handler);
        self
    }

    /// Launch the agent as a child process and connect to it
    pub async fn connect(self, params: &ChildProcessParams) -> Result<AcpClient> {
        let process = ChildProcess::spawn(params).await?;
        self.connect_transport(process).await
    }

    /// Connect to an agent over some other transport, and perform the handshake
    #[instrument(skip_all, fields(remote_peer = %transport.remote_peer()))]
    pub async fn connect_transport(self, transport: impl Transport) -> Result<AcpClient> {
        let Self {
            router,
            config,
            protocol_version,
            client_info,
            client_capabilities,
            timeouts,
        } = self;

        let advertised = Capabilities::from_json(&client_capabilities);
        for method in ClientMethod::iter() {
            if let Some(capability) = method.required_capability() {
                if advertised.is_enabled(capability) && !router.has_handler(method.name()) {
                    tracing::warn!(%method, %capability,
                        "Client advertises a capability but has no handler for one of its methods");
                }
            }
        }

        let connection = ConnectionBuilder::new()
            .with_config(config)
            .with_router(router)
            .bind(transport)
            .map_err(|source| AcpClientError::Connection { source })?;

        let params = json!({
            "protocolVersion": protocol_version,
            "clientInfo": client_info,
            "clientCapabilities": client_capabilities,
        });

        let initialize_result = match connection
            .handshake(AgentMethod::Initialize, params, |result| {
                Capabilities::from_json(&result["agentCapabilities"])
            })
            .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!(err = %e, "Handshake failed; closing connection");
                let _ = connection.shutdown().await;
                return Err(AcpClientError::call(AgentMethod::Initialize, e));
            }
        };

        let version = &initialize_result["protocolVersion"];
        if !version.as_u64().is_some_and(|v| SUPPORTED_PROTOCOL_VERSIONS.contains(&v)) {
            tracing::warn!(%version, "Agent chose a protocol version this client doesn't support; closing connection");
            let _ = connection.shutdown().await;
            return Err(AcpClientError::UnsupportedProtocolVersion {
                version: version.clone(),
            });
        }

        tracing::debug!(
            agent_capabilities = ?connection.capabilities().get().map(|c| c.enabled().collect::<Vec<_>>()),
            "Connected to agent"
        );

        Ok(AcpClient {
            connection,
            initialize_result: Arc::new(initialize_result),
            timeouts: Arc::new(timeouts),
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResponse {
    pub session_id: String,

    /// Whatever else the agent said about the session, such as its modes
    #[serde(flatten)]
    pub extra: serde_json::Map<String, JsonValue>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PromptResponse {
    pub stop_reason: StopReason,
}

/// Why the agent ended its turn
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    MaxTurnRequests,
    Refusal,
    Cancelled,
    /// A reason from a newer version of the protocol
    #[serde(other)]
    Other,
}
