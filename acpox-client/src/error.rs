use acpox_jsonrpc::{self as jsonrpc, JsonValue};
use thiserror::Error;

use crate::client::SUPPORTED_PROTOCOL_VERSIONS;
use crate::methods::AgentMethod;

pub type Result<T, E = AcpClientError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum AcpClientError {
    #[error("Error spawning ACP agent '{program}' with args [{args}] as child process",
        args = .args.join(" ")
    )]
    SpawnAgent {
        source: std::io::Error,
        program: String,
        args: Vec<String>,
    },

    #[error("Error on the connection to the ACP agent")]
    Connection { source: jsonrpc::JsonRpcError },

    #[error("Error invoking '{method}' on ACP agent")]
    Call {
        method: AgentMethod,
        source: jsonrpc::JsonRpcError,
    },

    #[error("The ACP agent speaks protocol version {version} but this client only supports the following protocol versions: {}",
        SUPPORTED_PROTOCOL_VERSIONS
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    )]
    UnsupportedProtocolVersion { version: JsonValue },
}

impl AcpClientError {
    /// Report a JSON RPC error associated with a specific method.
    pub(crate) fn call(method: AgentMethod, source: jsonrpc::JsonRpcError) -> Self {
        AcpClientError::Call { method, source }
    }

    /// The connection's event loop reports how it ended as a string
    pub(crate) fn connection_ended(message: String) -> Self {
        AcpClientError::Connection {
            source: jsonrpc::JsonRpcError::Transport { source: message.into() },
        }
    }

    /// The JSON-RPC error underneath this one, if there is one
    pub fn json_rpc_error(&self) -> Option<&jsonrpc::JsonRpcError> {
        match self {
            AcpClientError::Connection { source } | AcpClientError::Call { source, .. } => Some(source),
            _ => None,
        }
    }
}
