//! A client for the Agent Client Protocol (ACP), for editors and other hosts that drive coding
//! agents running as child processes.
//!
//! The heavy lifting happens in [`acpox_jsonrpc`]; this crate adds the child process transport,
//! the `initialize` handshake, and typed wrappers for the agent's methods.
//!
//! ```no_run
//! # async fn example() -> acpox_client::Result<()> {
//! use acpox_client::{AcpClient, transport::ChildProcessParams};
//! use serde_json::json;
//!
//! let client = AcpClient::builder()
//!     .connect(&ChildProcessParams::new("my-agent").with_args(["--acp"]))
//!     .await?;
//!
//! let session = client.new_session("/home/me/project", vec![]).await?;
//! let response = client
//!     .prompt(&session.session_id, vec![json!({"type": "text", "text": "Hello"})])
//!     .await?;
//! println!("Agent stopped because: {}", response.stop_reason);
//!
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod methods;
#[cfg(test)]
mod testing;
pub mod transport;

pub use acpox_jsonrpc as jsonrpc;
pub use client::{AcpClient, AcpClientBuilder, NewSessionResponse, PromptResponse, SUPPORTED_PROTOCOL_VERSIONS, StopReason};
pub use error::{AcpClientError, Result};
pub use methods::{AgentMethod, ClientMethod, DEFAULT_CALL_TIMEOUT};
