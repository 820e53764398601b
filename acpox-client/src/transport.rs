//! Client-specific transports for speaking ACP to agents.
//!
//! All of these provide an implementation of [`acpox_jsonrpc::Transport`], to connect our
//! lower-level JSON-RPC implementation.

mod child_process;

pub use child_process::*;
