//! The ACP methods, in both directions, and what the client needs to know about each of them.
//!
//! Using enums for these avoids excessively stringly-typed code, and makes it hard to miss a
//! method when registering handlers or applying per-method policy.
use std::time::Duration;

use acpox_jsonrpc::{CapabilityKey, Method};

/// How long a call to the agent may take unless configured otherwise
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Methods implemented by the agent, invoked by the client
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
    strum::IntoStaticStr,
)]
pub enum AgentMethod {
    #[strum(serialize = "initialize")]
    Initialize,
    #[strum(serialize = "authenticate")]
    Authenticate,
    #[strum(serialize = "session/new")]
    NewSession,
    #[strum(serialize = "session/load")]
    LoadSession,
    #[strum(serialize = "session/prompt")]
    Prompt,
    #[strum(serialize = "session/set_mode")]
    SetMode,
    #[strum(serialize = "session/cancel")]
    Cancel,
}

impl AgentMethod {
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// The agent capability without which this method must not be called
    pub fn required_capability(self) -> Option<CapabilityKey> {
        match self {
            AgentMethod::LoadSession => Some(CapabilityKey::LoadSession),
            _ => None,
        }
    }

    pub fn is_notification(self) -> bool {
        matches!(self, AgentMethod::Cancel)
    }

    /// Timeout applied to calls of this method unless the client was configured with another.
    ///
    /// A prompt turn lasts as long as the agent needs, so it has none.
    pub fn default_timeout(self) -> Option<Duration> {
        match self {
            AgentMethod::Prompt | AgentMethod::Cancel => None,
            _ => Some(DEFAULT_CALL_TIMEOUT),
        }
    }
}

impl From<AgentMethod> for Method {
    fn from(value: AgentMethod) -> Self {
        Method::from(value.name())
    }
}

/// Methods implemented by the client, invoked by the agent while it works
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
    strum::IntoStaticStr,
)]
pub enum ClientMethod {
    #[strum(serialize = "session/update")]
    SessionUpdate,
    #[strum(serialize = "session/request_permission")]
    RequestPermission,
    #[strum(serialize = "fs/read_text_file")]
    ReadTextFile,
    #[strum(serialize = "fs/write_text_file")]
    WriteTextFile,
    #[strum(serialize = "terminal/create")]
    CreateTerminal,
    #[strum(serialize = "terminal/output")]
    TerminalOutput,
    #[strum(serialize = "terminal/release")]
    ReleaseTerminal,
    #[strum(serialize = "terminal/wait_for_exit")]
    WaitForTerminalExit,
    #[strum(serialize = "terminal/kill")]
    KillTerminal,
}

impl ClientMethod {
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// The client capability that tells the agent it may call this method.  Methods without one
    /// are part of the baseline every client serves.
    pub fn required_capability(self) -> Option<CapabilityKey> {
        match self {
            ClientMethod::ReadTextFile => Some(CapabilityKey::FsReadTextFile),
            ClientMethod::WriteTextFile => Some(CapabilityKey::FsWriteTextFile),
            ClientMethod::CreateTerminal
            | ClientMethod::TerminalOutput
            | ClientMethod::ReleaseTerminal
            | ClientMethod::WaitForTerminalExit
            | ClientMethod::KillTerminal => Some(CapabilityKey::Terminal),
            ClientMethod::SessionUpdate | ClientMethod::RequestPermission => None,
        }
    }

    pub fn is_notification(self) -> bool {
        matches!(self, ClientMethod::SessionUpdate)
    }
}
