//! Capabilities negotiated with the remote peer during the handshake.
//!
//! Capability objects in ACP are nested structs of flags, like
//! `{"loadSession": true, "promptCapabilities": {"image": true}}`.  Rather than poke at them
//! dynamically, every capability that gates a method is enumerated in [`CapabilityKey`], which
//! knows the dotted path at which it lives in the capabilities object.
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use serde_json::Value as JsonValue;
use strum::IntoEnumIterator;

use crate::{JsonRpcError, Result};

/// A protocol-defined optional feature.
///
/// The string form of each key is its dotted path within a capabilities object.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
pub enum CapabilityKey {
    #[strum(serialize = "loadSession")]
    LoadSession,
    #[strum(serialize = "promptCapabilities.image")]
    PromptImage,
    #[strum(serialize = "promptCapabilities.audio")]
    PromptAudio,
    #[strum(serialize = "promptCapabilities.embeddedContext")]
    PromptEmbeddedContext,
    #[strum(serialize = "mcpCapabilities.http")]
    McpHttp,
    #[strum(serialize = "mcpCapabilities.sse")]
    McpSse,
    #[strum(serialize = "fs.readTextFile")]
    FsReadTextFile,
    #[strum(serialize = "fs.writeTextFile")]
    FsWriteTextFile,
    #[strum(serialize = "terminal")]
    Terminal,
}

impl CapabilityKey {
    /// Dotted path of this capability within a capabilities object
    pub fn path(&self) -> &'static str {
        self.into()
    }

    fn lookup<'a>(&self, capabilities: &'a JsonValue) -> Option<&'a JsonValue> {
        self.path()
            .split('.')
            .try_fold(capabilities, |value, segment| value.get(segment))
    }
}

/// The capabilities advertised by a remote peer, keyed by [`CapabilityKey`].
///
/// Keys that the peer did not mention are simply absent, and are treated as disabled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Capabilities {
    values: BTreeMap<CapabilityKey, JsonValue>,
}

impl Capabilities {
    /// No capabilities at all; every optional method is disabled
    pub fn none() -> Self {
        Self::default()
    }

    /// Extract every known capability from a capabilities object as received from the peer.
    ///
    /// Unknown fields are ignored.  Anything that isn't an object yields no capabilities.
    pub fn from_json(capabilities: &JsonValue) -> Self {
        let values = CapabilityKey::iter()
            .filter_map(|key| key.lookup(capabilities).map(|value| (key, value.clone())))
            .collect();

        Self { values }
    }

    /// Builder-style helper to set the value of a single capability
    pub fn with(mut self, key: CapabilityKey, value: impl Into<JsonValue>) -> Self {
        self.values.insert(key, value.into());
        self
    }

    pub fn get(&self, key: CapabilityKey) -> Option<&JsonValue> {
        self.values.get(&key)
    }

    /// A capability is enabled if the peer set it to `true` or to an object (some capabilities are
    /// structs describing the feature in more detail).  `false`, `null`, and absent are all
    /// disabled.
    pub fn is_enabled(&self, key: CapabilityKey) -> bool {
        matches!(
            self.values.get(&key),
            Some(JsonValue::Bool(true)) | Some(JsonValue::Object(_))
        )
    }

    /// All capabilities which are enabled
    pub fn enabled(&self) -> impl Iterator<Item = CapabilityKey> + '_ {
        self.values
            .keys()
            .copied()
            .filter(|key| self.is_enabled(*key))
    }
}

/// Set-once holder of the capabilities negotiated on a connection.
///
/// Cheap to clone; all clones share the same cell.  Before [`Self::set`] is called every
/// capability reads as disabled.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    inner: Arc<OnceLock<Capabilities>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the negotiated capabilities.  This can succeed only once per registry.
    pub fn set(&self, capabilities: Capabilities) -> Result<()> {
        self.inner
            .set(capabilities)
            .map_err(|_| JsonRpcError::CapabilitiesAlreadySet)
    }

    pub fn get(&self) -> Option<&Capabilities> {
        self.inner.get()
    }

    pub fn is_set(&self) -> bool {
        self.inner.get().is_some()
    }

    pub fn is_enabled(&self, key: CapabilityKey) -> bool {
        self.inner
            .get()
            .is_some_and(|capabilities| capabilities.is_enabled(key))
    }
}
