#![warn(missing_docs)]

//! # preview-sandbox
//!
//! Sandboxed preview execution for LLM-generated browser-extension bundles.
//!
//! A bundle arrives as an untrusted [`FileSet`]. It is admitted by the
//! [`admission`] validator, turned into generation-scoped ephemeral resources
//! by the [`vfs`] materializer, wrapped into entry documents by the
//! [`assembler`] and run inside isolated [`context`]s that reach the outside
//! world only through the [`shim`] and the [`bridge`]. The [`runner`] owns
//! the generation lifecycle.
//!
//! ## Isolation model
//!
//! - **Untrusted input**: every file set is validated in full before any field is used
//! - **Per-generation arenas**: resources, storage and pending messages belong to one generation
//! - **Explicit handle table**: only the materializer issues or revokes ephemeral references
//! - **Message passing only**: contexts share no mutable state with the UI
//! - **Unspoofable mode detection**: host mode requires a token minted before bundle code runs

use std::fmt;

use serde::Serialize;

pub mod admission;
pub mod assembler;
pub mod assets;
pub mod audit;
pub mod bridge;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod runner;
pub mod shim;
pub mod storage;
pub mod vfs;

pub use admission::{validate, AdmissionLimits, AdmissionMode, FileEntry, FileSet, ValidatedFileSet};
pub use bridge::{Bridge, ContextId, Envelope, ListenerReply, MessageListener};
pub use error::{AssemblyError, LifecycleError, MaterializeError, PreviewError, ValidationError};
pub use preview_error::CapabilityError;
pub use runner::{PreviewHandle, PreviewInspection, PreviewRunner, RunnerConfig, StatePersistence};
pub use vfs::{EphemeralRef, Materializer, ResourceHandle, ResourceTable};

/// Build number of a preview. Strictly increasing within a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Generation(u64);

impl Generation {
    /// Wrap a raw generation number.
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// The raw generation number.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The generation after this one.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capabilities of a genuine extension host.
///
/// When a preview runs inside a real host, the capability shim forwards every
/// call here unchanged instead of serving it from in-memory state. Sandboxed
/// code never sees the implementation; it only reaches it through the shim.
#[async_trait::async_trait]
pub trait HostCapabilities: Send + Sync {
    /// Read a stored value. `None` when the key is absent.
    async fn storage_get(&self, key: &str) -> Result<Option<serde_json::Value>, CapabilityError>;

    /// Store a value.
    async fn storage_set(&self, key: &str, value: serde_json::Value)
        -> Result<(), CapabilityError>;

    /// Remove a key. Returns whether it existed.
    async fn storage_remove(&self, key: &str) -> Result<bool, CapabilityError>;

    /// List stored keys.
    async fn storage_keys(&self) -> Result<Vec<String>, CapabilityError>;

    /// Remove every key.
    async fn storage_clear(&self) -> Result<(), CapabilityError>;

    /// `runtime.sendMessage` on the host.
    async fn send_message(
        &self,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, CapabilityError>;

    /// `runtime.onMessage.addListener` on the host.
    fn add_message_listener(
        &self,
        listener: std::sync::Arc<dyn bridge::MessageListener>,
    ) -> Result<(), CapabilityError>;

    /// `tabs.query` on the host.
    async fn query_tabs(
        &self,
        query: &shim::TabQuery,
    ) -> Result<Vec<shim::TabInfo>, CapabilityError>;

    /// `tabs.sendMessage` on the host.
    async fn send_tab_message(
        &self,
        tab_id: i64,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, CapabilityError>;

    /// `scripting.executeScript` on the host.
    async fn execute_script(
        &self,
        target: &shim::ScriptTarget,
        injection: &shim::ScriptInjection,
    ) -> Result<Vec<shim::InjectionResult>, CapabilityError>;
}
