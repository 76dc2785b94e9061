#![warn(missing_docs)]

//! Typed error types for the preview capability surface.
//!
//! Provides [`CapabilityError`] — the canonical error type returned by the
//! capability shim, the message bridge and the host pass-through trait.
//! None of these errors is fatal to a running preview: they are reported to
//! the caller as an ordinary failed result.

use thiserror::Error;

/// Canonical error type for capability calls made by sandboxed code or the UI.
///
/// All variants are `#[non_exhaustive]` to allow future additions without
/// breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CapabilityError {
    /// No listener answered the message (none registered, none responded in
    /// time, or the target context does not exist).
    #[error("could not establish connection: receiving end '{target}' does not exist")]
    NoReceiver {
        /// The context the message was addressed to.
        target: String,
    },

    /// A response was already accepted for this correlation id.
    #[error("message {id} already has a response; later response discarded")]
    AlreadyResolved {
        /// The correlation id that was resolved twice.
        id: u64,
    },

    /// The correlation id was never issued by this bridge.
    #[error("unknown correlation id {id}")]
    UnknownCorrelation {
        /// The unknown correlation id.
        id: u64,
    },

    /// The execution context was torn down while the call was pending.
    #[error("context for generation {generation} was discarded")]
    ContextDiscarded {
        /// Generation whose context went away.
        generation: u64,
    },

    /// A host pass-through call did not complete in time.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// The capability operation that timed out.
        operation: String,
        /// The timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The addressed tab does not exist in this preview.
    #[error("no tab with id {tab_id}")]
    NoSuchTab {
        /// Requested tab id.
        tab_id: i64,
    },

    /// The in-memory storage rejected the operation (bad key or quota).
    #[error("storage error: {message}")]
    Storage {
        /// Why the storage rejected the call.
        message: String,
    },

    /// The genuine extension host reported a failure.
    #[error("host error: {message}")]
    Host {
        /// The message reported by the host.
        message: String,
    },

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CapabilityError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoReceiver { .. } => "NO_RECEIVER",
            Self::AlreadyResolved { .. } => "ALREADY_RESOLVED",
            Self::UnknownCorrelation { .. } => "UNKNOWN_CORRELATION",
            Self::ContextDiscarded { .. } => "CONTEXT_DISCARDED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::NoSuchTab { .. } => "NO_SUCH_TAB",
            Self::Storage { .. } => "STORAGE",
            Self::Host { .. } => "HOST_ERROR",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns whether the call that produced this error may succeed if retried.
    pub fn retryable(&self) -> bool {
        match self {
            Self::NoReceiver { .. } => true,
            Self::Timeout { .. } => true,
            Self::Host { .. } => true,
            Self::ContextDiscarded { .. } => true,
            Self::AlreadyResolved { .. } => false,
            Self::UnknownCorrelation { .. } => false,
            Self::NoSuchTab { .. } => false,
            Self::Storage { .. } => false,
            Self::Internal(_) => false,
        }
    }

    /// Convert to a structured JSON error for the surrounding UI.
    ///
    /// Returns a JSON object with `error`, `code`, `message`, `retryable`,
    /// and `suggested_fix` when a generic remedy is known.
    pub fn to_structured_error(&self) -> serde_json::Value {
        let suggested_fix = match self {
            Self::NoReceiver { .. } => {
                Some("Register a runtime.onMessage listener before sending")
            }
            Self::ContextDiscarded { .. } => Some("Resend against the current preview"),
            Self::Timeout { .. } => Some("Retry with a smaller payload"),
            Self::Storage { .. } => Some("Use shorter keys or smaller values"),
            _ => None,
        };

        let mut obj = serde_json::json!({
            "error": true,
            "code": self.code(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        });

        if let Some(fix) = suggested_fix {
            obj["suggested_fix"] = serde_json::Value::String(fix.to_string());
        }

        obj
    }
}

// Compile-time assertion: CapabilityError must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<CapabilityError>();
};
