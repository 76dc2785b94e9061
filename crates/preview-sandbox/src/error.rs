//! Error types for the preview sandbox.
//!
//! [`ValidationError`] and [`AssemblyError`] are returned to the UI layer as
//! typed results. [`LifecycleError`] is only ever logged: retiring something
//! that is already gone is a no-op, never a failure.

use thiserror::Error;

use crate::Generation;

/// Reasons a file set is refused admission. Nothing is materialized when
/// any of these is returned.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ValidationError {
    /// A path failed the path-safety rules.
    #[error("unsafe path '{path}': {reason}")]
    UnsafePath {
        /// The offending path, as submitted.
        path: String,
        /// Which rule it broke.
        reason: &'static str,
    },

    /// The file set holds more files than allowed.
    #[error("file set has {actual} files (max {max})")]
    TooManyFiles {
        /// Configured ceiling.
        max: usize,
        /// Number of files submitted.
        actual: usize,
    },

    /// The cumulative UTF-8 size exceeds the ceiling.
    #[error("file set totals {actual} bytes, exceeding the total size limit of {max} bytes")]
    TotalTooLarge {
        /// Configured ceiling in bytes.
        max: usize,
        /// Submitted total in bytes.
        actual: usize,
    },

    /// A single file exceeds the per-file ceiling.
    #[error("file '{path}' is {actual} bytes (max {max})")]
    FileTooLarge {
        /// The offending path.
        path: String,
        /// Configured ceiling in bytes.
        max: usize,
        /// Size of the file in bytes.
        actual: usize,
    },

    /// The same path appears more than once.
    #[error("duplicate path '{path}'")]
    DuplicatePath {
        /// The repeated path.
        path: String,
    },

    /// A text file looks like binary data.
    #[error("file '{path}' does not look like text ({percent}% control characters)")]
    NonTextContent {
        /// The offending path.
        path: String,
        /// Share of control characters in the sampled prefix, in percent.
        percent: u32,
    },

    /// A binary-extension file is not valid base64.
    #[error("binary file '{path}' is not valid base64: {reason}")]
    InvalidBinaryEncoding {
        /// The offending path.
        path: String,
        /// Decoder message.
        reason: String,
    },

    /// An `edit` delta carried no files.
    #[error("file set is empty")]
    Empty,

    /// The inbound JSON does not have the file set shape.
    #[error("file set is malformed: {reason}")]
    Malformed {
        /// Parser message.
        reason: String,
    },

    /// A new bundle has no `manifest.json`.
    #[error("bundle descriptor manifest.json is missing")]
    MissingDescriptor,

    /// The descriptor could not be parsed.
    #[error("bundle descriptor is invalid: {reason}")]
    InvalidDescriptor {
        /// Parser or schema message.
        reason: String,
    },

    /// The descriptor declares a manifest version this core does not run.
    #[error("unsupported manifest_version {found} (supported: {supported})")]
    UnsupportedManifestVersion {
        /// The declared version.
        found: i64,
        /// The version the core runs.
        supported: i64,
    },
}

impl ValidationError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsafePath { .. } => "UNSAFE_PATH",
            Self::TooManyFiles { .. } => "TOO_MANY_FILES",
            Self::TotalTooLarge { .. } => "TOTAL_TOO_LARGE",
            Self::FileTooLarge { .. } => "FILE_TOO_LARGE",
            Self::DuplicatePath { .. } => "DUPLICATE_PATH",
            Self::NonTextContent { .. } => "NON_TEXT_CONTENT",
            Self::InvalidBinaryEncoding { .. } => "INVALID_BINARY_ENCODING",
            Self::Empty => "EMPTY",
            Self::Malformed { .. } => "MALFORMED",
            Self::MissingDescriptor => "MISSING_DESCRIPTOR",
            Self::InvalidDescriptor { .. } => "INVALID_DESCRIPTOR",
            Self::UnsupportedManifestVersion { .. } => "UNSUPPORTED_VERSION",
        }
    }

    /// The path the error is about, if it concerns a single file.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::UnsafePath { path, .. }
            | Self::FileTooLarge { path, .. }
            | Self::DuplicatePath { path }
            | Self::NonTextContent { path, .. }
            | Self::InvalidBinaryEncoding { path, .. } => Some(path),
            _ => None,
        }
    }
}

/// Failures while turning admitted files into ephemeral resources.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MaterializeError {
    /// The generation has already been retired and cannot take new resources.
    #[error("generation {generation} is retired")]
    GenerationRetired {
        /// The retired generation.
        generation: Generation,
    },

    /// Binary content could not be decoded.
    #[error("cannot decode '{path}': {reason}")]
    Decode {
        /// The offending path.
        path: String,
        /// Decoder message.
        reason: String,
    },
}

/// Failures while assembling or starting an isolated context. The previous
/// generation, if any, stays live.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AssemblyError {
    /// The context did not signal readiness in time.
    #[error("generation {generation} was not ready after {timeout_ms}ms")]
    ReadinessTimeout {
        /// The generation being built.
        generation: Generation,
        /// Configured readiness timeout.
        timeout_ms: u64,
    },

    /// A referenced resource could not be redeemed (revoked or never issued).
    #[error("resource '{path}' is no longer available")]
    ResourceUnavailable {
        /// Bundle path of the missing resource.
        path: String,
    },

    /// A document tried to load a reference outside its allowlist.
    #[error("script-origin policy refused '{reference}'")]
    PolicyViolation {
        /// The refused reference.
        reference: String,
    },

    /// A script threw while being evaluated.
    #[error("script '{path}' failed: {message}")]
    ScriptFailed {
        /// Bundle path of the failing script.
        path: String,
        /// Error reported by the engine.
        message: String,
    },

    /// The context task went away before signalling readiness.
    #[error("context for generation {generation} exited before it was ready")]
    ContextCrashed {
        /// The generation being built.
        generation: Generation,
    },

    /// Materializing runtime resources failed.
    #[error(transparent)]
    Materialize(#[from] MaterializeError),
}

impl AssemblyError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ReadinessTimeout { .. } => "READINESS_TIMEOUT",
            Self::ResourceUnavailable { .. } => "RESOURCE_UNAVAILABLE",
            Self::PolicyViolation { .. } => "POLICY_VIOLATION",
            Self::ScriptFailed { .. } => "SCRIPT_FAILED",
            Self::ContextCrashed { .. } => "CONTEXT_CRASHED",
            Self::Materialize(_) => "MATERIALIZE",
        }
    }
}

/// Retire/teardown requests that had nothing to do. Logged, never propagated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum LifecycleError {
    /// The generation was never materialized.
    #[error("generation {0} is unknown")]
    UnknownGeneration(Generation),

    /// The generation was already retired.
    #[error("generation {0} is already retired")]
    AlreadyRetired(Generation),
}

/// Errors returned by the preview runner's public operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PreviewError {
    /// The file set was refused admission.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Admitted files could not be materialized.
    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    /// The new generation could not be assembled or did not become ready.
    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    /// The preview handle was disposed.
    #[error("preview has been disposed")]
    Disposed,
}

impl PreviewError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.code(),
            Self::Materialize(_) => "MATERIALIZE",
            Self::Assembly(e) => e.code(),
            Self::Disposed => "DISPOSED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_reports_path() {
        let err = ValidationError::UnsafePath {
            path: "../evil.js".into(),
            reason: "path contains a '..' segment",
        };
        assert_eq!(err.path(), Some("../evil.js"));
        assert!(err.to_string().contains("../evil.js"));
        assert_eq!(err.code(), "UNSAFE_PATH");
    }

    #[test]
    fn total_too_large_names_the_limit() {
        let err = ValidationError::TotalTooLarge {
            max: 409_600,
            actual: 512_000,
        };
        let msg = err.to_string();
        assert!(msg.contains("total size limit"));
        assert!(msg.contains("409600"));
        assert!(err.path().is_none());
    }

    #[test]
    fn preview_error_forwards_codes() {
        let err: PreviewError = ValidationError::MissingDescriptor.into();
        assert_eq!(err.code(), "MISSING_DESCRIPTOR");

        let err: PreviewError = AssemblyError::ReadinessTimeout {
            generation: Generation::new(3),
            timeout_ms: 10,
        }
        .into();
        assert_eq!(err.code(), "READINESS_TIMEOUT");
        assert!(err.to_string().contains("generation 3"));
    }

    #[test]
    fn lifecycle_error_display() {
        let err = LifecycleError::AlreadyRetired(Generation::new(4));
        assert_eq!(err.to_string(), "generation 4 is already retired");
    }
}
