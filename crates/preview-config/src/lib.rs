#![warn(missing_docs)]

//! # preview-config
//!
//! Configuration loading for the extension preview core.
//!
//! Supports TOML configuration files with environment variable expansion.
//! Every field is optional; absent values fall back to the defaults of the
//! component that consumes them.
//!
//! ## Example
//!
//! ```toml
//! [admission]
//! max_files = 60
//! max_total_kb = 400
//! max_file_kb = 256
//!
//! [bridge]
//! response_timeout_ms = 3000
//!
//! [runner]
//! ready_timeout_ms = 5000
//! state_persistence = "reset"
//! capability_log_capacity = 256
//!
//! [storage]
//! max_keys = 512
//!
//! [page]
//! url = "https://${PREVIEW_PAGE_HOST}/"
//! title = "Example Domain"
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level preview configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreviewConfig {
    /// Admission ceilings for incoming file sets.
    #[serde(default)]
    pub admission: AdmissionOverrides,

    /// Message bridge settings.
    #[serde(default)]
    pub bridge: BridgeOverrides,

    /// Preview runner settings.
    #[serde(default)]
    pub runner: RunnerOverrides,

    /// In-memory extension storage quotas.
    #[serde(default)]
    pub storage: StorageOverrides,

    /// Simulated page the preview pretends to be attached to.
    #[serde(default)]
    pub page: PageOverrides,
}

/// Admission limit overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdmissionOverrides {
    /// Maximum number of files in one file set.
    #[serde(default)]
    pub max_files: Option<usize>,

    /// Maximum cumulative UTF-8 size of all files, in KiB.
    #[serde(default)]
    pub max_total_kb: Option<usize>,

    /// Maximum UTF-8 size of a single file, in KiB.
    #[serde(default)]
    pub max_file_kb: Option<usize>,
}

/// Message bridge overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeOverrides {
    /// How long a sender waits for a listener response.
    #[serde(default)]
    pub response_timeout_ms: Option<u64>,
}

/// Preview runner overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunnerOverrides {
    /// How long a freshly built context may take to signal readiness.
    #[serde(default)]
    pub ready_timeout_ms: Option<u64>,

    /// Storage persistence across rebuilds: "reset" (default) or "carry_forward".
    #[serde(default)]
    pub state_persistence: Option<String>,

    /// Number of capability events retained for inspection.
    #[serde(default)]
    pub capability_log_capacity: Option<usize>,
}

/// Storage quota overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageOverrides {
    /// Maximum number of distinct keys.
    #[serde(default)]
    pub max_keys: Option<usize>,

    /// Maximum serialized size of one value, in KiB.
    #[serde(default)]
    pub max_value_kb: Option<usize>,

    /// Maximum serialized size of all values, in KiB.
    #[serde(default)]
    pub max_total_kb: Option<usize>,
}

/// Simulated page overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageOverrides {
    /// URL reported for the simulated tab.
    #[serde(default)]
    pub url: Option<String>,

    /// Title reported for the simulated tab.
    #[serde(default)]
    pub title: Option<String>,
}

impl PreviewConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: PreviewConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref policy) = self.runner.state_persistence {
            match policy.as_str() {
                "reset" | "carry_forward" => {}
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "runner: unsupported state_persistence '{}', supported: reset, carry_forward",
                        other
                    )));
                }
            }
        }

        let positive = [
            ("admission.max_files", self.admission.max_files),
            ("admission.max_total_kb", self.admission.max_total_kb),
            ("admission.max_file_kb", self.admission.max_file_kb),
            ("storage.max_keys", self.storage.max_keys),
            ("storage.max_value_kb", self.storage.max_value_kb),
            ("storage.max_total_kb", self.storage.max_total_kb),
        ];
        for (name, value) in positive {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
            }
        }

        let kib = [
            ("admission.max_total_kb", self.admission.max_total_kb),
            ("admission.max_file_kb", self.admission.max_file_kb),
            ("storage.max_value_kb", self.storage.max_value_kb),
            ("storage.max_total_kb", self.storage.max_total_kb),
        ];
        for (name, value) in kib {
            if value.is_some_and(|kb| kb.checked_mul(1024).is_none()) {
                return Err(ConfigError::Invalid(format!("{} is too large", name)));
            }
        }

        if self.bridge.response_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "bridge.response_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.runner.ready_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "runner.ready_timeout_ms must be greater than 0".into(),
            ));
        }

        if let (Some(file), Some(total)) =
            (self.admission.max_file_kb, self.admission.max_total_kb)
        {
            if file > total {
                return Err(ConfigError::Invalid(format!(
                    "admission.max_file_kb ({}) exceeds admission.max_total_kb ({})",
                    file, total
                )));
            }
        }

        if let Some(ref url) = self.page.url {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(ConfigError::Invalid(format!(
                    "page.url '{}' must be an http(s) URL",
                    url
                )));
            }
        }

        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    // Leave the placeholder if env var not found
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn config_empty_is_valid() {
        let config = PreviewConfig::from_toml("").unwrap();
        assert!(config.admission.max_files.is_none());
        assert!(config.bridge.response_timeout_ms.is_none());
        assert!(config.runner.state_persistence.is_none());
        assert!(config.page.url.is_none());
    }

    #[test]
    fn config_parses_admission_overrides() {
        let toml = r#"
            [admission]
            max_files = 10
            max_total_kb = 200
            max_file_kb = 50
        "#;

        let config = PreviewConfig::from_toml(toml).unwrap();
        assert_eq!(config.admission.max_files, Some(10));
        assert_eq!(config.admission.max_total_kb, Some(200));
        assert_eq!(config.admission.max_file_kb, Some(50));
    }

    #[test]
    fn config_parses_runner_and_bridge() {
        let toml = r#"
            [bridge]
            response_timeout_ms = 1500

            [runner]
            ready_timeout_ms = 8000
            state_persistence = "carry_forward"
            capability_log_capacity = 64
        "#;

        let config = PreviewConfig::from_toml(toml).unwrap();
        assert_eq!(config.bridge.response_timeout_ms, Some(1500));
        assert_eq!(config.runner.ready_timeout_ms, Some(8000));
        assert_eq!(
            config.runner.state_persistence.as_deref(),
            Some("carry_forward")
        );
        assert_eq!(config.runner.capability_log_capacity, Some(64));
    }

    #[test]
    fn config_rejects_unknown_persistence_policy() {
        let toml = r#"
            [runner]
            state_persistence = "forever"
        "#;

        let err = PreviewConfig::from_toml(toml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("forever"), "error should mention the value: {msg}");
        assert!(msg.contains("carry_forward"), "error should list options: {msg}");
    }

    #[test]
    fn config_rejects_zero_limits() {
        let toml = r#"
            [admission]
            max_files = 0
        "#;
        let err = PreviewConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("admission.max_files"));

        let toml = r#"
            [bridge]
            response_timeout_ms = 0
        "#;
        let err = PreviewConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("response_timeout_ms"));
    }

    #[test]
    fn config_rejects_kib_values_that_overflow_bytes() {
        let toml = r#"
            [storage]
            max_total_kb = 9223372036854775807
        "#;
        let err = PreviewConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("storage.max_total_kb"));
    }

    #[test]
    fn config_rejects_file_ceiling_above_total() {
        let toml = r#"
            [admission]
            max_total_kb = 100
            max_file_kb = 200
        "#;
        let err = PreviewConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("max_file_kb"));
    }

    #[test]
    fn config_rejects_non_http_page_url() {
        let toml = r#"
            [page]
            url = "file:///etc/passwd"
        "#;
        let err = PreviewConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("page.url"));
    }

    #[test]
    fn config_rejects_unparseable_toml() {
        let err = PreviewConfig::from_toml("[admission\nmax_files = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    #[serial]
    fn config_expands_environment_variables() {
        std::env::set_var("PREVIEW_TEST_PAGE_HOST", "news.example.org");
        let toml = r#"
            [page]
            url = "https://${PREVIEW_TEST_PAGE_HOST}/story"
            title = "Story"
        "#;

        let config = PreviewConfig::from_toml_with_env(toml).unwrap();
        assert_eq!(
            config.page.url.as_deref(),
            Some("https://news.example.org/story")
        );
        std::env::remove_var("PREVIEW_TEST_PAGE_HOST");
    }

    #[test]
    fn config_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.toml");
        std::fs::write(
            &path,
            r#"
            [storage]
            max_keys = 32
            max_value_kb = 8
        "#,
        )
        .unwrap();

        let config = PreviewConfig::from_file(&path).unwrap();
        assert_eq!(config.storage.max_keys, Some(32));
        assert_eq!(config.storage.max_value_kb, Some(8));
        assert!(config.storage.max_total_kb.is_none());
    }

    #[test]
    fn config_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PreviewConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn env_var_expansion_preserves_unresolved() {
        let result = expand_env_vars("prefix ${DEFINITELY_NOT_SET_98765} suffix");
        assert_eq!(result, "prefix ${DEFINITELY_NOT_SET_98765} suffix");
    }

    #[test]
    fn env_var_expansion_handles_no_vars() {
        let result = expand_env_vars("no variables here");
        assert_eq!(result, "no variables here");
    }
}
