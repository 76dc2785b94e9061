//! Bundle descriptor (`manifest.json`) parsing.
//!
//! The descriptor comes from a language model, so nothing in it is trusted
//! until it has been checked here. Only the fields the preview needs are
//! modelled; everything else is ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

/// Path of the bundle descriptor inside a file set.
pub const DESCRIPTOR_PATH: &str = "manifest.json";

/// The only manifest version the preview runs.
pub const SUPPORTED_MANIFEST_VERSION: i64 = 3;

/// Popup document used when the descriptor does not declare one.
pub const DEFAULT_POPUP: &str = "popup.html";

/// The subset of `manifest.json` the preview relies on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleDescriptor {
    /// Declared manifest version. Always [`SUPPORTED_MANIFEST_VERSION`] once parsed.
    pub manifest_version: i64,
    /// Extension name.
    #[serde(default)]
    pub name: Option<String>,
    /// Extension version string.
    #[serde(default)]
    pub version: Option<String>,
    /// Extension description.
    #[serde(default)]
    pub description: Option<String>,
    /// Requested API permissions.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Requested host permissions.
    #[serde(default)]
    pub host_permissions: Vec<String>,
    /// Toolbar action.
    #[serde(default)]
    pub action: Option<ActionDecl>,
    /// Background service worker.
    #[serde(default)]
    pub background: Option<BackgroundDecl>,
    /// Content scripts injected into pages.
    #[serde(default)]
    pub content_scripts: Vec<ContentScriptDecl>,
}

/// `action` block of the descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionDecl {
    /// Popup document path.
    #[serde(default)]
    pub default_popup: Option<String>,
    /// Tooltip title.
    #[serde(default)]
    pub default_title: Option<String>,
}

/// `background` block of the descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackgroundDecl {
    /// Service worker script path.
    #[serde(default)]
    pub service_worker: Option<String>,
}

/// One `content_scripts` entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentScriptDecl {
    /// URL match patterns.
    #[serde(default)]
    pub matches: Vec<String>,
    /// Scripts, in injection order.
    #[serde(default)]
    pub js: Vec<String>,
    /// Stylesheets.
    #[serde(default)]
    pub css: Vec<String>,
}

impl Default for BundleDescriptor {
    fn default() -> Self {
        Self {
            manifest_version: SUPPORTED_MANIFEST_VERSION,
            name: None,
            version: None,
            description: None,
            permissions: Vec::new(),
            host_permissions: Vec::new(),
            action: None,
            background: None,
            content_scripts: Vec::new(),
        }
    }
}

impl BundleDescriptor {
    /// Popup document path, falling back to [`DEFAULT_POPUP`].
    pub fn popup_path(&self) -> &str {
        self.action
            .as_ref()
            .and_then(|a| a.default_popup.as_deref())
            .unwrap_or(DEFAULT_POPUP)
    }

    /// Service worker path, if declared.
    pub fn service_worker(&self) -> Option<&str> {
        self.background
            .as_ref()
            .and_then(|b| b.service_worker.as_deref())
    }

    /// Content script paths in declaration order, without duplicates.
    pub fn content_script_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = Vec::new();
        for path in self.content_scripts.iter().flat_map(|c| c.js.iter()) {
            if !paths.contains(&path.as_str()) {
                paths.push(path);
            }
        }
        paths
    }

    /// Whether the bundle targets web pages and therefore needs a page context.
    pub fn is_page_targeting(&self) -> bool {
        self.content_scripts.iter().any(|c| !c.js.is_empty())
            || self.permissions.iter().any(|p| p == "scripting")
    }
}

/// Parse and check a descriptor.
///
/// The version is checked on the raw JSON first, so an unsupported version
/// is reported as such even when the rest of the document has a different
/// shape.
pub fn parse_descriptor(content: &str) -> Result<BundleDescriptor, ValidationError> {
    let raw: Value = serde_json::from_str(content).map_err(|e| ValidationError::InvalidDescriptor {
        reason: e.to_string(),
    })?;

    let Some(obj) = raw.as_object() else {
        return Err(ValidationError::InvalidDescriptor {
            reason: "descriptor must be a JSON object".into(),
        });
    };

    let version = match obj.get("manifest_version") {
        None => {
            return Err(ValidationError::InvalidDescriptor {
                reason: "manifest_version is missing".into(),
            })
        }
        Some(v) => v.as_i64().ok_or_else(|| ValidationError::InvalidDescriptor {
            reason: format!("manifest_version must be an integer, got {}", v),
        })?,
    };

    if version != SUPPORTED_MANIFEST_VERSION {
        return Err(ValidationError::UnsupportedManifestVersion {
            found: version,
            supported: SUPPORTED_MANIFEST_VERSION,
        });
    }

    serde_json::from_value(raw).map_err(|e| ValidationError::InvalidDescriptor {
        reason: e.to_string(),
    })
}
