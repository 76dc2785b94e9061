//! Admission validator for incoming file sets.
//!
//! Every file set handed to the preview is untrusted model output. This
//! module is the only way to obtain a [`ValidatedFileSet`], so nothing
//! downstream ever sees a file that has not passed these checks. Admission is
//! all-or-nothing: the first failing rule rejects the whole set.
//!
//! This is hygiene, not a security boundary: the host's isolation primitives
//! are what contain the code. The checks catch unsafe paths, oversized
//! payloads, binary masquerading as text and missing descriptors early, with
//! an error that names the offending file or limit.

use std::collections::HashSet;
use std::sync::LazyLock;

use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::assets::RUNTIME_DIR;
use crate::descriptor::{parse_descriptor, BundleDescriptor, DESCRIPTOR_PATH};
use crate::error::ValidationError;

/// Allowed path characters.
static PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-/]+$").expect("static regex is valid"));

/// Extensions carried as plain text.
const TEXT_EXTENSIONS: &[&str] = &["js", "mjs", "json", "html", "htm", "css", "svg", "txt", "md"];

/// Extensions carried as base64 and exempt from the text hygiene check.
const BINARY_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "ico", "woff", "woff2"];

/// One file as produced by the generation collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Relative path inside the bundle.
    pub path: String,
    /// File content. Binary files are base64 text.
    pub content: String,
    /// Advisory flag from the generator. Never exempts a file from checks.
    #[serde(default)]
    pub is_binary_hint: bool,
}

impl FileEntry {
    /// Create a text entry.
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            is_binary_hint: false,
        }
    }
}

/// An ordered set of files plus optional free text from the generator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileSet {
    /// The files, in generator order.
    pub files: Vec<FileEntry>,
    /// Short summary of what was generated.
    #[serde(default)]
    pub summary: Option<String>,
    /// Longer notes from the generator.
    #[serde(default)]
    pub notes: Option<String>,
}

impl FileSet {
    /// Build a file set from entries.
    pub fn new(files: Vec<FileEntry>) -> Self {
        Self {
            files,
            summary: None,
            notes: None,
        }
    }

    /// Parse the JSON shape emitted by the generation collaborator.
    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(json).map_err(|e| ValidationError::Malformed {
            reason: e.to_string(),
        })
    }
}

/// Whether the file set is a whole bundle or a delta over the live one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    /// A complete bundle; the descriptor is required.
    #[default]
    New,
    /// Changed files only; the descriptor is optional.
    Edit,
}

/// Fixed admission ceilings.
#[derive(Debug, Clone)]
pub struct AdmissionLimits {
    /// Maximum number of files (default: 60).
    pub max_files: usize,
    /// Maximum cumulative UTF-8 bytes (default: 400 KiB).
    pub max_total_bytes: usize,
    /// Maximum UTF-8 bytes for one file (default: 256 KiB).
    pub max_file_bytes: usize,
    /// Maximum path length in characters (default: 200).
    pub max_path_len: usize,
    /// Number of leading characters sampled by the text check (default: 4096).
    pub hygiene_sample_chars: usize,
    /// Highest tolerated share of control characters, in percent (default: 5).
    pub max_control_percent: usize,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            max_files: 60,
            max_total_bytes: 400 * 1024,
            max_file_bytes: 256 * 1024,
            max_path_len: 200,
            hygiene_sample_chars: 4096,
            max_control_percent: 5,
        }
    }
}

/// How an admitted file's content is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// UTF-8 text.
    Text,
    /// Base64-encoded bytes.
    Binary,
}

/// A file that passed admission.
#[derive(Debug, Clone)]
pub struct AdmittedFile {
    /// Relative path inside the bundle.
    pub path: String,
    /// File content as submitted.
    pub content: String,
    /// Text or base64 binary, decided by extension.
    pub kind: ContentKind,
    /// Lower-cased extension.
    pub extension: String,
}

impl AdmittedFile {
    /// UTF-8 size of the submitted content.
    pub fn size_bytes(&self) -> usize {
        self.content.len()
    }
}

impl From<&AdmittedFile> for FileEntry {
    fn from(file: &AdmittedFile) -> Self {
        Self {
            path: file.path.clone(),
            content: file.content.clone(),
            is_binary_hint: file.kind == ContentKind::Binary,
        }
    }
}

/// A file set that passed every admission rule.
///
/// Only [`validate`] constructs this type.
#[derive(Debug, Clone)]
pub struct ValidatedFileSet {
    mode: AdmissionMode,
    files: Vec<AdmittedFile>,
    descriptor: Option<BundleDescriptor>,
    total_bytes: usize,
    summary: Option<String>,
}

impl ValidatedFileSet {
    /// The mode the set was admitted under.
    pub fn mode(&self) -> AdmissionMode {
        self.mode
    }

    /// Admitted files in submission order.
    pub fn files(&self) -> &[AdmittedFile] {
        &self.files
    }

    /// Look up a file by path.
    pub fn get(&self, path: &str) -> Option<&AdmittedFile> {
        self.files.iter().find(|f| f.path == path)
    }

    /// The parsed descriptor, when the set carries one.
    pub fn descriptor(&self) -> Option<&BundleDescriptor> {
        self.descriptor.as_ref()
    }

    /// Cumulative UTF-8 size.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Generator summary, if any.
    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Validate an untrusted file set.
///
/// Checks run in a fixed order: emptiness, file count, cumulative size, then
/// per file path safety, duplicates, per-file size and content hygiene, and
/// finally the descriptor.
pub fn validate(
    file_set: &FileSet,
    mode: AdmissionMode,
    limits: &AdmissionLimits,
) -> Result<ValidatedFileSet, ValidationError> {
    let files = &file_set.files;

    if files.is_empty() {
        return Err(match mode {
            AdmissionMode::New => ValidationError::MissingDescriptor,
            AdmissionMode::Edit => ValidationError::Empty,
        });
    }

    if files.len() > limits.max_files {
        return Err(ValidationError::TooManyFiles {
            max: limits.max_files,
            actual: files.len(),
        });
    }

    let total_bytes: usize = files.iter().map(|f| f.content.len()).sum();
    if total_bytes > limits.max_total_bytes {
        return Err(ValidationError::TotalTooLarge {
            max: limits.max_total_bytes,
            actual: total_bytes,
        });
    }

    let mut seen = HashSet::with_capacity(files.len());
    let mut admitted = Vec::with_capacity(files.len());

    for entry in files {
        let extension = check_path(&entry.path, limits)?;

        if !seen.insert(entry.path.as_str()) {
            return Err(ValidationError::DuplicatePath {
                path: entry.path.clone(),
            });
        }

        let size = entry.content.len();
        if size > limits.max_file_bytes {
            return Err(ValidationError::FileTooLarge {
                path: entry.path.clone(),
                max: limits.max_file_bytes,
                actual: size,
            });
        }

        let kind = if BINARY_EXTENSIONS.contains(&extension.as_str()) {
            check_base64(&entry.path, &entry.content)?;
            ContentKind::Binary
        } else {
            check_text(&entry.path, &entry.content, limits)?;
            ContentKind::Text
        };

        admitted.push(AdmittedFile {
            path: entry.path.clone(),
            content: entry.content.clone(),
            kind,
            extension,
        });
    }

    let descriptor = match admitted.iter().find(|f| f.path == DESCRIPTOR_PATH) {
        Some(file) => Some(parse_descriptor(&file.content)?),
        None if mode == AdmissionMode::New => return Err(ValidationError::MissingDescriptor),
        None => None,
    };

    tracing::debug!(
        files = admitted.len(),
        total_bytes,
        mode = ?mode,
        "file set admitted"
    );

    Ok(ValidatedFileSet {
        mode,
        files: admitted,
        descriptor,
        total_bytes,
        summary: file_set.summary.clone(),
    })
}

/// Apply an edit delta over a previously admitted set.
///
/// Files whose path appears in the delta are replaced in place; new paths
/// are appended. The result still has to go through [`validate`].
pub fn merge_delta(base: &ValidatedFileSet, delta: &FileSet) -> FileSet {
    let mut files: Vec<FileEntry> = base.files().iter().map(FileEntry::from).collect();
    for change in &delta.files {
        match files.iter_mut().find(|f| f.path == change.path) {
            Some(existing) => *existing = change.clone(),
            None => files.push(change.clone()),
        }
    }
    FileSet {
        files,
        summary: delta.summary.clone().or_else(|| base.summary.clone()),
        notes: delta.notes.clone(),
    }
}

/// Lower-cased extension of a path, if any.
pub fn extension_of(path: &str) -> Option<String> {
    let name = path.rsplit('/').next()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Apply the path-safety rules, returning the lower-cased extension.
fn check_path(path: &str, limits: &AdmissionLimits) -> Result<String, ValidationError> {
    let unsafe_path = |reason: &'static str| ValidationError::UnsafePath {
        path: path.to_string(),
        reason,
    };

    if path.is_empty() {
        return Err(unsafe_path("path is empty"));
    }
    if path.chars().count() > limits.max_path_len {
        return Err(unsafe_path("path is too long"));
    }
    if !PATH_RE.is_match(path) {
        return Err(unsafe_path("path contains characters outside [A-Za-z0-9_.-/]"));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(unsafe_path("path contains a '..' segment"));
    }
    if path.starts_with('/') {
        return Err(unsafe_path("path is absolute"));
    }
    if path.starts_with('.') {
        return Err(unsafe_path("path starts with '.'"));
    }
    if path.split('/').any(str::is_empty) {
        return Err(unsafe_path("path has an empty segment"));
    }
    if path.split('/').any(|segment| segment.starts_with('.')) {
        return Err(unsafe_path("path has a hidden segment"));
    }
    if path.split('/').next() == Some(RUNTIME_DIR) {
        return Err(unsafe_path("path is inside the reserved __preview__ directory"));
    }

    match extension_of(path) {
        Some(ext)
            if TEXT_EXTENSIONS.contains(&ext.as_str())
                || BINARY_EXTENSIONS.contains(&ext.as_str()) =>
        {
            Ok(ext)
        }
        Some(_) => Err(unsafe_path("path has an unrecognized extension")),
        None => Err(unsafe_path("path has no extension")),
    }
}

/// Cheap "is this actually text" heuristic over a bounded prefix.
fn check_text(path: &str, content: &str, limits: &AdmissionLimits) -> Result<(), ValidationError> {
    let mut sampled = 0usize;
    let mut control = 0usize;
    for c in content.chars().take(limits.hygiene_sample_chars) {
        sampled += 1;
        if c.is_control() && !matches!(c, '\t' | '\n' | '\r') {
            control += 1;
        }
    }

    if sampled > 0 && control * 100 > sampled * limits.max_control_percent {
        return Err(ValidationError::NonTextContent {
            path: path.to_string(),
            percent: u32::try_from(control * 100 / sampled).unwrap_or(100),
        });
    }
    Ok(())
}

fn check_base64(path: &str, content: &str) -> Result<(), ValidationError> {
    decode_binary(content)
        .map(|_| ())
        .map_err(|e| ValidationError::InvalidBinaryEncoding {
            path: path.to_string(),
            reason: e.to_string(),
        })
}

/// Decode base64 content, tolerating a `data:...;base64,` prefix and whitespace.
pub(crate) fn decode_binary(content: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let payload = match content.find(";base64,") {
        Some(idx) if content.starts_with("data:") => &content[idx + ";base64,".len()..],
        _ => content,
    };
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD.decode(compact)
}
