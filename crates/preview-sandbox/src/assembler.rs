//! Document assembler.
//!
//! Builds the entry documents that isolated contexts load. Each document
//! declares a script-origin policy that only admits `blob:` references and
//! carries an exact allowlist of the references it may load. Scripts load in
//! three phases: the capability shim, then the bundle's own scripts, then
//! the DOM binding module.
//!
//! Popup markup from the bundle is cleaned before use: inline `<script>`
//! bodies, `on*=` handler attributes and `javascript:` URLs are removed and
//! reported as [`AssemblyWarning`]s. Relative asset references are rewritten
//! to the generation's ephemeral references.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Serialize;

use crate::assets::{
    bindings_module, shim_module, BINDINGS_PATH, PAGE_DOCUMENT_PATH, POPUP_DOCUMENT_PATH,
    SHIM_PATH,
};
use crate::bridge::ContextId;
use crate::descriptor::BundleDescriptor;
use crate::error::AssemblyError;
use crate::shim::{IdentityToken, PageSnapshot};
use crate::vfs::{EphemeralRef, Materializer, ResourceHandle, ResourceTable};
use crate::Generation;

/// Script-origin policy declared by every entry document.
pub const SCRIPT_ORIGIN_POLICY: &str = "default-src 'none'; script-src blob:; \
     style-src blob:; img-src blob: data:; font-src blob:; connect-src 'none'; \
     object-src 'none'; base-uri 'none'; form-action 'none'";

static SCRIPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b([^>]*)>(.*?)</script\s*>").expect("static regex is valid")
});

static SRC_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bsrc\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#)
        .expect("static regex is valid")
});

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title\s*>").expect("static regex is valid"));

static BODY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<body[^>]*>(.*)</body\s*>").expect("static regex is valid"));

static HEAD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<head[^>]*>.*?</head\s*>").expect("static regex is valid"));

static SHELL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<!doctype[^>]*>|</?html[^>]*>|</?body[^>]*>").expect("static regex is valid")
});

static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<link\b[^>]*>").expect("static regex is valid"));

static STYLESHEET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\brel\s*=\s*["']?stylesheet"#).expect("static regex is valid")
});

static HREF_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bhref\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#)
        .expect("static regex is valid")
});

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[a-zA-Z][^>]*>").expect("static regex is valid"));

static HANDLER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\s+(on[a-z]+)\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#)
        .expect("static regex is valid")
});

static JS_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b(href|src|action|formaction)\s*=\s*(?:"\s*javascript:[^"]*"|'\s*javascript:[^']*'|javascript:[^\s>]*)"#,
    )
    .expect("static regex is valid")
});

static ASSET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(src|href)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .expect("static regex is valid")
});

static SCHEME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.\-]*:").expect("static regex is valid"));

/// The policy header plus the exact set of references a document may load.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScriptOriginPolicy {
    allowlist: BTreeSet<EphemeralRef>,
}

impl ScriptOriginPolicy {
    /// The policy header value.
    pub fn header(&self) -> &'static str {
        SCRIPT_ORIGIN_POLICY
    }

    /// Whether `reference` may be loaded.
    pub fn allows(&self, reference: &EphemeralRef) -> bool {
        self.allowlist.contains(reference)
    }

    /// Allowed references, sorted.
    pub fn allowlist(&self) -> impl Iterator<Item = &EphemeralRef> {
        self.allowlist.iter()
    }

    /// Number of allowed references.
    pub fn len(&self) -> usize {
        self.allowlist.len()
    }

    /// Whether nothing is allowed.
    pub fn is_empty(&self) -> bool {
        self.allowlist.is_empty()
    }

    fn allow(&mut self, reference: &EphemeralRef) {
        self.allowlist.insert(reference.clone());
    }
}

/// Script load phase. Phases run strictly in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPhase {
    /// The capability shim.
    Shim,
    /// The bundle's own scripts.
    Bundle,
    /// The DOM binding module.
    Bindings,
}

/// One script a document loads.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptTag {
    /// Load phase.
    pub phase: LoadPhase,
    /// Bundle or runtime path.
    pub path: String,
    /// Reference to load.
    pub reference: EphemeralRef,
}

/// One stylesheet a document links.
#[derive(Debug, Clone, Serialize)]
pub struct StyleTag {
    /// Bundle path.
    pub path: String,
    /// Reference to link.
    pub reference: EphemeralRef,
}

/// Which context a document is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    /// The extension popup.
    Popup,
    /// The simulated web page.
    Page,
}

impl DocumentKind {
    /// Context that loads documents of this kind.
    pub fn context(self) -> ContextId {
        match self {
            Self::Popup => ContextId::Popup,
            Self::Page => ContextId::Page,
        }
    }
}

/// An assembled entry document.
#[derive(Debug, Clone, Serialize)]
pub struct EntryDocument {
    /// Popup or page.
    pub kind: DocumentKind,
    /// Owning generation.
    pub generation: Generation,
    /// Document title.
    pub title: String,
    /// Policy and allowlist.
    pub policy: ScriptOriginPolicy,
    /// Scripts in load order.
    pub scripts: Vec<ScriptTag>,
    /// Linked stylesheets.
    pub stylesheets: Vec<StyleTag>,
    /// Cleaned body markup.
    pub body: String,
}

impl EntryDocument {
    /// Paths of the scripts in load order.
    pub fn script_paths(&self) -> Vec<&str> {
        self.scripts.iter().map(|s| s.path.as_str()).collect()
    }

    /// Render the document as HTML.
    pub fn render(&self) -> String {
        let mut html = String::with_capacity(self.body.len() + 1024);
        html.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
        html.push_str(&format!(
            "<meta http-equiv=\"Content-Security-Policy\" content=\"{}\">\n",
            self.policy.header()
        ));
        html.push_str(&format!("<title>{}</title>\n", escape_html(&self.title)));
        for style in &self.stylesheets {
            html.push_str(&format!(
                "<link rel=\"stylesheet\" href=\"{}\" data-path=\"{}\">\n",
                style.reference,
                escape_html(&style.path)
            ));
        }
        html.push_str("</head>\n");
        html.push_str(&format!("<body data-generation=\"{}\">\n", self.generation));
        html.push_str(&self.body);
        html.push('\n');
        for script in &self.scripts {
            let phase = match script.phase {
                LoadPhase::Shim => "shim",
                LoadPhase::Bundle => "bundle",
                LoadPhase::Bindings => "bindings",
            };
            html.push_str(&format!(
                "<script src=\"{}\" data-phase=\"{}\" data-path=\"{}\"></script>\n",
                script.reference,
                phase,
                escape_html(&script.path)
            ));
        }
        html.push_str("</body>\n</html>\n");
        html
    }
}

/// Something removed or left unresolved while cleaning popup markup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssemblyWarning {
    /// The declared popup document is not in the bundle.
    MissingPopup {
        /// Declared path.
        path: String,
    },
    /// An inline `<script>` body was removed.
    InlineScriptRemoved {
        /// Document path.
        path: String,
    },
    /// An inline event handler attribute was removed.
    InlineHandlerRemoved {
        /// Document path.
        path: String,
        /// The attribute, e.g. `onclick`.
        attribute: String,
    },
    /// A `javascript:` URL was neutralised.
    ScriptUrlRemoved {
        /// Document path.
        path: String,
    },
    /// A script from a non-bundle origin was removed.
    RemoteScriptRemoved {
        /// Document path.
        path: String,
        /// The refused `src`.
        src: String,
    },
    /// A relative reference that is not in the bundle.
    UnresolvedReference {
        /// Document path.
        path: String,
        /// The reference as written.
        reference: String,
    },
}

impl fmt::Display for AssemblyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPopup { path } => write!(f, "popup document '{path}' is missing"),
            Self::InlineScriptRemoved { path } => {
                write!(f, "{path}: inline script removed")
            }
            Self::InlineHandlerRemoved { path, attribute } => {
                write!(f, "{path}: inline handler '{attribute}' removed")
            }
            Self::ScriptUrlRemoved { path } => write!(f, "{path}: javascript: URL removed"),
            Self::RemoteScriptRemoved { path, src } => {
                write!(f, "{path}: remote script '{src}' removed")
            }
            Self::UnresolvedReference { path, reference } => {
                write!(f, "{path}: '{reference}' is not in the bundle")
            }
        }
    }
}

/// Everything the runner needs to launch a generation.
#[derive(Debug)]
pub struct AssembledPreview {
    /// Owning generation.
    pub generation: Generation,
    /// Token minted for this generation. Never placed in any document.
    pub identity: IdentityToken,
    /// The popup document.
    pub popup: EntryDocument,
    /// The rendered popup document, materialized.
    pub popup_document: ResourceHandle,
    /// The page document, for page-targeting bundles.
    pub page: Option<EntryDocument>,
    /// The rendered page document, materialized.
    pub page_document: Option<ResourceHandle>,
    /// Runtime modules materialized for this generation.
    pub runtime: Vec<ResourceHandle>,
    /// What was removed or left unresolved.
    pub warnings: Vec<AssemblyWarning>,
}

/// Assemble the entry documents for a materialized generation.
///
/// Runtime modules and the rendered documents are materialized into the
/// same generation as `table`.
#[tracing::instrument(skip_all, fields(generation = %table.generation()))]
pub fn assemble(
    table: &ResourceTable,
    descriptor: &BundleDescriptor,
    materializer: &Materializer,
    page: &PageSnapshot,
) -> Result<AssembledPreview, AssemblyError> {
    let generation = table.generation();
    let identity = IdentityToken::mint();
    let mut warnings = Vec::new();

    let shim = materializer.materialize_runtime(generation, SHIM_PATH, &shim_module(generation))?;
    let bindings =
        materializer.materialize_runtime(generation, BINDINGS_PATH, &bindings_module(generation))?;

    let popup = assemble_popup(table, descriptor, materializer, &shim, &bindings, &mut warnings)?;
    let popup_document =
        materializer.materialize_runtime(generation, POPUP_DOCUMENT_PATH, &popup.render())?;

    let (page, page_document) = if descriptor.is_page_targeting() {
        let doc = assemble_page(table, descriptor, page, &shim, &bindings)?;
        let handle = materializer.materialize_runtime(generation, PAGE_DOCUMENT_PATH, &doc.render())?;
        (Some(doc), Some(handle))
    } else {
        (None, None)
    };

    for warning in &warnings {
        tracing::info!(%generation, warning = %warning, "markup cleaned");
    }
    tracing::debug!(
        %generation,
        popup_scripts = popup.scripts.len(),
        page = page.is_some(),
        "documents assembled"
    );

    Ok(AssembledPreview {
        generation,
        identity,
        popup,
        popup_document,
        page,
        page_document,
        runtime: vec![shim, bindings],
        warnings,
    })
}

fn assemble_popup(
    table: &ResourceTable,
    descriptor: &BundleDescriptor,
    materializer: &Materializer,
    shim: &ResourceHandle,
    bindings: &ResourceHandle,
    warnings: &mut Vec<AssemblyWarning>,
) -> Result<EntryDocument, AssemblyError> {
    let popup_path = descriptor.popup_path();
    let base_dir = parent_dir(popup_path);

    let markup = match table.get(popup_path) {
        Some(handle) => materializer
            .redeem(&handle.reference)
            .map(|r| r.text())
            .ok_or_else(|| AssemblyError::ResourceUnavailable {
                path: popup_path.to_string(),
            })?,
        None => {
            warnings.push(AssemblyWarning::MissingPopup {
                path: popup_path.to_string(),
            });
            "<main id=\"app\"></main>".to_string()
        }
    };

    let mut cleaner = MarkupCleaner {
        document: popup_path,
        base_dir,
        table,
        policy: ScriptOriginPolicy::default(),
        warnings,
    };

    let (declared, markup) = cleaner.take_scripts(&markup);
    let title = extract_title(&markup).unwrap_or_else(|| {
        descriptor
            .name
            .clone()
            .unwrap_or_else(|| "Extension preview".into())
    });
    let (stylesheets, markup) = cleaner.take_stylesheets(&markup)?;
    let body = cleaner.clean_tags(&extract_body(&markup));

    let bundle_paths: Vec<String> = if declared.is_empty() {
        default_script_order(table, descriptor)
    } else {
        declared
    };

    let mut scripts = vec![ScriptTag {
        phase: LoadPhase::Shim,
        path: shim.path.clone(),
        reference: shim.reference.clone(),
    }];
    for path in bundle_paths {
        let handle = table
            .get(&path)
            .ok_or_else(|| AssemblyError::ResourceUnavailable { path: path.clone() })?;
        scripts.push(ScriptTag {
            phase: LoadPhase::Bundle,
            path,
            reference: handle.reference.clone(),
        });
    }
    scripts.push(ScriptTag {
        phase: LoadPhase::Bindings,
        path: bindings.path.clone(),
        reference: bindings.reference.clone(),
    });

    let mut policy = std::mem::take(&mut cleaner.policy);
    for script in &scripts {
        policy.allow(&script.reference);
    }
    for style in &stylesheets {
        policy.allow(&style.reference);
    }

    Ok(EntryDocument {
        kind: DocumentKind::Popup,
        generation: table.generation(),
        title,
        policy,
        scripts,
        stylesheets,
        body,
    })
}

fn assemble_page(
    table: &ResourceTable,
    descriptor: &BundleDescriptor,
    page: &PageSnapshot,
    shim: &ResourceHandle,
    bindings: &ResourceHandle,
) -> Result<EntryDocument, AssemblyError> {
    let mut policy = ScriptOriginPolicy::default();
    let mut scripts = vec![ScriptTag {
        phase: LoadPhase::Shim,
        path: shim.path.clone(),
        reference: shim.reference.clone(),
    }];
    for path in descriptor.content_script_paths() {
        let handle = table
            .get(path)
            .ok_or_else(|| AssemblyError::ResourceUnavailable {
                path: path.to_string(),
            })?;
        scripts.push(ScriptTag {
            phase: LoadPhase::Bundle,
            path: path.to_string(),
            reference: handle.reference.clone(),
        });
    }
    scripts.push(ScriptTag {
        phase: LoadPhase::Bindings,
        path: bindings.path.clone(),
        reference: bindings.reference.clone(),
    });

    let mut stylesheets = Vec::new();
    let mut seen = BTreeSet::new();
    for path in descriptor.content_scripts.iter().flat_map(|c| c.css.iter()) {
        if !seen.insert(path.as_str()) {
            continue;
        }
        let handle = table
            .get(path)
            .ok_or_else(|| AssemblyError::ResourceUnavailable { path: path.clone() })?;
        stylesheets.push(StyleTag {
            path: path.clone(),
            reference: handle.reference.clone(),
        });
    }

    for script in &scripts {
        policy.allow(&script.reference);
    }
    for style in &stylesheets {
        policy.allow(&style.reference);
    }

    Ok(EntryDocument {
        kind: DocumentKind::Page,
        generation: table.generation(),
        title: page.title.clone(),
        policy,
        scripts,
        stylesheets,
        body: extract_body(&page.markup),
    })
}

/// Bundle `.js`/`.mjs` files in file set order, minus the service worker and
/// content scripts.
fn default_script_order(table: &ResourceTable, descriptor: &BundleDescriptor) -> Vec<String> {
    let worker = descriptor.service_worker();
    let content = descriptor.content_script_paths();
    table
        .handles()
        .iter()
        .filter(|h| h.path.ends_with(".js") || h.path.ends_with(".mjs"))
        .filter(|h| Some(h.path.as_str()) != worker)
        .filter(|h| !content.contains(&h.path.as_str()))
        .map(|h| h.path.clone())
        .collect()
}

struct MarkupCleaner<'a> {
    document: &'a str,
    base_dir: &'a str,
    table: &'a ResourceTable,
    policy: ScriptOriginPolicy,
    warnings: &'a mut Vec<AssemblyWarning>,
}

impl MarkupCleaner<'_> {
    /// Remove every `<script>` element, returning the declared bundle script
    /// paths in document order.
    fn take_scripts(&mut self, markup: &str) -> (Vec<String>, String) {
        let mut declared = Vec::new();
        let cleaned = SCRIPT_RE.replace_all(markup, |caps: &Captures| {
            let attrs = caps.get(1).map_or("", |m| m.as_str());
            let inline = caps.get(2).map_or("", |m| m.as_str());
            match first_group(SRC_ATTR_RE.captures(attrs)) {
                Some(src) if is_external(&src) => {
                    self.warnings.push(AssemblyWarning::RemoteScriptRemoved {
                        path: self.document.to_string(),
                        src,
                    });
                }
                Some(src) => match resolve_relative(self.base_dir, &src) {
                    Some(path) => {
                        if !declared.contains(&path) {
                            declared.push(path);
                        }
                    }
                    None => self.warnings.push(AssemblyWarning::UnresolvedReference {
                        path: self.document.to_string(),
                        reference: src,
                    }),
                },
                None if !inline.trim().is_empty() => {
                    self.warnings.push(AssemblyWarning::InlineScriptRemoved {
                        path: self.document.to_string(),
                    });
                }
                None => {}
            }
            String::new()
        });
        (declared, cleaned.into_owned())
    }

    /// Remove stylesheet `<link>`s, returning them resolved.
    fn take_stylesheets(&mut self, markup: &str) -> Result<(Vec<StyleTag>, String), AssemblyError> {
        let mut styles = Vec::new();
        let mut missing = None;
        let cleaned = LINK_RE.replace_all(markup, |caps: &Captures| {
            let tag = caps.get(0).map_or("", |m| m.as_str());
            if !STYLESHEET_RE.is_match(tag) {
                return tag.to_string();
            }
            let Some(href) = first_group(HREF_ATTR_RE.captures(tag)) else {
                return String::new();
            };
            if is_external(&href) {
                self.warnings.push(AssemblyWarning::UnresolvedReference {
                    path: self.document.to_string(),
                    reference: href,
                });
                return String::new();
            }
            match resolve_relative(self.base_dir, &href)
                .and_then(|path| self.table.get(&path).map(|h| (path, h)))
            {
                Some((path, handle)) => styles.push(StyleTag {
                    path,
                    reference: handle.reference.clone(),
                }),
                None => {
                    missing.get_or_insert(href);
                }
            }
            String::new()
        });
        if let Some(path) = missing {
            return Err(AssemblyError::ResourceUnavailable { path });
        }
        Ok((styles, cleaned.into_owned()))
    }

    /// Strip handlers and `javascript:` URLs and rewrite asset references,
    /// tag by tag.
    fn clean_tags(&mut self, body: &str) -> String {
        TAG_RE
            .replace_all(body, |caps: &Captures| {
                let tag = caps.get(0).map_or("", |m| m.as_str());
                self.clean_tag(tag)
            })
            .into_owned()
    }

    fn clean_tag(&mut self, tag: &str) -> String {
        let document = self.document;
        let warnings = &mut *self.warnings;

        let tag = HANDLER_RE.replace_all(tag, |caps: &Captures| {
            warnings.push(AssemblyWarning::InlineHandlerRemoved {
                path: document.to_string(),
                attribute: caps[1].to_ascii_lowercase(),
            });
            String::new()
        });

        let tag = JS_URL_RE.replace_all(&tag, |caps: &Captures| {
            warnings.push(AssemblyWarning::ScriptUrlRemoved {
                path: document.to_string(),
            });
            format!("{}=\"#\"", &caps[1])
        });

        let base_dir = self.base_dir;
        let table = self.table;
        let policy = &mut self.policy;
        let tag = ASSET_RE.replace_all(&tag, |caps: &Captures| {
            let attr = &caps[1];
            let value = (2..=4).find_map(|i| caps.get(i)).map_or("", |m| m.as_str());
            if value.is_empty() || value.starts_with('#') || is_external(value) {
                return caps[0].to_string();
            }
            match resolve_relative(base_dir, value).and_then(|p| table.get(&p)) {
                Some(handle) => {
                    policy.allow(&handle.reference);
                    format!("{}=\"{}\"", attr, handle.reference)
                }
                None => {
                    warnings.push(AssemblyWarning::UnresolvedReference {
                        path: document.to_string(),
                        reference: value.to_string(),
                    });
                    caps[0].to_string()
                }
            }
        });
        tag.into_owned()
    }
}

fn first_group(caps: Option<Captures<'_>>) -> Option<String> {
    let caps = caps?;
    (1..caps.len())
        .find_map(|i| caps.get(i))
        .map(|m| m.as_str().trim().to_string())
}

/// Whether a reference points outside the bundle (any scheme, or protocol-relative).
fn is_external(reference: &str) -> bool {
    reference.starts_with("//") || SCHEME_RE.is_match(reference)
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Resolve `reference` against `base_dir`. Query strings and fragments are
/// dropped. Returns `None` when the reference climbs above the bundle root.
pub(crate) fn resolve_relative(base_dir: &str, reference: &str) -> Option<String> {
    let reference = reference
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .trim();
    if reference.is_empty() {
        return None;
    }

    let (mut segments, rest): (Vec<&str>, &str) = match reference.strip_prefix('/') {
        Some(rest) => (Vec::new(), rest),
        None => (
            base_dir.split('/').filter(|s| !s.is_empty()).collect(),
            reference,
        ),
    };
    for segment in rest.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

fn extract_title(markup: &str) -> Option<String> {
    TITLE_RE
        .captures(markup)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|t| !t.is_empty())
}

fn extract_body(markup: &str) -> String {
    if let Some(inner) = BODY_RE.captures(markup).and_then(|c| c.get(1)) {
        return inner.as_str().trim().to_string();
    }
    let without_head = HEAD_RE.replace_all(markup, "");
    SHELL_RE.replace_all(&without_head, "").trim().to_string()
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
