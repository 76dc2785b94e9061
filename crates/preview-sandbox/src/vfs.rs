//! Resource materializer — the preview's virtual file system.
//!
//! Turns an admitted file set into a generation-scoped table of ephemeral
//! references (`blob:preview/<generation>/<uuid>`). References are only
//! redeemable through the [`Materializer`] that issued them, and the
//! materializer is the only component allowed to revoke them.
//!
//! **Invariant**: every reference belongs to exactly one generation, and
//! retiring a generation releases each of its references exactly once
//! without touching any other generation.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::admission::{decode_binary, extension_of, ContentKind, ValidatedFileSet};
use crate::audit::sha256_hex;
use crate::error::{LifecycleError, MaterializeError};
use crate::Generation;

/// An opaque, process-local reference to materialized content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EphemeralRef(String);

impl EphemeralRef {
    fn mint(generation: Generation) -> Self {
        Self(format!("blob:preview/{}/{}", generation, Uuid::new_v4()))
    }

    /// The reference as it appears in an entry document.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EphemeralRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who put a resource into the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceOrigin {
    /// A file from the generated bundle.
    Bundle,
    /// A module or document produced by the preview itself.
    Runtime,
}

/// A handle to one materialized resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceHandle {
    /// Bundle-relative path.
    pub path: String,
    /// Media type derived from the extension.
    pub media_type: &'static str,
    /// The ephemeral reference to load.
    pub reference: EphemeralRef,
    /// Owning generation.
    pub generation: Generation,
    /// Content size in bytes after decoding.
    pub size_bytes: usize,
    /// SHA-256 of the content, hex encoded.
    pub digest: String,
    /// Bundle file or preview runtime resource.
    pub origin: ResourceOrigin,
}

/// Content redeemed from a reference.
#[derive(Debug, Clone)]
pub struct Resource {
    /// Bundle-relative path.
    pub path: String,
    /// Media type.
    pub media_type: &'static str,
    /// The bytes.
    pub bytes: Arc<[u8]>,
}

impl Resource {
    /// Content as UTF-8 text, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// The bundle resources of one generation, in file set order.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceTable {
    generation: Generation,
    handles: Vec<ResourceHandle>,
}

impl ResourceTable {
    /// Owning generation.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Handle for a bundle path.
    pub fn get(&self, path: &str) -> Option<&ResourceHandle> {
        self.handles.iter().find(|h| h.path == path)
    }

    /// All handles in file set order.
    pub fn handles(&self) -> &[ResourceHandle] {
        &self.handles
    }

    /// Number of bundle resources.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the table holds no resources.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// What a call to [`Materializer::retire`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetireOutcome {
    /// References were released.
    Retired {
        /// Number of references released.
        released: usize,
    },
    /// Nothing to do.
    Noop(LifecycleError),
}

/// Issue/release counters for leak checks.
#[derive(Debug, Default)]
pub struct VfsMetrics {
    /// References ever issued.
    pub issued: AtomicU64,
    /// References released by retirement.
    pub released: AtomicU64,
}

struct StoredResource {
    generation: Generation,
    resource: Resource,
}

#[derive(Default)]
struct GenerationRecord {
    refs: Vec<EphemeralRef>,
    retired: bool,
}

#[derive(Default)]
struct VfsState {
    live: HashMap<EphemeralRef, StoredResource>,
    generations: HashMap<Generation, GenerationRecord>,
}

/// Owner of every ephemeral reference issued for previews.
#[derive(Default)]
pub struct Materializer {
    state: Mutex<VfsState>,
    metrics: Arc<VfsMetrics>,
}

impl Materializer {
    /// Create an empty materializer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue/release counters.
    pub fn metrics(&self) -> &Arc<VfsMetrics> {
        &self.metrics
    }

    /// Materialize every admitted file for `generation`.
    ///
    /// The whole table is built before this returns; nothing is deferred.
    #[tracing::instrument(skip(self, files), fields(files = files.len()))]
    pub fn materialize(
        &self,
        generation: Generation,
        files: &ValidatedFileSet,
    ) -> Result<ResourceTable, MaterializeError> {
        // Decode outside the lock so a bad file leaves no partial table behind
        let mut prepared = Vec::with_capacity(files.len());
        for file in files.files() {
            let bytes: Vec<u8> = match file.kind {
                ContentKind::Text => file.content.as_bytes().to_vec(),
                ContentKind::Binary => {
                    decode_binary(&file.content).map_err(|e| MaterializeError::Decode {
                        path: file.path.clone(),
                        reason: e.to_string(),
                    })?
                }
            };
            prepared.push((file.path.clone(), media_type_for(&file.extension), bytes));
        }

        let mut state = self.state.lock();
        let record = state.generations.entry(generation).or_default();
        if record.retired {
            return Err(MaterializeError::GenerationRetired { generation });
        }

        let mut handles = Vec::with_capacity(prepared.len());
        for (path, media_type, bytes) in prepared {
            let handle = insert(
                &mut state,
                generation,
                path,
                media_type,
                bytes,
                ResourceOrigin::Bundle,
            );
            handles.push(handle);
        }
        drop(state);

        self.metrics
            .issued
            .fetch_add(handles.len() as u64, Ordering::Relaxed);
        tracing::debug!(%generation, resources = handles.len(), "bundle materialized");

        Ok(ResourceTable {
            generation,
            handles,
        })
    }

    /// Materialize a preview-owned resource (runtime module or entry document)
    /// into an existing generation.
    pub fn materialize_runtime(
        &self,
        generation: Generation,
        path: &str,
        content: &str,
    ) -> Result<ResourceHandle, MaterializeError> {
        let media_type = extension_of(path)
            .map(|ext| media_type_for(&ext))
            .unwrap_or("application/octet-stream");

        let mut state = self.state.lock();
        let record = state.generations.entry(generation).or_default();
        if record.retired {
            return Err(MaterializeError::GenerationRetired { generation });
        }
        let handle = insert(
            &mut state,
            generation,
            path.to_string(),
            media_type,
            content.as_bytes().to_vec(),
            ResourceOrigin::Runtime,
        );
        drop(state);

        self.metrics.issued.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    /// Redeem a reference. Returns `None` once its generation is retired.
    pub fn redeem(&self, reference: &EphemeralRef) -> Option<Resource> {
        self.state
            .lock()
            .live
            .get(reference)
            .map(|stored| stored.resource.clone())
    }

    /// Generation a live reference belongs to.
    pub fn owner_of(&self, reference: &EphemeralRef) -> Option<Generation> {
        self.state
            .lock()
            .live
            .get(reference)
            .map(|stored| stored.generation)
    }

    /// Release every reference of `generation`, exactly once.
    ///
    /// Retiring an unknown or already-retired generation is a logged no-op.
    pub fn retire(&self, generation: Generation) -> RetireOutcome {
        let mut state = self.state.lock();
        let taken = match state.generations.get_mut(&generation) {
            None => Err(LifecycleError::UnknownGeneration(generation)),
            Some(record) if record.retired => Err(LifecycleError::AlreadyRetired(generation)),
            Some(record) => {
                record.retired = true;
                Ok(std::mem::take(&mut record.refs))
            }
        };
        let refs = match taken {
            Ok(refs) => refs,
            Err(err) => {
                drop(state);
                tracing::debug!(error = %err, "retire ignored");
                return RetireOutcome::Noop(err);
            }
        };

        let mut released = 0;
        for reference in &refs {
            if state.live.remove(reference).is_some() {
                released += 1;
            }
        }
        drop(state);

        self.metrics
            .released
            .fetch_add(released as u64, Ordering::Relaxed);
        tracing::info!(%generation, released, "generation retired");
        RetireOutcome::Retired { released }
    }

    /// Live references held by `generation`.
    pub fn live_references(&self, generation: Generation) -> usize {
        self.state
            .lock()
            .generations
            .get(&generation)
            .map(|r| r.refs.len())
            .unwrap_or(0)
    }

    /// Live references across all generations.
    pub fn total_live(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Whether `generation` has been retired.
    pub fn is_retired(&self, generation: Generation) -> bool {
        self.state
            .lock()
            .generations
            .get(&generation)
            .is_some_and(|r| r.retired)
    }
}

fn insert(
    state: &mut VfsState,
    generation: Generation,
    path: String,
    media_type: &'static str,
    bytes: Vec<u8>,
    origin: ResourceOrigin,
) -> ResourceHandle {
    let reference = EphemeralRef::mint(generation);
    let handle = ResourceHandle {
        path: path.clone(),
        media_type,
        reference: reference.clone(),
        generation,
        size_bytes: bytes.len(),
        digest: sha256_hex(&bytes),
        origin,
    };
    state.live.insert(
        reference.clone(),
        StoredResource {
            generation,
            resource: Resource {
                path,
                media_type,
                bytes: Arc::from(bytes),
            },
        },
    );
    state
        .generations
        .entry(generation)
        .or_default()
        .refs
        .push(reference);
    handle
}

/// Media type for a lower-cased extension.
pub fn media_type_for(extension: &str) -> &'static str {
    match extension {
        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "svg" => "image/svg+xml",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{validate, AdmissionLimits, AdmissionMode, FileEntry, FileSet};

    fn admitted() -> ValidatedFileSet {
        let set = FileSet::new(vec![
            FileEntry::new("manifest.json", r#"{"manifest_version": 3}"#),
            FileEntry::new("popup.js", "console.log('popup');"),
            FileEntry::new("icon.png", "iVBORw0KGgo="),
        ]);
        validate(&set, AdmissionMode::New, &AdmissionLimits::default()).unwrap()
    }

    #[test]
    fn materializes_every_file_with_media_types() {
        let vfs = Materializer::new();
        let table = vfs.materialize(Generation::new(1), &admitted()).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.get("popup.js").unwrap().media_type, "text/javascript");
        assert_eq!(table.get("manifest.json").unwrap().media_type, "application/json");

        let icon = table.get("icon.png").unwrap();
        assert_eq!(icon.media_type, "image/png");
        // base64 is decoded before it is stored
        assert_eq!(icon.size_bytes, 8);
        assert_eq!(vfs.total_live(), 3);
    }

    #[test]
    fn references_are_redeemable_and_scoped() {
        let vfs = Materializer::new();
        let table = vfs.materialize(Generation::new(7), &admitted()).unwrap();
        let handle = table.get("popup.js").unwrap();
        assert!(handle.reference.as_str().starts_with("blob:preview/7/"));

        let resource = vfs.redeem(&handle.reference).unwrap();
        assert_eq!(resource.text(), "console.log('popup');");
        assert_eq!(vfs.owner_of(&handle.reference), Some(Generation::new(7)));
    }

    #[test]
    fn retire_leaves_no_live_references() {
        let vfs = Materializer::new();
        let gen = Generation::new(1);
        let table = vfs.materialize(gen, &admitted()).unwrap();
        vfs.materialize_runtime(gen, "__preview__/shim.js", "// shim")
            .unwrap();
        assert_eq!(vfs.live_references(gen), 4);

        assert_eq!(vfs.retire(gen), RetireOutcome::Retired { released: 4 });
        assert_eq!(vfs.live_references(gen), 0);
        assert_eq!(vfs.total_live(), 0);
        for handle in table.handles() {
            assert!(vfs.redeem(&handle.reference).is_none());
        }
        let m = vfs.metrics();
        assert_eq!(
            m.issued.load(Ordering::Relaxed),
            m.released.load(Ordering::Relaxed)
        );
    }

    #[test]
    fn retire_twice_is_a_noop() {
        let vfs = Materializer::new();
        let gen = Generation::new(2);
        vfs.materialize(gen, &admitted()).unwrap();
        vfs.retire(gen);
        let live_after_first = vfs.total_live();

        assert_eq!(
            vfs.retire(gen),
            RetireOutcome::Noop(LifecycleError::AlreadyRetired(gen))
        );
        assert_eq!(vfs.total_live(), live_after_first);
        assert_eq!(vfs.metrics().released.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn retire_unknown_generation_is_a_noop() {
        let vfs = Materializer::new();
        assert_eq!(
            vfs.retire(Generation::new(99)),
            RetireOutcome::Noop(LifecycleError::UnknownGeneration(Generation::new(99)))
        );
    }

    #[test]
    fn generations_are_independent() {
        let vfs = Materializer::new();
        let a = vfs.materialize(Generation::new(1), &admitted()).unwrap();
        let b = vfs.materialize(Generation::new(2), &admitted()).unwrap();

        for (ha, hb) in a.handles().iter().zip(b.handles()) {
            assert_ne!(ha.reference, hb.reference);
            assert_eq!(ha.digest, hb.digest);
        }

        vfs.retire(Generation::new(1));
        for handle in b.handles() {
            assert!(vfs.redeem(&handle.reference).is_some());
        }
        assert_eq!(vfs.live_references(Generation::new(2)), 3);
    }

    #[test]
    fn retired_generation_refuses_new_resources() {
        let vfs = Materializer::new();
        let gen = Generation::new(5);
        vfs.materialize(gen, &admitted()).unwrap();
        vfs.retire(gen);

        assert!(matches!(
            vfs.materialize(gen, &admitted()),
            Err(MaterializeError::GenerationRetired { .. })
        ));
        assert!(vfs.materialize_runtime(gen, "doc.html", "<p></p>").is_err());
        assert!(vfs.is_retired(gen));
    }

    #[test]
    fn runtime_resources_are_tagged() {
        let vfs = Materializer::new();
        let handle = vfs
            .materialize_runtime(Generation::new(1), "__preview__/popup.html", "<html></html>")
            .unwrap();
        assert_eq!(handle.origin, ResourceOrigin::Runtime);
        assert_eq!(handle.media_type, "text/html");
    }
}
