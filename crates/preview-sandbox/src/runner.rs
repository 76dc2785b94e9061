//! Preview runner: the generation lifecycle behind a [`PreviewHandle`].
//!
//! A rebuild admits and materializes the file set, assembles entry
//! documents, launches the isolated contexts and waits for their readiness
//! signal. Only then is the new generation published as live and the
//! previous one torn down. A failure at any step tears down the new
//! generation alone; the previous one keeps serving.
//!
//! The live generation is published through [`ArcSwapOption`] so readers
//! (`send`, `inspect`) never wait on a rebuild in progress.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use preview_error::CapabilityError;

use crate::admission::{merge_delta, validate, AdmissionLimits, AdmissionMode, FileSet, ValidatedFileSet};
use crate::assembler::{assemble, AssembledPreview, DocumentKind};
use crate::audit::{CapabilityEvent, CapabilityLog, CapabilityObserver, FanoutObserver, DEFAULT_LOG_CAPACITY};
use crate::bridge::{Bridge, ContextId, MessageListener, DEFAULT_RESPONSE_TIMEOUT};
use crate::context::{self, ContextHandle, InertEngine, LaunchSpec, ScriptEngine};
use crate::error::{AssemblyError, PreviewError};
use crate::shim::{
    CapabilityShim, ContextShim, HostAttestation, PageSnapshot, ShimMode, ShimParts, TabInfo,
    SIMULATED_TAB_ID, SIMULATED_WINDOW_ID,
};
use crate::storage::{CapabilityStorage, StorageConfig};
use crate::vfs::{Materializer, ResourceHandle, ResourceTable, RetireOutcome};
use crate::{Generation, HostCapabilities};

/// Default readiness timeout for a freshly launched generation.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// What happens to extension storage when a preview is rebuilt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatePersistence {
    /// Every generation starts with empty storage.
    #[default]
    Reset,
    /// The new generation starts from a copy of the previous one's storage.
    CarryForward,
}

impl FromStr for StatePersistence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reset" => Ok(Self::Reset),
            "carry_forward" | "carry-forward" => Ok(Self::CarryForward),
            other => Err(format!(
                "unknown state persistence '{other}' (expected 'reset' or 'carry_forward')"
            )),
        }
    }
}

/// Runner settings.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Admission ceilings.
    pub limits: AdmissionLimits,
    /// How long a message waits for a listener response. Also bounds host
    /// pass-through and injection calls.
    pub response_timeout: Duration,
    /// How long a new generation may take to become ready.
    pub ready_timeout: Duration,
    /// Storage behaviour across rebuilds.
    pub state_persistence: StatePersistence,
    /// Capability events retained per preview.
    pub capability_log_capacity: usize,
    /// Storage quotas.
    pub storage: StorageConfig,
    /// The simulated page.
    pub page: PageSnapshot,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            limits: AdmissionLimits::default(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            state_persistence: StatePersistence::default(),
            capability_log_capacity: DEFAULT_LOG_CAPACITY,
            storage: StorageConfig::default(),
            page: PageSnapshot::default(),
        }
    }
}

/// One built, ready generation.
struct LiveGeneration {
    generation: Generation,
    files: ValidatedFileSet,
    table: ResourceTable,
    assembled: AssembledPreview,
    shim: CapabilityShim,
    bridge: Bridge,
    contexts: Vec<ContextHandle>,
    materializer: Arc<Materializer>,
    torn_down: AtomicBool,
}

impl LiveGeneration {
    /// Close contexts, discard pending messages and retire resources.
    /// Only the first call does anything.
    fn teardown(&self) -> bool {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            tracing::debug!(generation = %self.generation, "teardown already done");
            return false;
        }
        for context in &self.contexts {
            context.shutdown();
        }
        let discarded = self.bridge.close();
        let released = match self.materializer.retire(self.generation) {
            RetireOutcome::Retired { released } => released,
            RetireOutcome::Noop(_) => 0,
        };
        tracing::info!(generation = %self.generation, discarded, released, "generation torn down");
        true
    }
}

impl Drop for LiveGeneration {
    fn drop(&mut self) {
        self.teardown();
    }
}

struct Session {
    live: ArcSwapOption<LiveGeneration>,
    rebuild_lock: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
    last_generation: AtomicU64,
    ui_listeners: Mutex<Vec<Arc<dyn MessageListener>>>,
    log: Arc<CapabilityLog>,
    observer: Arc<dyn CapabilityObserver>,
}

/// Handle to one preview session. Cheap to clone.
#[derive(Clone)]
pub struct PreviewHandle {
    session: Arc<Session>,
}

impl fmt::Debug for PreviewHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreviewHandle")
            .field("generation", &self.generation())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl PreviewHandle {
    /// Live generation, or `None` once disposed.
    pub fn generation(&self) -> Option<Generation> {
        self.session.live.load_full().map(|live| live.generation)
    }

    /// Whether [`PreviewRunner::dispose`] has run.
    pub fn is_disposed(&self) -> bool {
        self.session.disposed.load(Ordering::Acquire)
    }

    /// Send `payload` from the UI to `target` in the live generation and
    /// wait for the first response.
    pub async fn send(&self, target: ContextId, payload: Value) -> Result<Value, CapabilityError> {
        let live = self.live_or_discarded()?;
        live.bridge.send(ContextId::Ui, target, payload).recv().await
    }

    /// Register a UI listener. It stays registered across rebuilds.
    pub fn on_message(&self, listener: Arc<dyn MessageListener>) {
        let mut listeners = self.session.ui_listeners.lock();
        if let Some(live) = self.session.live.load_full() {
            live.bridge.on_deliver(ContextId::Ui, listener.clone());
        }
        listeners.push(listener);
    }

    /// Resolve a pending message of the live generation.
    pub fn resolve(&self, id: u64, response: Value) -> Result<(), CapabilityError> {
        self.live_or_discarded()?.bridge.resolve(id, response)
    }

    /// The capability surface of `context` in the live generation.
    pub fn capabilities(&self, context: ContextId) -> Option<ContextShim> {
        let live = self.session.live.load_full()?;
        if context == ContextId::Page && live.assembled.page.is_none() {
            return None;
        }
        Some(live.shim.for_context(context))
    }

    /// Rendered entry documents of the live generation.
    pub fn documents(&self) -> Vec<(DocumentKind, String)> {
        let Some(live) = self.session.live.load_full() else {
            return Vec::new();
        };
        let mut documents = vec![(DocumentKind::Popup, live.assembled.popup.render())];
        if let Some(page) = &live.assembled.page {
            documents.push((DocumentKind::Page, page.render()));
        }
        documents
    }

    /// Bundle resources of the live generation.
    pub fn resources(&self) -> Vec<ResourceHandle> {
        self.session
            .live
            .load_full()
            .map(|live| live.table.handles().to_vec())
            .unwrap_or_default()
    }

    fn live_or_discarded(&self) -> Result<Arc<LiveGeneration>, CapabilityError> {
        self.session
            .live
            .load_full()
            .ok_or(CapabilityError::ContextDiscarded {
                generation: self.session.last_generation.load(Ordering::Acquire),
            })
    }
}

/// Read-only diagnostics for a preview.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewInspection {
    /// Live generation, if any.
    pub live_generation: Option<Generation>,
    /// Whether the preview was disposed.
    pub disposed: bool,
    /// Shim mode of the live generation.
    pub mode: Option<ShimMode>,
    /// Bundle resources materialized for the live generation.
    pub resource_count: usize,
    /// References the live generation holds, runtime resources included.
    pub live_references: usize,
    /// Bundle resources.
    pub resources: Vec<ResourceHandle>,
    /// Messages awaiting a response.
    pub pending_message_count: usize,
    /// Script paths of the popup, in load order.
    pub popup_scripts: Vec<String>,
    /// Script paths of the page context, if any.
    pub page_scripts: Option<Vec<String>>,
    /// Assembly warnings.
    pub warnings: Vec<String>,
    /// Keys in the live generation's storage.
    pub storage_keys: Vec<String>,
    /// Recent capability calls, oldest first.
    pub capability_log: Vec<CapabilityEvent>,
}

/// Builds and manages preview sessions.
pub struct PreviewRunner {
    config: RunnerConfig,
    materializer: Arc<Materializer>,
    engine: Arc<dyn ScriptEngine>,
    host: Option<Arc<dyn HostCapabilities>>,
    observer: Option<Arc<dyn CapabilityObserver>>,
    next_generation: AtomicU64,
}

impl fmt::Debug for PreviewRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreviewRunner")
            .field("config", &self.config)
            .field("host", &self.host.is_some())
            .finish_non_exhaustive()
    }
}

impl PreviewRunner {
    /// Create a runner that evaluates scripts with [`InertEngine`].
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            materializer: Arc::new(Materializer::new()),
            engine: Arc::new(InertEngine),
            host: None,
            observer: None,
            next_generation: AtomicU64::new(0),
        }
    }

    /// Use `engine` to evaluate scripts.
    pub fn with_engine(mut self, engine: Arc<dyn ScriptEngine>) -> Self {
        self.engine = engine;
        self
    }

    /// Run inside a genuine host. Capability calls are forwarded to `host`.
    pub fn with_host(mut self, host: Arc<dyn HostCapabilities>) -> Self {
        self.host = Some(host);
        self
    }

    /// Also deliver capability events to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn CapabilityObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Runner settings.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// The materializer shared by every session of this runner.
    pub fn materializer(&self) -> &Arc<Materializer> {
        &self.materializer
    }

    /// Admit, materialize and assemble a new preview.
    #[tracing::instrument(skip_all, fields(mode = ?mode, files = file_set.files.len()))]
    pub async fn generate(&self, file_set: &FileSet, mode: AdmissionMode) -> Result<PreviewHandle, PreviewError> {
        let log = Arc::new(CapabilityLog::new(self.config.capability_log_capacity));
        let observer: Arc<dyn CapabilityObserver> = match &self.observer {
            Some(extra) => Arc::new(FanoutObserver::new(vec![
                log.clone() as Arc<dyn CapabilityObserver>,
                extra.clone(),
            ])),
            None => log.clone(),
        };
        let handle = PreviewHandle {
            session: Arc::new(Session {
                live: ArcSwapOption::empty(),
                rebuild_lock: tokio::sync::Mutex::new(()),
                disposed: AtomicBool::new(false),
                last_generation: AtomicU64::new(0),
                ui_listeners: Mutex::new(Vec::new()),
                log,
                observer,
            }),
        };
        self.rebuild(&handle, file_set, mode).await
    }

    /// Replace the live generation of `handle` with one built from `file_set`.
    ///
    /// In `Edit` mode the file set is a delta merged over the live bundle.
    /// On failure the previous generation stays live and untouched.
    #[tracing::instrument(skip_all, fields(mode = ?mode, files = file_set.files.len()))]
    pub async fn rebuild(
        &self,
        handle: &PreviewHandle,
        file_set: &FileSet,
        mode: AdmissionMode,
    ) -> Result<PreviewHandle, PreviewError> {
        let session = &handle.session;
        let _guard = session.rebuild_lock.lock().await;
        if session.disposed.load(Ordering::Acquire) {
            return Err(PreviewError::Disposed);
        }

        let previous = session.live.load_full();
        let validated = self.admit(file_set, mode, previous.as_deref()).map_err(|e| {
            tracing::warn!(error = %e, code = e.code(), "file set refused");
            e
        })?;

        let next = self.build(session, validated, previous.as_deref()).await?;
        let generation = next.generation;

        {
            // Listeners added while the generation was starting
            let listeners = session.ui_listeners.lock();
            let installed = next.bridge.listener_count(ContextId::Ui);
            for listener in listeners.iter().skip(installed) {
                next.bridge.on_deliver(ContextId::Ui, listener.clone());
            }
            session.live.store(Some(next));
            session
                .last_generation
                .store(generation.get(), Ordering::Release);
        }

        if let Some(previous) = previous {
            previous.teardown();
        }
        tracing::info!(%generation, "generation live");
        Ok(handle.clone())
    }

    /// Tear down the live generation. Later calls do nothing.
    pub async fn dispose(&self, handle: &PreviewHandle) {
        let session = &handle.session;
        let _guard = session.rebuild_lock.lock().await;
        if session.disposed.swap(true, Ordering::AcqRel) {
            tracing::debug!("preview already disposed");
            return;
        }
        if let Some(live) = session.live.swap(None) {
            live.teardown();
        }
        tracing::info!("preview disposed");
    }

    /// Diagnostics for `handle`.
    pub fn inspect(&self, handle: &PreviewHandle) -> PreviewInspection {
        let session = &handle.session;
        let live = session.live.load_full();
        let disposed = session.disposed.load(Ordering::Acquire);
        let capability_log = session.log.snapshot();

        let Some(live) = live else {
            return PreviewInspection {
                live_generation: None,
                disposed,
                mode: None,
                resource_count: 0,
                live_references: 0,
                resources: Vec::new(),
                pending_message_count: 0,
                popup_scripts: Vec::new(),
                page_scripts: None,
                warnings: Vec::new(),
                storage_keys: Vec::new(),
                capability_log,
            };
        };

        PreviewInspection {
            live_generation: Some(live.generation),
            disposed,
            mode: Some(live.shim.mode()),
            resource_count: live.table.len(),
            live_references: self.materializer.live_references(live.generation),
            resources: live.table.handles().to_vec(),
            pending_message_count: live.bridge.pending_count(),
            popup_scripts: owned_paths(live.assembled.popup.script_paths()),
            page_scripts: live
                .assembled
                .page
                .as_ref()
                .map(|page| owned_paths(page.script_paths())),
            warnings: live.assembled.warnings.iter().map(|w| w.to_string()).collect(),
            storage_keys: live.shim.storage_snapshot().into_keys().collect(),
            capability_log,
        }
    }

    fn admit(
        &self,
        file_set: &FileSet,
        mode: AdmissionMode,
        previous: Option<&LiveGeneration>,
    ) -> Result<ValidatedFileSet, PreviewError> {
        let limits = &self.config.limits;
        let validated = match (mode, previous) {
            (AdmissionMode::Edit, Some(previous)) => {
                validate(file_set, AdmissionMode::Edit, limits)?;
                let merged = merge_delta(&previous.files, file_set);
                validate(&merged, AdmissionMode::Edit, limits)?
            }
            (mode, _) => validate(file_set, mode, limits)?,
        };
        Ok(validated)
    }

    async fn build(
        &self,
        session: &Session,
        files: ValidatedFileSet,
        previous: Option<&LiveGeneration>,
    ) -> Result<Arc<LiveGeneration>, PreviewError> {
        let generation = Generation::new(self.next_generation.fetch_add(1, Ordering::AcqRel) + 1);

        let table = match self.materializer.materialize(generation, &files) {
            Ok(table) => table,
            Err(e) => {
                self.materializer.retire(generation);
                return Err(e.into());
            }
        };

        let descriptor = files.descriptor().cloned().unwrap_or_default();
        let assembled = match assemble(&table, &descriptor, &self.materializer, &self.config.page) {
            Ok(assembled) => assembled,
            Err(e) => {
                tracing::warn!(%generation, error = %e, "assembly failed");
                self.materializer.retire(generation);
                return Err(e.into());
            }
        };

        let bridge = Bridge::new(generation, self.config.response_timeout);
        bridge.attach(ContextId::Ui);
        bridge.attach(ContextId::Popup);
        for listener in session.ui_listeners.lock().iter() {
            bridge.on_deliver(ContextId::Ui, listener.clone());
        }

        let storage = match (self.config.state_persistence, previous) {
            (StatePersistence::CarryForward, Some(previous)) => {
                let snapshot = previous.shim.storage_snapshot();
                tracing::debug!(%generation, keys = snapshot.len(), "storage carried forward");
                CapabilityStorage::seeded(self.config.storage.clone(), snapshot)
            }
            _ => CapabilityStorage::new(self.config.storage.clone()),
        };

        let page_mailbox = assembled.page.as_ref().map(|_| {
            bridge.attach(ContextId::Page);
            context::mailbox(ContextId::Page, generation)
        });

        let shim = CapabilityShim::new(ShimParts {
            generation,
            identity: assembled.identity.clone(),
            attestation: self
                .host
                .as_ref()
                .map(|host| HostAttestation::new(assembled.identity.clone(), host.clone())),
            storage,
            bridge: bridge.clone(),
            page: page_mailbox.as_ref().map(|(link, _)| link.clone()),
            tab: TabInfo {
                id: SIMULATED_TAB_ID,
                window_id: SIMULATED_WINDOW_ID,
                url: self.config.page.url.clone(),
                title: self.config.page.title.clone(),
                active: true,
            },
            observer: session.observer.clone(),
            call_timeout: self.config.response_timeout,
        });

        let mut contexts = Vec::with_capacity(2);
        let (link, mailbox) = context::mailbox(ContextId::Popup, generation);
        contexts.push(context::launch(
            LaunchSpec {
                document: assembled.popup.clone(),
                shim: shim.for_context(ContextId::Popup),
                page: None,
            },
            mailbox,
            link,
            self.materializer.clone(),
            self.engine.clone(),
        ));
        if let (Some(document), Some((link, mailbox))) = (assembled.page.clone(), page_mailbox) {
            contexts.push(context::launch(
                LaunchSpec {
                    document,
                    shim: shim.for_context(ContextId::Page),
                    page: Some(self.config.page.clone()),
                },
                mailbox,
                link,
                self.materializer.clone(),
                self.engine.clone(),
            ));
        }

        let mut live = LiveGeneration {
            generation,
            files,
            table,
            assembled,
            shim,
            bridge,
            contexts,
            materializer: self.materializer.clone(),
            torn_down: AtomicBool::new(false),
        };

        // Dropping `live` on the error path tears the new generation down
        await_ready(&mut live.contexts, generation, self.config.ready_timeout).await?;
        Ok(Arc::new(live))
    }
}

async fn await_ready(
    contexts: &mut [ContextHandle],
    generation: Generation,
    timeout: Duration,
) -> Result<(), AssemblyError> {
    let all_ready = async {
        for context in contexts.iter_mut() {
            let report = context.ready().await?;
            tracing::debug!(%generation, context = %report.context, scripts = report.loaded.len(), "context ready");
        }
        Ok::<_, AssemblyError>(())
    };
    match tokio::time::timeout(timeout, all_ready).await {
        Ok(result) => result,
        Err(_elapsed) => Err(AssemblyError::ReadinessTimeout {
            generation,
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

fn owned_paths(paths: Vec<&str>) -> Vec<String> {
    paths.into_iter().map(str::to_string).collect()
}
