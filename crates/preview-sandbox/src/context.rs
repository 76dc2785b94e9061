//! Isolated execution contexts.
//!
//! Each context is a tokio task that owns its globals and, for the page
//! context, the simulated page. It talks to the rest of the preview only
//! through its mailbox and the capability shim; nothing it owns is shared.
//!
//! On start the context loads its document's scripts in order. Every load
//! is checked against the document's allowlist and redeemed from the
//! [`Materializer`]; evaluation is delegated to a [`ScriptEngine`]. Ready is
//! signalled only after all three load phases complete.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use preview_error::CapabilityError;

use crate::assembler::{EntryDocument, LoadPhase};
use crate::bridge::ContextId;
use crate::error::AssemblyError;
use crate::shim::{ContextGlobals, ContextShim, PageSnapshot, ScriptInjection};
use crate::vfs::{EphemeralRef, Materializer};
use crate::Generation;

/// Mailbox depth for context commands.
const MAILBOX_CAPACITY: usize = 32;

/// A script redeemed and ready for evaluation.
#[derive(Debug, Clone)]
pub struct LoadedScript {
    /// Load phase.
    pub phase: LoadPhase,
    /// Bundle or runtime path.
    pub path: String,
    /// Reference it was loaded from.
    pub reference: EphemeralRef,
    /// Script source.
    pub source: String,
}

/// What a script can reach while it is evaluated.
pub struct ScriptScope<'a> {
    /// Context running the script.
    pub context: ContextId,
    /// Owning generation.
    pub generation: Generation,
    /// Capability surface for this context.
    pub shim: &'a ContextShim,
    /// Globals writable by scripts.
    pub globals: &'a ContextGlobals,
    /// The simulated page, in the page context only.
    pub page: Option<&'a mut PageSnapshot>,
}

/// Evaluates scripts inside a context.
///
/// Implementations must not block; long-running work should be spawned.
pub trait ScriptEngine: Send + Sync {
    /// Evaluate one script. An `Err` aborts the load with its message.
    fn evaluate(&self, script: &LoadedScript, scope: &mut ScriptScope<'_>) -> Result<(), String>;
}

/// Engine that accepts every script without running it.
#[derive(Debug, Default, Clone, Copy)]
pub struct InertEngine;

impl ScriptEngine for InertEngine {
    fn evaluate(&self, script: &LoadedScript, scope: &mut ScriptScope<'_>) -> Result<(), String> {
        tracing::trace!(
            context = %scope.context,
            path = %script.path,
            bytes = script.source.len(),
            "script accepted"
        );
        Ok(())
    }
}

pub(crate) enum ContextCommand {
    Inject {
        injection: ScriptInjection,
        reply: oneshot::Sender<Value>,
    },
}

/// Sending side of a context's mailbox.
#[derive(Clone)]
pub struct ContextLink {
    context: ContextId,
    generation: Generation,
    commands: mpsc::Sender<ContextCommand>,
}

impl fmt::Debug for ContextLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextLink")
            .field("context", &self.context)
            .field("generation", &self.generation)
            .finish()
    }
}

impl ContextLink {
    /// Run `injection` inside the context and return its result.
    ///
    /// Fails with `ContextDiscarded` when the context has gone away.
    pub async fn inject(&self, injection: ScriptInjection) -> Result<Value, CapabilityError> {
        let discarded = || CapabilityError::ContextDiscarded {
            generation: self.generation.get(),
        };
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ContextCommand::Inject { injection, reply })
            .await
            .map_err(|_| discarded())?;
        rx.await.map_err(|_| discarded())
    }
}

/// Receiving side of a context's mailbox, consumed by [`launch`].
pub struct ContextMailbox {
    commands: mpsc::Receiver<ContextCommand>,
}

/// Create a mailbox for a context that has not been launched yet.
pub fn mailbox(context: ContextId, generation: Generation) -> (ContextLink, ContextMailbox) {
    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    (
        ContextLink {
            context,
            generation,
            commands: tx,
        },
        ContextMailbox { commands: rx },
    )
}

/// Readiness signal sent once every phase has loaded.
#[derive(Debug, Clone, Serialize)]
pub struct ReadyReport {
    /// Context that became ready.
    pub context: ContextId,
    /// Owning generation.
    pub generation: Generation,
    /// Paths loaded, in order.
    pub loaded: Vec<String>,
}

/// What a context is launched with.
pub struct LaunchSpec {
    /// Document to load.
    pub document: EntryDocument,
    /// Capability view for the context.
    pub shim: ContextShim,
    /// Initial page state, for the page context.
    pub page: Option<PageSnapshot>,
}

/// Handle to a running context.
pub struct ContextHandle {
    context: ContextId,
    generation: Generation,
    link: ContextLink,
    ready: Option<oneshot::Receiver<Result<ReadyReport, AssemblyError>>>,
    task: JoinHandle<()>,
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("context", &self.context)
            .field("generation", &self.generation)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl ContextHandle {
    /// Context id.
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Owning generation.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Link to the context's mailbox.
    pub fn link(&self) -> &ContextLink {
        &self.link
    }

    /// Wait for the readiness signal. Only the first call observes it.
    pub async fn ready(&mut self) -> Result<ReadyReport, AssemblyError> {
        let crashed = AssemblyError::ContextCrashed {
            generation: self.generation,
        };
        match self.ready.take() {
            Some(rx) => rx.await.unwrap_or(Err(crashed)),
            None => Err(crashed),
        }
    }

    /// Whether the context task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the context.
    pub fn shutdown(&self) {
        self.task.abort();
        tracing::debug!(context = %self.context, generation = %self.generation, "context stopped");
    }
}

/// Start a context task.
pub fn launch(
    spec: LaunchSpec,
    mailbox: ContextMailbox,
    link: ContextLink,
    materializer: Arc<Materializer>,
    engine: Arc<dyn ScriptEngine>,
) -> ContextHandle {
    let context = spec.document.kind.context();
    let generation = spec.document.generation;
    let (ready_tx, ready_rx) = oneshot::channel();

    let task = tokio::spawn(run_context(spec, mailbox, materializer, engine, ready_tx));

    ContextHandle {
        context,
        generation,
        link,
        ready: Some(ready_rx),
        task,
    }
}

async fn run_context(
    spec: LaunchSpec,
    mut mailbox: ContextMailbox,
    materializer: Arc<Materializer>,
    engine: Arc<dyn ScriptEngine>,
    ready_tx: oneshot::Sender<Result<ReadyReport, AssemblyError>>,
) {
    let LaunchSpec {
        document,
        shim,
        mut page,
    } = spec;
    let context = document.kind.context();
    let globals = ContextGlobals::default();

    let loaded = load_document(&document, &shim, &globals, page.as_mut(), &materializer, engine.as_ref());
    let loaded = match loaded {
        Ok(loaded) => loaded,
        Err(e) => {
            tracing::warn!(%context, generation = %document.generation, error = %e, "context failed to load");
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    tracing::debug!(%context, generation = %document.generation, scripts = loaded.len(), "context ready");
    let _ = ready_tx.send(Ok(ReadyReport {
        context,
        generation: document.generation,
        loaded,
    }));

    while let Some(command) = mailbox.commands.recv().await {
        match command {
            ContextCommand::Inject { injection, reply } => {
                let value = match page.as_ref() {
                    Some(snapshot) => (injection.func)(snapshot, &injection.args),
                    None => Value::Null,
                };
                tracing::debug!(%context, injection = %injection.name, "injection ran");
                let _ = reply.send(value);
            }
        }
    }
}

fn load_document(
    document: &EntryDocument,
    shim: &ContextShim,
    globals: &ContextGlobals,
    mut page: Option<&mut PageSnapshot>,
    materializer: &Materializer,
    engine: &dyn ScriptEngine,
) -> Result<Vec<String>, AssemblyError> {
    let mut loaded = Vec::with_capacity(document.scripts.len());
    for tag in &document.scripts {
        if !document.policy.allows(&tag.reference) {
            return Err(AssemblyError::PolicyViolation {
                reference: tag.reference.to_string(),
            });
        }
        let resource = materializer
            .redeem(&tag.reference)
            .ok_or_else(|| AssemblyError::ResourceUnavailable {
                path: tag.path.clone(),
            })?;

        let script = LoadedScript {
            phase: tag.phase,
            path: tag.path.clone(),
            reference: tag.reference.clone(),
            source: resource.text(),
        };
        let mut scope = ScriptScope {
            context: document.kind.context(),
            generation: document.generation,
            shim,
            globals,
            page: page.as_deref_mut(),
        };
        engine
            .evaluate(&script, &mut scope)
            .map_err(|message| AssemblyError::ScriptFailed {
                path: tag.path.clone(),
                message,
            })?;
        loaded.push(tag.path.clone());
    }
    Ok(loaded)
}
