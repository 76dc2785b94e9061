//! Message bridge between the UI, the popup context and the page context.
//!
//! Every message gets a correlation id and an entry in the pending table.
//! The first response for an id is delivered to the sender; any later
//! response is rejected with [`CapabilityError::AlreadyResolved`] and logged.
//!
//! Each attached receiver has exactly one delivery task fed by an unbounded
//! FIFO channel, so messages reach a receiver's listeners in the order they
//! were sent. There is no ordering between different receivers.
//!
//! A bridge belongs to one generation. Closing it fails every pending message
//! with [`CapabilityError::ContextDiscarded`], so nobody waits forever on a
//! torn-down preview.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;

use preview_error::CapabilityError;

use crate::Generation;

/// Default time a sender waits for a response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

/// A party that can send and receive bridge messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextId {
    /// The surrounding preview UI.
    Ui,
    /// The isolated context running the popup document.
    Popup,
    /// The simulated page context running content scripts.
    Page,
}

impl ContextId {
    /// Lower-case name, as used in logs and error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ui => "ui",
            Self::Popup => "popup",
            Self::Page => "page",
        }
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message in flight.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    /// Correlation id.
    pub id: u64,
    /// Generation of the bridge that carried it.
    pub generation: Generation,
    /// Sender.
    pub from: ContextId,
    /// Receiver.
    pub to: ContextId,
    /// Message body.
    pub payload: Value,
}

/// A response that will be produced later.
pub type DeferredReply = Pin<Box<dyn Future<Output = Option<Value>> + Send + 'static>>;

/// What a listener does with a message.
pub enum ListenerReply {
    /// Not interested; the next listener gets a chance.
    Ignore,
    /// Answer immediately.
    Respond(Value),
    /// Answer later. `None` means the listener decided not to answer.
    Deferred(DeferredReply),
}

impl fmt::Debug for ListenerReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ignore => f.write_str("Ignore"),
            Self::Respond(v) => f.debug_tuple("Respond").field(v).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// A registered message handler.
pub trait MessageListener: Send + Sync {
    /// Handle one delivered message.
    fn on_message(&self, envelope: &Envelope) -> ListenerReply;
}

impl<F> MessageListener for F
where
    F: Fn(&Envelope) -> ListenerReply + Send + Sync,
{
    fn on_message(&self, envelope: &Envelope) -> ListenerReply {
        self(envelope)
    }
}

type ReplySender = oneshot::Sender<Result<Value, CapabilityError>>;
type ListenerList = Arc<Mutex<Vec<Arc<dyn MessageListener>>>>;

struct PendingEntry {
    from: ContextId,
    to: ContextId,
    tx: ReplySender,
}

struct Receiver {
    queue: mpsc::UnboundedSender<Envelope>,
    listeners: ListenerList,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct BridgeState {
    pending: HashMap<u64, PendingEntry>,
    receivers: HashMap<ContextId, Receiver>,
    deferred: Vec<AbortHandle>,
    closed: bool,
}

struct BridgeInner {
    generation: Generation,
    response_timeout: Duration,
    next_id: AtomicU64,
    state: Mutex<BridgeState>,
}

/// Correlating message router for one generation.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("generation", &self.inner.generation)
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// The sender's side of a message: its correlation id and eventual response.
#[derive(Debug)]
pub struct PendingReply {
    id: u64,
    target: ContextId,
    generation: Generation,
    timeout: Duration,
    deadline: Instant,
    rx: oneshot::Receiver<Result<Value, CapabilityError>>,
    bridge: Weak<BridgeInner>,
}

impl PendingReply {
    /// Correlation id of the message.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the response.
    ///
    /// Resolves to [`CapabilityError::NoReceiver`] when nobody answers within
    /// the bridge's response timeout, counted from the send, and to
    /// [`CapabilityError::ContextDiscarded`] when the bridge is closed first.
    pub async fn recv(self) -> Result<Value, CapabilityError> {
        match tokio::time::timeout_at(self.deadline, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_closed)) => Err(CapabilityError::ContextDiscarded {
                generation: self.generation.get(),
            }),
            Err(_elapsed) => {
                if let Some(inner) = self.bridge.upgrade() {
                    inner.state.lock().pending.remove(&self.id);
                }
                tracing::debug!(
                    id = self.id,
                    target = %self.target,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "no response before timeout"
                );
                Err(CapabilityError::NoReceiver {
                    target: self.target.to_string(),
                })
            }
        }
    }
}

impl Bridge {
    /// Create a bridge for `generation`.
    pub fn new(generation: Generation, response_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                generation,
                response_timeout,
                next_id: AtomicU64::new(1),
                state: Mutex::new(BridgeState::default()),
            }),
        }
    }

    /// Owning generation.
    pub fn generation(&self) -> Generation {
        self.inner.generation
    }

    /// Configured response timeout.
    pub fn response_timeout(&self) -> Duration {
        self.inner.response_timeout
    }

    /// Start delivering messages to `context`. Attaching twice is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(&self, context: ContextId) {
        let mut state = self.inner.state.lock();
        if state.closed || state.receivers.contains_key(&context) {
            return;
        }
        let (queue, rx) = mpsc::unbounded_channel();
        let listeners: ListenerList = Arc::default();
        let task = tokio::spawn(deliver_loop(
            Arc::downgrade(&self.inner),
            context,
            rx,
            listeners.clone(),
        ));
        state.receivers.insert(
            context,
            Receiver {
                queue,
                listeners,
                task,
            },
        );
        tracing::debug!(generation = %self.inner.generation, %context, "receiver attached");
    }

    /// Whether `context` is attached.
    pub fn is_attached(&self, context: ContextId) -> bool {
        self.inner.state.lock().receivers.contains_key(&context)
    }

    /// Register a listener on `context`, attaching it if needed.
    pub fn on_deliver(&self, context: ContextId, listener: Arc<dyn MessageListener>) {
        self.attach(context);
        let state = self.inner.state.lock();
        if let Some(receiver) = state.receivers.get(&context) {
            receiver.listeners.lock().push(listener);
        }
    }

    /// Number of listeners registered on `context`.
    pub fn listener_count(&self, context: ContextId) -> usize {
        self.inner
            .state
            .lock()
            .receivers
            .get(&context)
            .map(|r| r.listeners.lock().len())
            .unwrap_or(0)
    }

    /// Send `payload` from `from` to `to`.
    ///
    /// Never blocks. A target that is not attached, or a closed bridge, is
    /// reported through the returned [`PendingReply`].
    pub fn send(&self, from: ContextId, to: ContextId, payload: Value) -> PendingReply {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let reply = PendingReply {
            id,
            target: to,
            generation: self.inner.generation,
            timeout: self.inner.response_timeout,
            deadline: Instant::now() + self.inner.response_timeout,
            rx,
            bridge: Arc::downgrade(&self.inner),
        };

        let mut state = self.inner.state.lock();
        if state.closed {
            let _ = tx.send(Err(CapabilityError::ContextDiscarded {
                generation: self.inner.generation.get(),
            }));
            return reply;
        }
        let Some(queue) = state.receivers.get(&to).map(|r| r.queue.clone()) else {
            drop(state);
            tracing::debug!(id, %from, %to, "target not attached");
            let _ = tx.send(Err(CapabilityError::NoReceiver {
                target: to.to_string(),
            }));
            return reply;
        };
        state.pending.insert(id, PendingEntry { from, to, tx });

        let envelope = Envelope {
            id,
            generation: self.inner.generation,
            from,
            to,
            payload,
        };
        if queue.send(envelope).is_err() {
            if let Some(entry) = state.pending.remove(&id) {
                let _ = entry.tx.send(Err(CapabilityError::NoReceiver {
                    target: to.to_string(),
                }));
            }
        }
        reply
    }

    /// Deliver a response for correlation id `id`.
    ///
    /// Only the first resolve for an id reaches the sender. Later ones are
    /// rejected and logged.
    pub fn resolve(&self, id: u64, response: Value) -> Result<(), CapabilityError> {
        self.inner.complete(id, Ok(response))
    }

    /// Messages still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Whether [`Bridge::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Fail every pending message with `ContextDiscarded` and stop all
    /// delivery tasks and deferred replies. Returns the number of messages
    /// discarded.
    pub fn close(&self) -> usize {
        let (pending, receivers, deferred) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return 0;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.receivers),
                std::mem::take(&mut state.deferred),
            )
        };

        for receiver in receivers.into_values() {
            receiver.task.abort();
        }
        for task in deferred {
            task.abort();
        }
        let discarded = pending.len();
        for (_, entry) in pending {
            let _ = entry.tx.send(Err(CapabilityError::ContextDiscarded {
                generation: self.inner.generation.get(),
            }));
        }
        tracing::debug!(generation = %self.inner.generation, discarded, "bridge closed");
        discarded
    }
}

impl BridgeInner {
    fn complete(&self, id: u64, result: Result<Value, CapabilityError>) -> Result<(), CapabilityError> {
        let entry = self.state.lock().pending.remove(&id);
        match entry {
            Some(entry) => {
                tracing::trace!(id, from = %entry.from, to = %entry.to, "message resolved");
                let _ = entry.tx.send(result);
                Ok(())
            }
            None if id != 0 && id < self.next_id.load(Ordering::Relaxed) => {
                tracing::warn!(
                    generation = %self.generation,
                    id,
                    "duplicate response discarded"
                );
                Err(CapabilityError::AlreadyResolved { id })
            }
            None => Err(CapabilityError::UnknownCorrelation { id }),
        }
    }
}

/// Delivery task for one receiver. Listeners run in registration order.
async fn deliver_loop(
    bridge: Weak<BridgeInner>,
    context: ContextId,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    listeners: ListenerList,
) {
    while let Some(envelope) = rx.recv().await {
        let Some(inner) = bridge.upgrade() else {
            break;
        };
        let current: Vec<Arc<dyn MessageListener>> = listeners.lock().clone();

        let mut handled = false;
        for listener in current {
            match listener.on_message(&envelope) {
                ListenerReply::Ignore => {}
                ListenerReply::Respond(value) => {
                    handled = true;
                    let _ = inner.complete(envelope.id, Ok(value));
                }
                ListenerReply::Deferred(reply) => {
                    handled = true;
                    let weak = bridge.clone();
                    let id = envelope.id;
                    let mut state = inner.state.lock();
                    if state.closed {
                        continue;
                    }
                    state.deferred.retain(|task| !task.is_finished());
                    let task = tokio::spawn(async move {
                        let Some(value) = reply.await else {
                            return;
                        };
                        if let Some(inner) = weak.upgrade() {
                            let _ = inner.complete(id, Ok(value));
                        }
                    });
                    state.deferred.push(task.abort_handle());
                }
            }
        }

        if !handled {
            let _ = inner.complete(
                envelope.id,
                Err(CapabilityError::NoReceiver {
                    target: context.to_string(),
                }),
            );
        }
    }
}
