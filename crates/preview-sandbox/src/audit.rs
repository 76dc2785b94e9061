//! Capability call instrumentation.
//!
//! Every call made through the capability shim produces a
//! [`CapabilityEvent`] containing:
//! - Generation and calling context
//! - The operation, with storage keys but never stored values
//! - SHA-256 hashes of message payloads (never raw payloads)
//! - Duration and outcome
//!
//! The [`CapabilityObserver`] trait allows pluggable backends. Observers see
//! calls after the fact and cannot change their result.
//! [`CapabilityLog`] keeps a bounded window for inspection,
//! [`JsonLinesObserver`] writes newline-delimited JSON to any `Write`.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::bridge::ContextId;
use crate::shim::ShimMode;
use crate::Generation;

/// Default number of events retained by a [`CapabilityLog`].
pub const DEFAULT_LOG_CAPACITY: usize = 256;

/// One capability call, as seen by observers.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityEvent {
    /// Per-generation sequence number.
    pub seq: u64,
    /// When the call started.
    pub timestamp: DateTime<Utc>,
    /// Generation whose shim served the call.
    pub generation: Generation,
    /// Context the call came from.
    pub context: ContextId,
    /// Whether the call was served in-memory or forwarded to a host.
    pub mode: ShimMode,
    /// The operation.
    pub call: CapabilityCall,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// Result of the call.
    pub outcome: CallOutcome,
}

/// The capability operation that was invoked.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
#[non_exhaustive]
pub enum CapabilityCall {
    /// `storage.get`.
    StorageGet {
        /// Key read.
        key: String,
    },
    /// `storage.set`. The value is not recorded, only its size.
    StorageSet {
        /// Key written.
        key: String,
        /// Serialized size of the value.
        size_bytes: usize,
    },
    /// `storage.remove`.
    StorageRemove {
        /// Key removed.
        key: String,
    },
    /// `storage.keys`.
    StorageKeys,
    /// `storage.clear`.
    StorageClear,
    /// `runtime.sendMessage`.
    SendMessage {
        /// SHA-256 of the serialized payload.
        payload_hash: String,
    },
    /// `runtime.onMessage.addListener`.
    AddListener,
    /// `tabs.query`.
    TabsQuery,
    /// `tabs.sendMessage`.
    TabsSendMessage {
        /// Target tab.
        tab_id: i64,
        /// SHA-256 of the serialized payload.
        payload_hash: String,
    },
    /// `scripting.executeScript`.
    ExecuteScript {
        /// Target tab.
        tab_id: i64,
        /// Name of the injected function.
        injection: String,
    },
}

/// Outcome of a capability call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum CallOutcome {
    /// The call succeeded.
    Success,
    /// The call failed with a capability error.
    Error {
        /// Stable error code.
        code: String,
        /// Error message.
        message: String,
    },
}

impl CallOutcome {
    /// Build an outcome from a call result.
    pub fn of<T>(result: &Result<T, preview_error::CapabilityError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(e) => Self::Error {
                code: e.code().to_string(),
                message: e.to_string(),
            },
        }
    }

    /// Whether the call succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Timing helper used while a call is in flight.
pub(crate) struct CallTimer {
    timestamp: DateTime<Utc>,
    start: Instant,
}

impl CallTimer {
    pub(crate) fn start() -> Self {
        Self {
            timestamp: Utc::now(),
            start: Instant::now(),
        }
    }

    pub(crate) fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub(crate) fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Trait for capability instrumentation backends.
pub trait CapabilityObserver: Send + Sync {
    /// Observe one completed call.
    fn record(&self, event: &CapabilityEvent);
}

/// Observer that discards everything.
pub struct NoopObserver;

impl CapabilityObserver for NoopObserver {
    fn record(&self, _event: &CapabilityEvent) {}
}

/// Observer that emits each call as a `tracing` event.
pub struct TracingObserver;

impl CapabilityObserver for TracingObserver {
    fn record(&self, event: &CapabilityEvent) {
        match &event.outcome {
            CallOutcome::Success => tracing::debug!(
                generation = %event.generation,
                context = %event.context,
                call = ?event.call,
                duration_ms = event.duration_ms,
                "capability call"
            ),
            CallOutcome::Error { code, message } => tracing::info!(
                generation = %event.generation,
                context = %event.context,
                call = ?event.call,
                code = %code,
                error = %message,
                "capability call failed"
            ),
        }
    }
}

/// Bounded in-memory window of recent calls, read by `inspect`.
pub struct CapabilityLog {
    capacity: usize,
    entries: Mutex<VecDeque<CapabilityEvent>>,
}

impl CapabilityLog {
    /// Create a log that keeps the most recent `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.clamp(1, 1024))),
        }
    }

    /// Copy of the retained events, oldest first.
    pub fn snapshot(&self) -> Vec<CapabilityEvent> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for CapabilityLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl CapabilityObserver for CapabilityLog {
    fn record(&self, event: &CapabilityEvent) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(event.clone());
    }
}

/// Writes events as newline-delimited JSON to a `Write` sink.
pub struct JsonLinesObserver<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesObserver<W> {
    /// Create a new JSON lines observer writing to the given sink.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Recover the sink.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> CapabilityObserver for JsonLinesObserver<W> {
    fn record(&self, event: &CapabilityEvent) {
        let mut line = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize capability event");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock();
        if let Err(e) = writer.write_all(line.as_bytes()) {
            tracing::warn!(error = %e, "failed to write capability event");
        }
        let _ = writer.flush();
    }
}

/// Forwards every event to several observers in order.
pub struct FanoutObserver {
    observers: Vec<Arc<dyn CapabilityObserver>>,
}

impl FanoutObserver {
    /// Create a fan-out over the given observers.
    pub fn new(observers: Vec<Arc<dyn CapabilityObserver>>) -> Self {
        Self { observers }
    }
}

impl CapabilityObserver for FanoutObserver {
    fn record(&self, event: &CapabilityEvent) {
        for observer in &self.observers {
            observer.record(event);
        }
    }
}

/// Compute the SHA-256 hash of some bytes, returned as a hex string.
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    let result = hasher.finalize();
    hex_encode(&result)
}

/// Hash of a JSON payload as it would be serialized on the wire.
pub fn payload_hash(payload: &serde_json::Value) -> String {
    sha256_hex(serde_json::to_vec(payload).unwrap_or_default())
}

/// Encode bytes as a hex string.
fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}
