//! Capability shim: the extension API surface seen by sandboxed code.
//!
//! One [`CapabilityShim`] is built per generation. Each isolated context gets
//! a [`ContextShim`] view on it, which exposes the `storage`, `runtime`,
//! `tabs` and `scripting` namespaces.
//!
//! The mode is decided once, when the shim is built, from an
//! [`IdentityToken`] minted by the assembler before any bundle code runs.
//! Host mode requires a [`HostAttestation`] carrying that same token.
//! Bundle code can write whatever it likes into its [`ContextGlobals`];
//! detection never looks there.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use preview_error::CapabilityError;

use crate::audit::{payload_hash, CallOutcome, CallTimer, CapabilityCall, CapabilityEvent, CapabilityObserver};
use crate::bridge::{Bridge, ContextId, MessageListener};
use crate::context::ContextLink;
use crate::storage::{CapabilityStorage, StorageSnapshot};
use crate::{Generation, HostCapabilities};

/// Id of the single simulated tab.
pub const SIMULATED_TAB_ID: i64 = 1;

/// Id of the single simulated window.
pub const SIMULATED_WINDOW_ID: i64 = 1;

/// Secret minted per generation before bundle code runs.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityToken(Uuid);

impl IdentityToken {
    /// Mint a fresh random token.
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdentityToken(..)")
    }
}

/// Proof presented by the embedder that the preview runs inside a genuine host.
#[derive(Clone)]
pub struct HostAttestation {
    token: IdentityToken,
    host: Arc<dyn HostCapabilities>,
}

impl HostAttestation {
    /// Pair a token with the host that vouches for it.
    pub fn new(token: IdentityToken, host: Arc<dyn HostCapabilities>) -> Self {
        Self { token, host }
    }
}

impl fmt::Debug for HostAttestation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostAttestation").finish_non_exhaustive()
    }
}

/// Where capability calls are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShimMode {
    /// Served from in-memory per-generation state.
    Sandbox,
    /// Forwarded unchanged to a genuine host.
    Host,
}

impl ShimMode {
    /// Decide the mode from the expected token and an optional attestation.
    pub fn detect(expected: &IdentityToken, attestation: Option<&HostAttestation>) -> Self {
        match attestation {
            Some(a) if a.token == *expected => Self::Host,
            Some(_) => {
                tracing::warn!("host attestation token mismatch, staying in sandbox mode");
                Self::Sandbox
            }
            None => Self::Sandbox,
        }
    }
}

/// Free-form globals a context's scripts can read and write.
#[derive(Debug, Default)]
pub struct ContextGlobals {
    values: Mutex<HashMap<String, Value>>,
}

impl ContextGlobals {
    /// Set a global.
    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.values.lock().insert(name.into(), value);
    }

    /// Read a global.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.values.lock().get(name).cloned()
    }

    /// Remove a global.
    pub fn remove(&self, name: &str) -> Option<Value> {
        self.values.lock().remove(name)
    }
}

/// Filter for `tabs.query`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabQuery {
    /// Only the active tab.
    #[serde(default)]
    pub active: Option<bool>,
    /// Only tabs in the current window.
    #[serde(default)]
    pub current_window: Option<bool>,
    /// URL match pattern (`<all_urls>` or a `*` glob).
    #[serde(default)]
    pub url: Option<String>,
}

/// A simulated tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
    /// Tab id.
    pub id: i64,
    /// Window id.
    pub window_id: i64,
    /// Current URL.
    pub url: String,
    /// Page title.
    pub title: String,
    /// Whether this is the active tab.
    pub active: bool,
}

/// Target of `scripting.executeScript`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptTarget {
    /// Tab to inject into.
    pub tab_id: i64,
    /// Inject into every frame.
    #[serde(default)]
    pub all_frames: bool,
}

/// State of the simulated page that injected functions run against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSnapshot {
    /// Page URL.
    pub url: String,
    /// Page title.
    pub title: String,
    /// Page markup.
    pub markup: String,
}

impl Default for PageSnapshot {
    fn default() -> Self {
        Self {
            url: "https://example.com/".into(),
            title: "Example Domain".into(),
            markup: "<html><head><title>Example Domain</title></head>\
                     <body><h1>Example Domain</h1></body></html>"
                .into(),
        }
    }
}

/// Function injected by `scripting.executeScript`.
pub type InjectedFn = Arc<dyn Fn(&PageSnapshot, &[Value]) -> Value + Send + Sync>;

/// A function plus its arguments, ready to inject.
#[derive(Clone)]
pub struct ScriptInjection {
    /// Name used in logs.
    pub name: String,
    /// The function.
    pub func: InjectedFn,
    /// Arguments passed to the function.
    pub args: Vec<Value>,
}

impl ScriptInjection {
    /// Wrap a function.
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&PageSnapshot, &[Value]) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
            args: Vec::new(),
        }
    }

    /// Set the arguments.
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

impl fmt::Debug for ScriptInjection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptInjection")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

/// Result of an injection in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectionResult {
    /// Frame id; the top frame is `0`.
    pub frame_id: u32,
    /// Value returned by the injected function.
    pub result: Value,
}

/// Everything a generation's shim is built from.
pub struct ShimParts {
    /// Owning generation.
    pub generation: Generation,
    /// Token minted by the assembler for this generation.
    pub identity: IdentityToken,
    /// Attestation from the embedder, if any.
    pub attestation: Option<HostAttestation>,
    /// Storage area for this generation.
    pub storage: CapabilityStorage,
    /// The generation's bridge.
    pub bridge: Bridge,
    /// Link to the page context, for page-targeting bundles.
    pub page: Option<ContextLink>,
    /// The simulated tab.
    pub tab: TabInfo,
    /// Instrumentation sink.
    pub observer: Arc<dyn CapabilityObserver>,
    /// Bound on host pass-through and injection calls.
    pub call_timeout: Duration,
}

struct ShimInner {
    generation: Generation,
    mode: ShimMode,
    host: Option<Arc<dyn HostCapabilities>>,
    storage: CapabilityStorage,
    bridge: Bridge,
    page: Option<ContextLink>,
    tab: TabInfo,
    observer: Arc<dyn CapabilityObserver>,
    call_timeout: Duration,
    seq: AtomicU64,
}

/// Per-generation capability state and dispatch.
#[derive(Clone)]
pub struct CapabilityShim {
    inner: Arc<ShimInner>,
}

impl fmt::Debug for CapabilityShim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityShim")
            .field("generation", &self.inner.generation)
            .field("mode", &self.inner.mode)
            .finish_non_exhaustive()
    }
}

impl CapabilityShim {
    /// Build the shim, deciding its mode once.
    pub fn new(parts: ShimParts) -> Self {
        let mode = ShimMode::detect(&parts.identity, parts.attestation.as_ref());
        let host = match mode {
            ShimMode::Host => parts.attestation.map(|a| a.host),
            ShimMode::Sandbox => None,
        };
        tracing::debug!(generation = %parts.generation, ?mode, "capability shim ready");
        Self {
            inner: Arc::new(ShimInner {
                generation: parts.generation,
                mode,
                host,
                storage: parts.storage,
                bridge: parts.bridge,
                page: parts.page,
                tab: parts.tab,
                observer: parts.observer,
                call_timeout: parts.call_timeout,
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// The mode decided at construction.
    pub fn mode(&self) -> ShimMode {
        self.inner.mode
    }

    /// Owning generation.
    pub fn generation(&self) -> Generation {
        self.inner.generation
    }

    /// Copy of the in-memory storage area.
    pub fn storage_snapshot(&self) -> StorageSnapshot {
        self.inner.storage.snapshot()
    }

    /// View of the shim for code running in `context`.
    pub fn for_context(&self, context: ContextId) -> ContextShim {
        ContextShim {
            shim: self.clone(),
            context,
        }
    }
}

/// The shim as seen from one context.
#[derive(Clone, Debug)]
pub struct ContextShim {
    shim: CapabilityShim,
    context: ContextId,
}

impl ContextShim {
    /// Context this view belongs to.
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Mode of the underlying shim.
    pub fn mode(&self) -> ShimMode {
        self.shim.mode()
    }

    /// `storage` namespace.
    pub fn storage(&self) -> StorageApi<'_> {
        StorageApi { view: self }
    }

    /// `runtime` namespace.
    pub fn runtime(&self) -> RuntimeApi<'_> {
        RuntimeApi { view: self }
    }

    /// `tabs` namespace.
    pub fn tabs(&self) -> TabsApi<'_> {
        TabsApi { view: self }
    }

    /// `scripting` namespace.
    pub fn scripting(&self) -> ScriptingApi<'_> {
        ScriptingApi { view: self }
    }

    fn inner(&self) -> &ShimInner {
        &self.shim.inner
    }

    fn host(&self) -> Option<&Arc<dyn HostCapabilities>> {
        self.inner().host.as_ref()
    }

    fn record<T>(&self, call: CapabilityCall, timer: CallTimer, result: &Result<T, CapabilityError>) {
        let inner = self.inner();
        let event = CapabilityEvent {
            seq: inner.seq.fetch_add(1, Ordering::Relaxed),
            timestamp: timer.timestamp(),
            generation: inner.generation,
            context: self.context,
            mode: inner.mode,
            call,
            duration_ms: timer.elapsed_ms(),
            outcome: CallOutcome::of(result),
        };
        inner.observer.record(&event);
    }

    async fn observed<T, F>(&self, call: CapabilityCall, fut: F) -> Result<T, CapabilityError>
    where
        F: Future<Output = Result<T, CapabilityError>>,
    {
        let timer = CallTimer::start();
        let result = fut.await;
        self.record(call, timer, &result);
        result
    }

    /// Run a host call under the shim's call timeout.
    async fn host_call<T, F>(&self, operation: &str, fut: F) -> Result<T, CapabilityError>
    where
        F: Future<Output = Result<T, CapabilityError>>,
    {
        let timeout = self.inner().call_timeout;
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(CapabilityError::Timeout {
                operation: operation.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Receiver of `runtime.sendMessage` from this context.
    fn runtime_peer(&self) -> ContextId {
        match self.context {
            ContextId::Popup => ContextId::Ui,
            ContextId::Page | ContextId::Ui => ContextId::Popup,
        }
    }

    fn check_tab(&self, tab_id: i64) -> Result<(), CapabilityError> {
        if tab_id == self.inner().tab.id {
            Ok(())
        } else {
            Err(CapabilityError::NoSuchTab { tab_id })
        }
    }
}

/// `storage` namespace.
pub struct StorageApi<'a> {
    view: &'a ContextShim,
}

impl StorageApi<'_> {
    /// Read a value. `None` when the key is absent.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, CapabilityError> {
        let view = self.view;
        let call = CapabilityCall::StorageGet { key: key.to_string() };
        view.observed(call, async {
            match view.host() {
                Some(host) => view.host_call("storage.get", host.storage_get(key)).await,
                None => Ok(view.inner().storage.get(key)?),
            }
        })
        .await
    }

    /// Store a value.
    pub async fn set(&self, key: &str, value: Value) -> Result<(), CapabilityError> {
        let view = self.view;
        let call = CapabilityCall::StorageSet {
            key: key.to_string(),
            size_bytes: serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0),
        };
        view.observed(call, async {
            match view.host() {
                Some(host) => view.host_call("storage.set", host.storage_set(key, value)).await,
                None => Ok(view.inner().storage.set(key, value)?),
            }
        })
        .await
    }

    /// Remove a key. Returns whether it existed.
    pub async fn remove(&self, key: &str) -> Result<bool, CapabilityError> {
        let view = self.view;
        let call = CapabilityCall::StorageRemove { key: key.to_string() };
        view.observed(call, async {
            match view.host() {
                Some(host) => view.host_call("storage.remove", host.storage_remove(key)).await,
                None => Ok(view.inner().storage.remove(key)?),
            }
        })
        .await
    }

    /// Stored keys.
    pub async fn keys(&self) -> Result<Vec<String>, CapabilityError> {
        let view = self.view;
        view.observed(CapabilityCall::StorageKeys, async {
            match view.host() {
                Some(host) => view.host_call("storage.keys", host.storage_keys()).await,
                None => Ok(view.inner().storage.keys()),
            }
        })
        .await
    }

    /// Remove every key.
    pub async fn clear(&self) -> Result<(), CapabilityError> {
        let view = self.view;
        view.observed(CapabilityCall::StorageClear, async {
            match view.host() {
                Some(host) => view.host_call("storage.clear", host.storage_clear()).await,
                None => {
                    view.inner().storage.clear();
                    Ok(())
                }
            }
        })
        .await
    }
}

/// `runtime` namespace.
pub struct RuntimeApi<'a> {
    view: &'a ContextShim,
}

impl RuntimeApi<'_> {
    /// `runtime.sendMessage`. Resolves with the first response, or
    /// `NoReceiver` when nobody answers in time.
    pub async fn send_message(&self, payload: Value) -> Result<Value, CapabilityError> {
        let view = self.view;
        let call = CapabilityCall::SendMessage {
            payload_hash: payload_hash(&payload),
        };
        view.observed(call, async {
            match view.host() {
                Some(host) => {
                    view.host_call("runtime.sendMessage", host.send_message(payload))
                        .await
                }
                None => {
                    view.inner()
                        .bridge
                        .send(view.context, view.runtime_peer(), payload)
                        .recv()
                        .await
                }
            }
        })
        .await
    }

    /// `runtime.onMessage.addListener`. In host mode the listener is
    /// registered with the host, which then delivers its messages.
    pub fn on_message(&self, listener: Arc<dyn MessageListener>) -> Result<(), CapabilityError> {
        let view = self.view;
        let timer = CallTimer::start();
        let result = match view.host() {
            Some(host) => host.add_message_listener(listener),
            None => {
                view.inner().bridge.on_deliver(view.context, listener);
                Ok(())
            }
        };
        view.record(CapabilityCall::AddListener, timer, &result);
        result
    }
}

/// `tabs` namespace.
pub struct TabsApi<'a> {
    view: &'a ContextShim,
}

impl TabsApi<'_> {
    /// `tabs.query`.
    pub async fn query(&self, query: &TabQuery) -> Result<Vec<TabInfo>, CapabilityError> {
        let view = self.view;
        view.observed(CapabilityCall::TabsQuery, async {
            match view.host() {
                Some(host) => view.host_call("tabs.query", host.query_tabs(query)).await,
                None => {
                    let tab = &view.inner().tab;
                    Ok(if tab_matches(tab, query) {
                        vec![tab.clone()]
                    } else {
                        Vec::new()
                    })
                }
            }
        })
        .await
    }

    /// `tabs.sendMessage`. Without a page context this is `NoReceiver`.
    pub async fn send_message(&self, tab_id: i64, payload: Value) -> Result<Value, CapabilityError> {
        let view = self.view;
        let call = CapabilityCall::TabsSendMessage {
            tab_id,
            payload_hash: payload_hash(&payload),
        };
        view.observed(call, async {
            match view.host() {
                Some(host) => {
                    view.host_call("tabs.sendMessage", host.send_tab_message(tab_id, payload))
                        .await
                }
                None => {
                    view.check_tab(tab_id)?;
                    view.inner()
                        .bridge
                        .send(view.context, ContextId::Page, payload)
                        .recv()
                        .await
                }
            }
        })
        .await
    }
}

/// `scripting` namespace.
pub struct ScriptingApi<'a> {
    view: &'a ContextShim,
}

impl ScriptingApi<'_> {
    /// `scripting.executeScript`. In sandbox mode the function runs inside
    /// the simulated page context.
    pub async fn execute_script(
        &self,
        target: ScriptTarget,
        injection: ScriptInjection,
    ) -> Result<Vec<InjectionResult>, CapabilityError> {
        let view = self.view;
        let call = CapabilityCall::ExecuteScript {
            tab_id: target.tab_id,
            injection: injection.name.clone(),
        };
        view.observed(call, async {
            match view.host() {
                Some(host) => {
                    view.host_call(
                        "scripting.executeScript",
                        host.execute_script(&target, &injection),
                    )
                    .await
                }
                None => {
                    view.check_tab(target.tab_id)?;
                    let Some(page) = view.inner().page.as_ref() else {
                        return Err(CapabilityError::NoReceiver {
                            target: ContextId::Page.to_string(),
                        });
                    };
                    let result = view
                        .host_call("scripting.executeScript", page.inject(injection))
                        .await?;
                    Ok(vec![InjectionResult { frame_id: 0, result }])
                }
            }
        })
        .await
    }
}

fn tab_matches(tab: &TabInfo, query: &TabQuery) -> bool {
    if query.active.is_some_and(|active| active != tab.active) {
        return false;
    }
    if query.current_window == Some(false) {
        return false;
    }
    match query.url.as_deref() {
        None | Some("<all_urls>") => true,
        Some(pattern) => url_pattern_matches(pattern, &tab.url),
    }
}

/// Match a `*` glob against a URL. Invalid patterns match nothing.
fn url_pattern_matches(pattern: &str, url: &str) -> bool {
    let escaped: Vec<String> = pattern.split('*').map(regex::escape).collect();
    match Regex::new(&format!("^{}$", escaped.join(".*"))) {
        Ok(re) => re.is_match(url),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::CapabilityLog;
    use crate::bridge::{Envelope, ListenerReply};
    use crate::storage::StorageConfig;
    use serde_json::json;

    fn tab() -> TabInfo {
        TabInfo {
            id: SIMULATED_TAB_ID,
            window_id: SIMULATED_WINDOW_ID,
            url: "https://example.com/article".into(),
            title: "Example".into(),
            active: true,
        }
    }

    fn sandbox_shim(log: Arc<CapabilityLog>) -> CapabilityShim {
        CapabilityShim::new(ShimParts {
            generation: Generation::new(1),
            identity: IdentityToken::mint(),
            attestation: None,
            storage: CapabilityStorage::new(StorageConfig::default()),
            bridge: Bridge::new(Generation::new(1), Duration::from_millis(100)),
            page: None,
            tab: tab(),
            observer: log,
            call_timeout: Duration::from_millis(100),
        })
    }

    /// Host that records every storage write and listener it receives.
    #[derive(Default)]
    struct RecordingHost {
        writes: Mutex<Vec<(String, Value)>>,
        listeners: Mutex<Vec<Arc<dyn MessageListener>>>,
    }

    #[async_trait::async_trait]
    impl HostCapabilities for RecordingHost {
        async fn storage_get(&self, _key: &str) -> Result<Option<Value>, CapabilityError> {
            Ok(Some(json!("from-host")))
        }
        async fn storage_set(&self, key: &str, value: Value) -> Result<(), CapabilityError> {
            self.writes.lock().push((key.to_string(), value));
            Ok(())
        }
        async fn storage_remove(&self, _key: &str) -> Result<bool, CapabilityError> {
            Ok(true)
        }
        async fn storage_keys(&self) -> Result<Vec<String>, CapabilityError> {
            Ok(vec![])
        }
        async fn storage_clear(&self) -> Result<(), CapabilityError> {
            Ok(())
        }
        async fn send_message(&self, payload: Value) -> Result<Value, CapabilityError> {
            Ok(json!({"host_echo": payload}))
        }
        fn add_message_listener(&self, listener: Arc<dyn MessageListener>) -> Result<(), CapabilityError> {
            self.listeners.lock().push(listener);
            Ok(())
        }
        async fn query_tabs(&self, _query: &TabQuery) -> Result<Vec<TabInfo>, CapabilityError> {
            Ok(vec![])
        }
        async fn send_tab_message(
            &self,
            _tab_id: i64,
            _payload: Value,
        ) -> Result<Value, CapabilityError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }
        async fn execute_script(
            &self,
            _target: &ScriptTarget,
            _injection: &ScriptInjection,
        ) -> Result<Vec<InjectionResult>, CapabilityError> {
            Ok(vec![])
        }
    }

    fn host_shim(token: IdentityToken, attested: IdentityToken, host: Arc<RecordingHost>) -> CapabilityShim {
        CapabilityShim::new(ShimParts {
            generation: Generation::new(2),
            identity: token,
            attestation: Some(HostAttestation::new(attested, host)),
            storage: CapabilityStorage::new(StorageConfig::default()),
            bridge: Bridge::new(Generation::new(2), Duration::from_millis(100)),
            page: None,
            tab: tab(),
            observer: Arc::new(crate::audit::NoopObserver),
            call_timeout: Duration::from_millis(100),
        })
    }

    // --- mode detection ---

    #[test]
    fn detection_requires_matching_token() {
        let token = IdentityToken::mint();
        assert_eq!(ShimMode::detect(&token, None), ShimMode::Sandbox);

        let host: Arc<dyn HostCapabilities> = Arc::new(RecordingHost::default());
        let forged = HostAttestation::new(IdentityToken::mint(), host.clone());
        assert_eq!(ShimMode::detect(&token, Some(&forged)), ShimMode::Sandbox);

        let genuine = HostAttestation::new(token.clone(), host);
        assert_eq!(ShimMode::detect(&token, Some(&genuine)), ShimMode::Host);
    }

    #[test]
    fn token_debug_does_not_leak() {
        let token = IdentityToken::mint();
        assert_eq!(format!("{token:?}"), "IdentityToken(..)");
    }

    // --- sandbox mode ---

    #[tokio::test]
    async fn storage_calls_are_served_in_memory_and_observed() {
        let log = Arc::new(CapabilityLog::new(16));
        let shim = sandbox_shim(log.clone());
        let popup = shim.for_context(ContextId::Popup);

        popup.storage().set("settings", json!({"on": true})).await.unwrap();
        assert_eq!(popup.storage().keys().await.unwrap(), vec!["settings"]);
        assert!(popup.storage().remove("settings").await.unwrap());
        assert!(popup.storage().get("bad key").await.is_err());

        let events = log.snapshot();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0].call, CapabilityCall::StorageSet { ref key, .. } if key == "settings"));
        assert!(events[0].outcome.is_success());
        assert!(!events[3].outcome.is_success());
        assert_eq!(events[3].seq, 3);
    }

    #[tokio::test]
    async fn send_message_without_listener_is_no_receiver() {
        let shim = sandbox_shim(Arc::new(CapabilityLog::new(8)));
        let popup = shim.for_context(ContextId::Popup);
        let err = popup.runtime().send_message(json!({"hi": 1})).await.unwrap_err();
        assert_eq!(err.code(), "NO_RECEIVER");
    }

    #[tokio::test]
    async fn page_messages_reach_popup_listeners() {
        let shim = sandbox_shim(Arc::new(CapabilityLog::new(8)));
        let popup = shim.for_context(ContextId::Popup);
        popup.runtime().on_message(Arc::new(|env: &Envelope| {
            ListenerReply::Respond(json!({"from": env.from, "got": env.payload}))
        }))
            .unwrap();

        let page = shim.for_context(ContextId::Page);
        let reply = page.runtime().send_message(json!("hello")).await.unwrap();
        assert_eq!(reply, json!({"from": "page", "got": "hello"}));
    }

    #[tokio::test]
    async fn tabs_query_filters_the_simulated_tab() {
        let shim = sandbox_shim(Arc::new(CapabilityLog::new(8)));
        let popup = shim.for_context(ContextId::Popup);

        let all = popup.tabs().query(&TabQuery::default()).await.unwrap();
        assert_eq!(all, vec![tab()]);

        let q = TabQuery {
            url: Some("https://example.com/*".into()),
            active: Some(true),
            ..Default::default()
        };
        assert_eq!(popup.tabs().query(&q).await.unwrap().len(), 1);

        let q = TabQuery {
            url: Some("https://other.org/*".into()),
            ..Default::default()
        };
        assert!(popup.tabs().query(&q).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tab_message_without_page_context_is_no_receiver() {
        let shim = sandbox_shim(Arc::new(CapabilityLog::new(8)));
        let popup = shim.for_context(ContextId::Popup);
        let err = popup
            .tabs()
            .send_message(SIMULATED_TAB_ID, json!("ping"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NO_RECEIVER");

        let err = popup.tabs().send_message(42, json!("ping")).await.unwrap_err();
        assert!(matches!(err, CapabilityError::NoSuchTab { tab_id: 42 }));
    }

    #[tokio::test]
    async fn execute_script_without_page_context_is_no_receiver() {
        let shim = sandbox_shim(Arc::new(CapabilityLog::new(8)));
        let popup = shim.for_context(ContextId::Popup);
        let injection = ScriptInjection::new("title", |page, _| json!(page.title));
        let err = popup
            .scripting()
            .execute_script(
                ScriptTarget {
                    tab_id: SIMULATED_TAB_ID,
                    all_frames: false,
                },
                injection,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NO_RECEIVER");
    }

    #[test]
    fn url_patterns() {
        assert!(url_pattern_matches("https://*.example.com/*", "https://www.example.com/a"));
        assert!(!url_pattern_matches("https://*.example.com/*", "http://www.example.com/a"));
        assert!(url_pattern_matches("https://example.com/", "https://example.com/"));
    }

    // --- host mode ---

    #[tokio::test]
    async fn host_mode_forwards_calls() {
        let token = IdentityToken::mint();
        let host = Arc::new(RecordingHost::default());
        let shim = host_shim(token.clone(), token, host.clone());
        assert_eq!(shim.mode(), ShimMode::Host);

        let popup = shim.for_context(ContextId::Popup);
        popup.storage().set("k", json!(5)).await.unwrap();
        assert_eq!(host.writes.lock().clone(), vec![("k".to_string(), json!(5))]);
        assert_eq!(popup.storage().get("k").await.unwrap(), Some(json!("from-host")));
        // nothing was written to the in-memory area
        assert!(shim.storage_snapshot().is_empty());

        let reply = popup.runtime().send_message(json!(1)).await.unwrap();
        assert_eq!(reply, json!({"host_echo": 1}));
    }

    #[tokio::test]
    async fn host_mode_listeners_register_with_the_host() {
        let token = IdentityToken::mint();
        let host = Arc::new(RecordingHost::default());
        let shim = host_shim(token.clone(), token, host.clone());
        let popup = shim.for_context(ContextId::Popup);

        popup
            .runtime()
            .on_message(Arc::new(|_: &Envelope| ListenerReply::Respond(json!("ok"))))
            .unwrap();
        assert_eq!(host.listeners.lock().len(), 1);
        assert_eq!(shim.inner.bridge.listener_count(ContextId::Popup), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn host_calls_are_bounded() {
        let token = IdentityToken::mint();
        let shim = host_shim(token.clone(), token, Arc::new(RecordingHost::default()));
        let popup = shim.for_context(ContextId::Popup);
        let err = popup.tabs().send_message(1, json!(null)).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Timeout { ref operation, timeout_ms: 100 } if operation == "tabs.sendMessage"));
    }

    #[tokio::test]
    async fn forged_attestation_stays_in_sandbox() {
        let host = Arc::new(RecordingHost::default());
        let shim = host_shim(IdentityToken::mint(), IdentityToken::mint(), host.clone());
        assert_eq!(shim.mode(), ShimMode::Sandbox);
        shim.for_context(ContextId::Popup)
            .storage()
            .set("k", json!(1))
            .await
            .unwrap();
        assert!(host.writes.lock().is_empty());
        assert_eq!(shim.storage_snapshot().len(), 1);
    }
}
