//! Runtime modules materialized into every generation.
//!
//! Both modules are thin relays. `shim.js` installs a frozen `chrome`
//! namespace whose methods forward to the engine-provided
//! `__previewOps.call(op, args)` binding; `bindings.js` runs last and wires
//! DOM events to functions the bundle defined. Neither module carries the
//! generation's identity token.

use crate::Generation;

/// Bundle-relative directory runtime resources live under.
pub const RUNTIME_DIR: &str = "__preview__";

/// Path of the shim module.
pub const SHIM_PATH: &str = "__preview__/shim.js";

/// Path of the DOM binding module.
pub const BINDINGS_PATH: &str = "__preview__/bindings.js";

/// Path of the rendered popup document.
pub const POPUP_DOCUMENT_PATH: &str = "__preview__/popup.html";

/// Path of the rendered page document.
pub const PAGE_DOCUMENT_PATH: &str = "__preview__/page.html";

const SHIM_TEMPLATE: &str = r#"
((ops) => {
    const call = (op, ...args) => ops.call(op, args);
    const listeners = [];
    const chrome = {
        storage: {
            local: Object.freeze({
                get: (key) => call("storage.get", key),
                set: (key, value) => call("storage.set", key, value),
                remove: (key) => call("storage.remove", key),
                clear: () => call("storage.clear"),
                getKeys: () => call("storage.keys"),
            }),
        },
        runtime: Object.freeze({
            id: "preview-{{GENERATION}}",
            sendMessage: (payload) => call("runtime.sendMessage", payload),
            onMessage: Object.freeze({
                addListener: (fn) => {
                    listeners.push(fn);
                    return call("runtime.onMessage.addListener");
                },
            }),
        }),
        tabs: Object.freeze({
            query: (filter) => call("tabs.query", filter || {}),
            sendMessage: (tabId, payload) => call("tabs.sendMessage", tabId, payload),
        }),
        scripting: Object.freeze({
            executeScript: (target, func, args) =>
                call("scripting.executeScript", target, String(func), args || []),
        }),
    };
    chrome.storage.sync = chrome.storage.local;
    Object.defineProperty(globalThis, "chrome", {
        value: Object.freeze(chrome), writable: false, configurable: false,
    });
    ops.onDeliver((message) => {
        for (const fn of listeners) {
            const reply = fn(message.payload, { id: message.from });
            if (reply !== undefined) return reply;
        }
        return undefined;
    });
})(globalThis.__previewOps);
"#;

const BINDINGS_TEMPLATE: &str = r#"
(() => {
    const gen = "{{GENERATION}}";
    for (const el of document.querySelectorAll("[data-action]")) {
        const fn = globalThis[el.dataset.action];
        if (typeof fn === "function") {
            el.addEventListener("click", (ev) => fn(ev));
        }
    }
    globalThis.__previewOps.ready(gen);
})();
"#;

/// Source of the shim module for `generation`.
pub fn shim_module(generation: Generation) -> String {
    SHIM_TEMPLATE.replace("{{GENERATION}}", &generation.to_string())
}

/// Source of the DOM binding module for `generation`.
pub fn bindings_module(generation: Generation) -> String {
    BINDINGS_TEMPLATE.replace("{{GENERATION}}", &generation.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shim_installs_frozen_namespace() {
        let js = shim_module(Generation::new(3));
        assert!(js.contains("globalThis.__previewOps"));
        assert!(js.contains("\"runtime.sendMessage\""));
        assert!(js.contains("\"scripting.executeScript\""));
        assert!(js.contains("preview-3"));
        assert!(!js.contains("{{GENERATION}}"));
    }

    #[test]
    fn bindings_signal_readiness() {
        let js = bindings_module(Generation::new(9));
        assert!(js.contains("__previewOps.ready(gen)"));
        assert!(js.contains("\"9\""));
    }
}
