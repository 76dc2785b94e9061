//! End-to-end tests for the preview lifecycle: admission, materialization,
//! assembly, readiness and teardown through the public runner API.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use preview_sandbox::assembler::LoadPhase;
use preview_sandbox::context::{LoadedScript, ScriptEngine, ScriptScope};
use preview_sandbox::{
    validate, AdmissionLimits, AdmissionMode, ContextId, Envelope, FileEntry, FileSet,
    ListenerReply, Materializer, PreviewError, PreviewRunner, RunnerConfig, ValidationError,
};

/// Records every script evaluation as `(context, phase, path)`.
#[derive(Default)]
struct RecordingEngine {
    loads: Mutex<Vec<(ContextId, LoadPhase, String)>>,
}

impl RecordingEngine {
    fn paths(&self, context: ContextId) -> Vec<String> {
        self.loads
            .lock()
            .iter()
            .filter(|(c, _, _)| *c == context)
            .map(|(_, _, path)| path.clone())
            .collect()
    }
}

impl ScriptEngine for RecordingEngine {
    fn evaluate(&self, script: &LoadedScript, scope: &mut ScriptScope<'_>) -> Result<(), String> {
        self.loads
            .lock()
            .push((scope.context, script.phase, script.path.clone()));
        Ok(())
    }
}

/// Never finishes evaluating a script that asks it to hang.
struct SlowEngine;

impl ScriptEngine for SlowEngine {
    fn evaluate(&self, script: &LoadedScript, _scope: &mut ScriptScope<'_>) -> Result<(), String> {
        if script.source.contains("hang()") {
            std::thread::sleep(Duration::from_millis(300));
        }
        Ok(())
    }
}

fn manifest() -> FileEntry {
    FileEntry::new("manifest.json", r#"{"manifest_version": 3, "name": "Word Counter"}"#)
}

fn minimal_bundle() -> FileSet {
    FileSet::new(vec![
        manifest(),
        FileEntry::new("popup.js", "document.body.textContent = 'hi';"),
    ])
}

// --- scenario 1: minimal bundle generates with two resources ---
#[tokio::test]
async fn scenario_minimal_bundle_generates() {
    let runner = PreviewRunner::new(RunnerConfig::default());
    let handle = runner
        .generate(&minimal_bundle(), AdmissionMode::New)
        .await
        .expect("minimal bundle should generate");

    let inspection = runner.inspect(&handle);
    assert_eq!(inspection.resource_count, 2);
    assert_eq!(inspection.live_generation, handle.generation());
    assert_eq!(inspection.pending_message_count, 0);
}

// --- scenario 2: traversal path is named in the error ---
#[test]
fn scenario_traversal_path_rejected() {
    let files = FileSet::new(vec![manifest(), FileEntry::new("../evil.js", "x")]);
    let err = validate(&files, AdmissionMode::New, &AdmissionLimits::default()).unwrap_err();
    assert!(matches!(err, ValidationError::UnsafePath { .. }));
    assert_eq!(err.path(), Some("../evil.js"));
    assert!(err.to_string().contains("../evil.js"));
}

// --- scenario 3: total ceiling is checked before anything is materialized ---
#[tokio::test]
async fn scenario_total_size_rejected_before_materializing() {
    let chunk = "a".repeat(100 * 1024);
    let mut files = vec![manifest()];
    for i in 0..5 {
        files.push(FileEntry::new(format!("part{i}.js"), chunk.clone()));
    }
    let file_set = FileSet::new(files);

    let runner = PreviewRunner::new(RunnerConfig::default());
    let err = runner
        .generate(&file_set, AdmissionMode::New)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TOTAL_TOO_LARGE");
    assert!(err.to_string().contains("total size limit"));
    assert_eq!(runner.materializer().total_live(), 0);
    assert_eq!(
        runner
            .materializer()
            .metrics()
            .issued
            .load(std::sync::atomic::Ordering::Relaxed),
        0
    );
}

// --- scenario 4: a refused rebuild leaves the previous generation live ---
#[tokio::test]
async fn scenario_failed_rebuild_keeps_previous_generation() {
    let runner = PreviewRunner::new(RunnerConfig::default());
    let handle = runner
        .generate(&minimal_bundle(), AdmissionMode::New)
        .await
        .unwrap();
    let live = handle.generation().unwrap();
    let before = runner.inspect(&handle);

    let popup = handle.capabilities(ContextId::Popup).unwrap();
    popup.runtime().on_message(Arc::new(|envelope: &Envelope| {
        ListenerReply::Respond(json!({"pong": envelope.payload.clone()}))
    }))
        .unwrap();

    let bad = FileSet::new(vec![manifest(), FileEntry::new("../evil.js", "x")]);
    let err = runner
        .rebuild(&handle, &bad, AdmissionMode::New)
        .await
        .unwrap_err();
    assert!(matches!(err, PreviewError::Validation(ValidationError::UnsafePath { .. })));

    assert_eq!(handle.generation(), Some(live));
    let after = runner.inspect(&handle);
    assert_eq!(after.resource_count, before.resource_count);
    assert_eq!(after.live_references, before.live_references);

    let reply = handle.send(ContextId::Popup, json!(1)).await.unwrap();
    assert_eq!(reply, json!({"pong": 1}));
}

// --- limits ---
#[test]
fn too_many_files_names_the_limit() {
    let limits = AdmissionLimits {
        max_files: 3,
        ..AdmissionLimits::default()
    };
    let mut files = vec![manifest()];
    for i in 0..3 {
        files.push(FileEntry::new(format!("f{i}.js"), ""));
    }
    let err = validate(&FileSet::new(files), AdmissionMode::New, &limits).unwrap_err();
    assert!(matches!(err, ValidationError::TooManyFiles { max: 3, actual: 4 }));
}

#[test]
fn each_unsafe_path_is_reported_exactly() {
    for path in ["../up.js", "a/../b.js", "/abs.js", ".hidden/x.js", "dir/.env.js", "noext"] {
        let files = FileSet::new(vec![manifest(), FileEntry::new(path, "x")]);
        let err = validate(&files, AdmissionMode::New, &AdmissionLimits::default())
            .expect_err(path);
        assert_eq!(err.path(), Some(path), "wrong path reported for {path}");
    }
}

// --- leaks and idempotence ---
#[test]
fn retire_leaves_no_live_references() {
    let admitted = validate(&minimal_bundle(), AdmissionMode::New, &AdmissionLimits::default()).unwrap();
    let vfs = Materializer::new();
    let generation = preview_sandbox::Generation::new(1);
    let table = vfs.materialize(generation, &admitted).unwrap();
    assert_eq!(vfs.live_references(generation), table.len());

    vfs.retire(generation);
    assert_eq!(vfs.live_references(generation), 0);
    for handle in table.handles() {
        assert!(vfs.redeem(&handle.reference).is_none());
    }

    let again = vfs.retire(generation);
    assert!(matches!(again, preview_sandbox::vfs::RetireOutcome::Noop(_)));
    assert_eq!(vfs.live_references(generation), 0);
}

#[tokio::test]
async fn repeated_rebuilds_do_not_leak() {
    let runner = PreviewRunner::new(RunnerConfig::default());
    let handle = runner
        .generate(&minimal_bundle(), AdmissionMode::New)
        .await
        .unwrap();
    for i in 0..5 {
        let files = FileSet::new(vec![manifest(), FileEntry::new("popup.js", format!("var v = {i};"))]);
        runner.rebuild(&handle, &files, AdmissionMode::New).await.unwrap();
    }
    let live = handle.generation().unwrap();
    assert_eq!(
        runner.materializer().total_live(),
        runner.materializer().live_references(live)
    );

    runner.dispose(&handle).await;
    runner.dispose(&handle).await;
    assert_eq!(runner.materializer().total_live(), 0);
    assert!(runner.inspect(&handle).disposed);
}

// --- ordering ---
#[tokio::test]
async fn shim_loads_before_bundle_scripts_and_bindings_after() {
    let engine = Arc::new(RecordingEngine::default());
    let runner = PreviewRunner::new(RunnerConfig::default()).with_engine(engine.clone());
    let files = FileSet::new(vec![
        manifest(),
        FileEntry::new(
            "popup.html",
            r#"<html><body><script src="A.js"></script><script src="B.js"></script></body></html>"#,
        ),
        FileEntry::new("B.js", "var b;"),
        FileEntry::new("A.js", "var a;"),
    ]);
    runner.generate(&files, AdmissionMode::New).await.unwrap();

    assert_eq!(
        engine.paths(ContextId::Popup),
        vec!["__preview__/shim.js", "A.js", "B.js", "__preview__/bindings.js"]
    );
    let phases: Vec<LoadPhase> = engine.loads.lock().iter().map(|(_, p, _)| *p).collect();
    assert!(phases.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn page_context_loads_content_scripts() {
    let engine = Arc::new(RecordingEngine::default());
    let runner = PreviewRunner::new(RunnerConfig::default()).with_engine(engine.clone());
    let files = FileSet::new(vec![
        FileEntry::new(
            "manifest.json",
            r#"{"manifest_version": 3, "content_scripts": [{"matches": ["<all_urls>"], "js": ["content.js"]}]}"#,
        ),
        FileEntry::new("popup.js", ""),
        FileEntry::new("content.js", ""),
    ]);
    let handle = runner.generate(&files, AdmissionMode::New).await.unwrap();

    assert_eq!(
        engine.paths(ContextId::Popup),
        vec!["__preview__/shim.js", "popup.js", "__preview__/bindings.js"]
    );
    assert_eq!(
        engine.paths(ContextId::Page),
        vec!["__preview__/shim.js", "content.js", "__preview__/bindings.js"]
    );
    let inspection = runner.inspect(&handle);
    assert_eq!(
        inspection.page_scripts,
        Some(vec![
            "__preview__/shim.js".to_string(),
            "content.js".to_string(),
            "__preview__/bindings.js".to_string()
        ])
    );
}

// --- readiness ---
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readiness_timeout_keeps_previous_generation() {
    let config = RunnerConfig {
        ready_timeout: Duration::from_millis(50),
        ..RunnerConfig::default()
    };
    let runner = PreviewRunner::new(config).with_engine(Arc::new(SlowEngine));
    let handle = runner
        .generate(&minimal_bundle(), AdmissionMode::New)
        .await
        .unwrap();
    let live = handle.generation().unwrap();

    let slow = FileSet::new(vec![manifest(), FileEntry::new("popup.js", "hang();")]);
    let err = runner
        .rebuild(&handle, &slow, AdmissionMode::New)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "READINESS_TIMEOUT");
    assert_eq!(handle.generation(), Some(live));
    assert_eq!(
        runner.materializer().total_live(),
        runner.materializer().live_references(live)
    );
}

#[tokio::test]
async fn rendered_popup_carries_policy_and_references_only() {
    let runner = PreviewRunner::new(RunnerConfig::default());
    let files = FileSet::new(vec![
        manifest(),
        FileEntry::new(
            "popup.html",
            r#"<html><head><title>Counter</title></head><body><button onclick="go()">Go</button><script>alert(1)</script><script src="popup.js"></script></body></html>"#,
        ),
        FileEntry::new("popup.js", "function go() {}"),
    ]);
    let handle = runner.generate(&files, AdmissionMode::New).await.unwrap();

    let documents = handle.documents();
    assert_eq!(documents.len(), 1);
    let html = &documents[0].1;
    assert!(html.contains("script-src blob:"));
    assert!(!html.contains("unsafe-inline"));
    assert!(!html.contains("alert(1)"));
    assert!(!html.contains("onclick"));
    assert!(html.contains("<title>Counter</title>"));

    let inspection = runner.inspect(&handle);
    assert!(inspection.warnings.len() >= 2, "{:?}", inspection.warnings);
}
