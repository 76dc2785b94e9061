#![warn(missing_docs)]

//! preview - validate, assemble and inspect extension preview bundles
//!
//! Reads a FileSet JSON document from disk and runs it through the same
//! admission, materialization and assembly pipeline the embedded preview uses.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use preview_config::PreviewConfig;
use preview_sandbox::assembler::DocumentKind;
use preview_sandbox::shim::PageSnapshot;
use preview_sandbox::{
    validate, AdmissionLimits, AdmissionMode, FileSet, PreviewHandle, PreviewRunner, RunnerConfig,
    StatePersistence,
};
use tracing_subscriber::EnvFilter;

/// preview - sandboxed extension preview tooling
#[derive(Parser, Debug)]
#[command(name = "preview")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a preview.toml (defaults to $PREVIEW_CONFIG, then ./preview.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check a file set against the admission rules
    Validate {
        /// FileSet JSON file
        file_set: PathBuf,

        /// Admission mode
        #[arg(long, value_enum, default_value = "new")]
        mode: ModeArg,
    },

    /// Assemble a preview and write its documents
    Build {
        /// FileSet JSON file
        file_set: PathBuf,

        /// Admission mode
        #[arg(long, value_enum, default_value = "new")]
        mode: ModeArg,

        /// Directory to write rendered documents and the resource listing into
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Assemble a preview and print its inspection as JSON
    Inspect {
        /// FileSet JSON file
        file_set: PathBuf,

        /// Admission mode
        #[arg(long, value_enum, default_value = "new")]
        mode: ModeArg,

        /// Full bundle to build first; `file_set` is then applied as a rebuild
        #[arg(long)]
        base: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    New,
    Edit,
}

impl From<ModeArg> for AdmissionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::New => AdmissionMode::New,
            ModeArg::Edit => AdmissionMode::Edit,
        }
    }
}

/// Locate the config file.
///
/// Search order:
/// 1. `PREVIEW_CONFIG` environment variable
/// 2. `./preview.toml` in the current directory
/// 3. None (no config file found, not an error)
fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("PREVIEW_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let cwd = PathBuf::from("preview.toml");
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

fn load_config(explicit: Option<&Path>) -> Result<PreviewConfig> {
    let path = explicit.map(Path::to_path_buf).or_else(find_config_file);
    match path {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            PreviewConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            tracing::debug!("no config file found, using defaults");
            Ok(PreviewConfig::default())
        }
    }
}

/// Convert a KiB setting to bytes.
fn kib_to_bytes(name: &str, kb: usize) -> Result<usize> {
    kb.checked_mul(1024)
        .with_context(|| format!("{name} = {kb} is too large"))
}

/// Build AdmissionLimits from config overrides.
fn build_limits(overrides: &preview_config::AdmissionOverrides) -> Result<AdmissionLimits> {
    let mut limits = AdmissionLimits::default();
    if let Some(max) = overrides.max_files {
        limits.max_files = max;
    }
    if let Some(kb) = overrides.max_total_kb {
        limits.max_total_bytes = kib_to_bytes("admission.max_total_kb", kb)?;
    }
    if let Some(kb) = overrides.max_file_kb {
        limits.max_file_bytes = kib_to_bytes("admission.max_file_kb", kb)?;
    }
    Ok(limits)
}

/// Build RunnerConfig from the whole config file.
fn build_runner_config(config: &PreviewConfig) -> Result<RunnerConfig> {
    let mut runner = RunnerConfig {
        limits: build_limits(&config.admission)?,
        ..RunnerConfig::default()
    };

    if let Some(ms) = config.bridge.response_timeout_ms {
        runner.response_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = config.runner.ready_timeout_ms {
        runner.ready_timeout = Duration::from_millis(ms);
    }
    if let Some(ref policy) = config.runner.state_persistence {
        runner.state_persistence = policy
            .parse::<StatePersistence>()
            .map_err(anyhow::Error::msg)?;
    }
    if let Some(capacity) = config.runner.capability_log_capacity {
        runner.capability_log_capacity = capacity;
    }

    if let Some(max) = config.storage.max_keys {
        runner.storage.max_keys = max;
    }
    if let Some(kb) = config.storage.max_value_kb {
        runner.storage.max_value_size = kib_to_bytes("storage.max_value_kb", kb)?;
    }
    if let Some(kb) = config.storage.max_total_kb {
        runner.storage.max_total_size = kib_to_bytes("storage.max_total_kb", kb)?;
    }

    let default_page = PageSnapshot::default();
    runner.page = PageSnapshot {
        url: config.page.url.clone().unwrap_or(default_page.url),
        title: config.page.title.clone().unwrap_or(default_page.title),
        markup: default_page.markup,
    };

    Ok(runner)
}

fn read_file_set(path: &Path) -> Result<FileSet> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    FileSet::from_json(&json).with_context(|| format!("{} is not a file set", path.display()))
}

/// Write rendered documents and `resources.json` into `out`.
fn write_build_output(out: &Path, handle: &PreviewHandle) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(out)
        .with_context(|| format!("failed to create {}", out.display()))?;

    let mut written = Vec::new();
    for (kind, html) in handle.documents() {
        let name = match kind {
            DocumentKind::Popup => "popup.html",
            DocumentKind::Page => "page.html",
        };
        let path = out.join(name);
        std::fs::write(&path, html).with_context(|| format!("failed to write {}", path.display()))?;
        written.push(path);
    }

    let listing = serde_json::to_string_pretty(&handle.resources())?;
    let path = out.join("resources.json");
    std::fs::write(&path, listing).with_context(|| format!("failed to write {}", path.display()))?;
    written.push(path);

    Ok(written)
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let runner_config = build_runner_config(&config)?;

    match cli.command {
        Commands::Validate { file_set, mode } => {
            let files = read_file_set(&file_set)?;
            let admitted = validate(&files, mode.into(), &runner_config.limits)
                .with_context(|| format!("{} was refused", file_set.display()))?;
            let summary = serde_json::json!({
                "files": admitted.len(),
                "totalBytes": admitted.total_bytes(),
                "name": admitted.descriptor().and_then(|d| d.name.clone()),
                "summary": admitted.summary(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Build {
            file_set,
            mode,
            out,
        } => {
            let files = read_file_set(&file_set)?;
            let runner = PreviewRunner::new(runner_config);
            let handle = runner
                .generate(&files, mode.into())
                .await
                .with_context(|| format!("failed to build {}", file_set.display()))?;

            if let Some(out) = out {
                for path in write_build_output(&out, &handle)? {
                    tracing::info!(path = %path.display(), "written");
                }
            }
            let inspection = runner.inspect(&handle);
            for warning in &inspection.warnings {
                tracing::warn!(%warning, "assembly warning");
            }
            println!("{}", serde_json::to_string_pretty(&inspection)?);
            runner.dispose(&handle).await;
        }
        Commands::Inspect {
            file_set,
            mode,
            base,
        } => {
            let runner = PreviewRunner::new(runner_config);
            let handle = match base {
                Some(base) => {
                    let base_files = read_file_set(&base)?;
                    let handle = runner
                        .generate(&base_files, AdmissionMode::New)
                        .await
                        .with_context(|| format!("failed to build {}", base.display()))?;
                    let delta = read_file_set(&file_set)?;
                    runner
                        .rebuild(&handle, &delta, mode.into())
                        .await
                        .with_context(|| format!("failed to apply {}", file_set.display()))?
                }
                None => {
                    let files = read_file_set(&file_set)?;
                    runner
                        .generate(&files, mode.into())
                        .await
                        .with_context(|| format!("failed to build {}", file_set.display()))?
                }
            };
            println!("{}", serde_json::to_string_pretty(&runner.inspect(&handle))?);
            runner.dispose(&handle).await;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    run(Cli::parse()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUNDLE: &str = r#"{
        "files": [
            {"path": "manifest.json", "content": "{\"manifest_version\": 3, \"name\": \"Demo\"}"},
            {"path": "popup.html", "content": "<html><body><script src=\"popup.js\"></script></body></html>"},
            {"path": "popup.js", "content": "var n = 1;"}
        ],
        "summary": "demo bundle"
    }"#;

    #[test]
    fn build_runner_config_defaults() {
        let config = build_runner_config(&PreviewConfig::default()).unwrap();
        let default = RunnerConfig::default();
        assert_eq!(config.limits.max_files, default.limits.max_files);
        assert_eq!(config.limits.max_total_bytes, default.limits.max_total_bytes);
        assert_eq!(config.response_timeout, default.response_timeout);
        assert_eq!(config.ready_timeout, default.ready_timeout);
        assert_eq!(config.state_persistence, StatePersistence::Reset);
        assert_eq!(config.page, PageSnapshot::default());
    }

    #[test]
    fn build_runner_config_applies_overrides() {
        let toml = r#"
            [admission]
            max_total_kb = 100
            [bridge]
            response_timeout_ms = 250
            [runner]
            state_persistence = "carry_forward"
            capability_log_capacity = 8
            [storage]
            max_value_kb = 2
            [page]
            title = "Recipes"
        "#;
        let config = build_runner_config(&PreviewConfig::from_toml(toml).unwrap()).unwrap();
        assert_eq!(config.limits.max_total_bytes, 100 * 1024);
        assert_eq!(config.response_timeout, Duration::from_millis(250));
        assert_eq!(config.state_persistence, StatePersistence::CarryForward);
        assert_eq!(config.capability_log_capacity, 8);
        assert_eq!(config.storage.max_value_size, 2048);
        assert_eq!(config.page.title, "Recipes");
        assert_eq!(config.page.url, "https://example.com/");
    }

    #[test]
    fn oversized_kib_setting_is_an_error() {
        let mut config = PreviewConfig::default();
        config.storage.max_total_kb = Some(usize::MAX);
        let err = build_runner_config(&config).unwrap_err();
        assert!(err.to_string().contains("storage.max_total_kb"));

        let mut config = PreviewConfig::default();
        config.admission.max_file_kb = Some(usize::MAX / 512);
        assert!(build_runner_config(&config).is_err());
    }

    #[test]
    fn read_file_set_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{\"files\": 3}").unwrap();
        let err = read_file_set(&path).unwrap_err();
        assert!(format!("{err:#}").contains("broken.json"));
    }

    #[test]
    fn explicit_config_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.toml");
        std::fs::write(&path, "[admission]\nmax_files = 5\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.admission.max_files, Some(5));

        std::fs::write(&path, "[runner]\nstate_persistence = \"forever\"\n").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }

    #[tokio::test]
    async fn build_writes_documents_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("bundle.json");
        std::fs::write(&input, BUNDLE).unwrap();

        let runner = PreviewRunner::new(RunnerConfig::default());
        let handle = runner
            .generate(&read_file_set(&input).unwrap(), AdmissionMode::New)
            .await
            .unwrap();
        let out = dir.path().join("out");
        let written = write_build_output(&out, &handle).unwrap();
        assert_eq!(written.len(), 2);

        let popup = std::fs::read_to_string(out.join("popup.html")).unwrap();
        assert!(popup.contains("Content-Security-Policy"));
        assert!(popup.contains("data-path=\"popup.js\""));

        let listing: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out.join("resources.json")).unwrap())
                .unwrap();
        assert_eq!(listing.as_array().unwrap().len(), 3);
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["preview", "build", "b.json", "--mode", "edit", "--out", "dist"])
            .unwrap();
        match cli.command {
            Commands::Build { mode, out, .. } => {
                assert!(matches!(mode, ModeArg::Edit));
                assert_eq!(out, Some(PathBuf::from("dist")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
