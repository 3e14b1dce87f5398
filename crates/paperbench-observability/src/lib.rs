use std::path::Path;

use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Which binary entry point is initializing logging. Each gets its own
/// `tracing` target prefix so `run-eval`, `run-judge`, and `run-monitor`
/// logs can be told apart when redirected to the same file.
#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Eval,
    Judge,
    Monitor,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Eval => "run-eval",
            ProcessKind::Judge => "run-judge",
            ProcessKind::Monitor => "run-monitor",
        }
    }
}

/// A structured event describing one phase transition or operation in
/// the orchestrator. Every field besides `event`/`component` is
/// optional because not every phase has a paper/attempt/leaf context.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub run_id: Option<&'a str>,
    pub paper_id: Option<&'a str>,
    pub group_id: Option<&'a str>,
    pub phase: Option<&'a str>,
    pub status: Option<&'a str>,
    pub detail: Option<&'a str>,
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    match level {
        Level::ERROR => tracing::error!(
            target: "paperbench.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            run_id = event.run_id.unwrap_or(""),
            paper_id = event.paper_id.unwrap_or(""),
            group_id = event.group_id.unwrap_or(""),
            phase = event.phase.unwrap_or(""),
            status = event.status.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
        Level::WARN => tracing::warn!(
            target: "paperbench.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            run_id = event.run_id.unwrap_or(""),
            paper_id = event.paper_id.unwrap_or(""),
            group_id = event.group_id.unwrap_or(""),
            phase = event.phase.unwrap_or(""),
            status = event.status.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
        _ => tracing::info!(
            target: "paperbench.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            run_id = event.run_id.unwrap_or(""),
            paper_id = event.paper_id.unwrap_or(""),
            group_id = event.group_id.unwrap_or(""),
            phase = event.phase.unwrap_or(""),
            status = event.status.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
    }
}

/// Redact a secret-shaped value (API keys, tokens) before it could ever
/// reach a log line. The core forwards environment-sourced credentials
/// into sandbox environments (§6 "Environment") but must never log
/// their values; call sites that handle such values route them through
/// this function rather than logging them directly.
pub fn redact_secret(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!("[redacted len={}]", trimmed.len())
}

/// Install a process-wide `tracing` subscriber. Pretty-printed to an
/// interactive terminal; newline-delimited JSON when
/// `PAPERBENCH_LOG_FORMAT=json` is set or stdout is not a TTY, so CI and
/// log-aggregation pipelines get structured records without code
/// changes at call sites.
pub fn init_logging(process: ProcessKind) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let want_json = std::env::var("PAPERBENCH_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);

    if want_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .with_current_span(false),
            )
            .try_init()
            .ok();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false),
            )
            .try_init()
            .ok();
    }

    tracing::debug!(process = process.as_str(), "logging initialized");
    Ok(())
}

pub fn canonical_logs_dir_from_root(root: &Path) -> std::path::PathBuf {
    root.join("logs")
}
