//! Structured logging and event emission shared by every Overlord process.
//! One JSON-lines log per process kind on disk, plus a compact console
//! layer, with a small vocabulary of domain events (budget warnings,
//! scheduled-sweep summaries, release notes) layered on top of `tracing`.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    /// `overlord-daemon`'s long-running scheduler/cleanup/chat-integration process.
    Daemon,
    /// The chat-channel listener/router process (may be co-hosted with Daemon).
    Channels,
    /// The `engine` CLI binary, one-shot invocations.
    Engine,
    /// A single `dispatch` lifecycle run (invoked from the CLI or the daemon).
    Dispatch,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Daemon => "daemon",
            ProcessKind::Channels => "channels",
            ProcessKind::Engine => "engine",
            ProcessKind::Dispatch => "dispatch",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub task_id: Option<&'a str>,
    pub project: Option<&'a str>,
    pub worker: Option<&'a str>,
    pub model: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

impl<'a> ObservabilityEvent<'a> {
    pub fn new(event: &'a str, component: &'a str) -> Self {
        Self {
            event,
            component,
            task_id: None,
            project: None,
            worker: None,
            model: None,
            status: None,
            error_code: None,
            detail: None,
        }
    }

    pub fn task_id(mut self, task_id: &'a str) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn project(mut self, project: &'a str) -> Self {
        self.project = Some(project);
        self
    }

    pub fn worker(mut self, worker: &'a str) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn model(mut self, model: &'a str) -> Self {
        self.model = Some(model);
        self
    }

    pub fn status(mut self, status: &'a str) -> Self {
        self.status = Some(status);
        self
    }

    pub fn error_code(mut self, error_code: &'a str) -> Self {
        self.error_code = Some(error_code);
        self
    }

    pub fn detail(mut self, detail: &'a str) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Masks free-form content before it's logged, keeping only its length and
/// a stable, non-reversible fingerprint — used for task descriptions, chat
/// message bodies, and anything else that might carry project-private text.
pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!("[redacted len={} hash={}]", trimmed.len(), short_hash(trimmed))
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    match level {
        Level::ERROR => tracing::error!(
            target: "overlord.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            task_id = event.task_id.unwrap_or(""),
            project = event.project.unwrap_or(""),
            worker = event.worker.unwrap_or(""),
            model = event.model.unwrap_or(""),
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
        Level::WARN => tracing::warn!(
            target: "overlord.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            task_id = event.task_id.unwrap_or(""),
            project = event.project.unwrap_or(""),
            worker = event.worker.unwrap_or(""),
            model = event.model.unwrap_or(""),
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
        _ => tracing::info!(
            target: "overlord.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            task_id = event.task_id.unwrap_or(""),
            project = event.project.unwrap_or(""),
            worker = event.worker.unwrap_or(""),
            model = event.model.unwrap_or(""),
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
    }
}

/// Routes a cost-ceiling warning through the same event stream as every
/// other sweep/summary notification, rather than a bespoke channel.
pub fn emit_budget_warning(project: &str, spend_usd: f64, ceiling_usd: f64, pct: f64) {
    let detail = format!("spend=${spend_usd:.2} ceiling=${ceiling_usd:.2} ({pct:.0}% of ceiling)");
    emit_event(
        Level::WARN,
        ProcessKind::Daemon,
        ObservabilityEvent::new("budget_warning", "cost_controls").project(project).detail(&detail),
    );
}

/// Records an ecosystem observation ("memory entry" in the original's
/// vocabulary) — scheduled-sweep summaries and detection findings, not a
/// dedicated memory store.
pub fn emit_memory_entry(category: &str, project: Option<&str>, content: &str) {
    let mut event = ObservabilityEvent::new("memory_entry", category).detail(content);
    if let Some(project) = project {
        event = event.project(project);
    }
    emit_event(Level::INFO, ProcessKind::Daemon, event);
}

pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    cleanup_old_jsonl(logs_dir, process.as_str(), retention_days)?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(format!("overlord.{}", process.as_str()))
        .filename_suffix("jsonl")
        .build(logs_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    let console_layer = tracing_subscriber::fmt::layer().compact().with_target(true).with_ansi(true);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry().with(filter).with(console_layer).with(file_layer).try_init().ok();

    let info = LoggingInitInfo {
        process: process.as_str().to_string(),
        logs_dir: logs_dir.display().to_string(),
        prefix: format!("overlord.{}", process.as_str()),
        retention_days,
        initialized_at: Utc::now(),
    };

    Ok((guard, info))
}

fn cleanup_old_jsonl(logs_dir: &Path, process: &str, retention_days: u64) -> anyhow::Result<()> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    let prefix = format!("overlord.{}.", process);

    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        if !name.starts_with(&prefix) || !name.ends_with(".jsonl") {
            continue;
        }

        let date_part = name.trim_start_matches(&prefix).trim_end_matches(".jsonl");
        let Ok(date) = chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else { continue };
        let Some(dt) = date.and_hms_opt(0, 0, 0) else { continue };

        if DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc) < cutoff {
            let _ = fs::remove_file(path);
        }
    }

    Ok(())
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryHit {
    pub timestamp: String,
    pub category: String,
    pub project: Option<String>,
    pub content: String,
}

/// Scans the daemon's JSONL log files for `memory_entry` events whose
/// category, project, or detail text contains `query` (case-insensitive).
/// Newest files are read first; stops once `limit` hits are collected.
/// There is no dedicated memory store — this *is* the search.
pub fn search_memory(logs_dir: &Path, query: &str, limit: usize) -> Vec<MemoryHit> {
    let query = query.to_lowercase();
    let prefix = format!("overlord.{}.", ProcessKind::Daemon.as_str());

    let mut files: Vec<PathBuf> = match fs::read_dir(logs_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".jsonl")))
            .collect(),
        Err(_) => return Vec::new(),
    };
    files.sort();
    files.reverse();

    let mut hits = Vec::new();
    for path in files {
        let Ok(content) = fs::read_to_string(&path) else { continue };
        for line in content.lines().rev() {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else { continue };
            let fields = &value["fields"];
            if fields["event"].as_str() != Some("memory_entry") {
                continue;
            }

            let category = fields["component"].as_str().unwrap_or("").to_string();
            let project = fields["project"].as_str().filter(|s| !s.is_empty()).map(str::to_string);
            let detail = fields["detail"].as_str().unwrap_or("");
            let haystack = format!("{category} {} {detail}", project.as_deref().unwrap_or("")).to_lowercase();

            if haystack.contains(&query) {
                hits.push(MemoryHit {
                    timestamp: value["timestamp"].as_str().unwrap_or("").to_string(),
                    category,
                    project,
                    content: detail.to_string(),
                });
                if hits.len() >= limit {
                    return hits;
                }
            }
        }
    }
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_text_masks_content() {
        let raw = "super-secret-task-description";
        let redacted = redact_text(raw);
        assert!(redacted.contains("[redacted len="));
        assert!(!redacted.contains("super-secret-task-description"));
    }

    #[test]
    fn canonical_logs_dir_joins_logs_folder() {
        let root = PathBuf::from("/tmp/overlord");
        assert_eq!(canonical_logs_dir_from_root(&root), PathBuf::from("/tmp/overlord").join("logs"));
    }

    #[test]
    fn redact_text_is_stable_for_same_input() {
        assert_eq!(redact_text("same input"), redact_text("same input"));
    }

    #[test]
    fn search_memory_matches_detail_text() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("overlord.daemon.2026-07-30.jsonl");
        let line = serde_json::json!({
            "timestamp": "2026-07-30T12:00:00Z",
            "fields": {
                "event": "memory_entry",
                "component": "release",
                "project": "core",
                "detail": "core v1.2.0 released",
            }
        });
        fs::write(&path, format!("{}\n", line)).unwrap();

        let hits = search_memory(tmp.path(), "released", 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].category, "release");

        assert!(search_memory(tmp.path(), "nonexistent-term", 5).is_empty());
    }
}
