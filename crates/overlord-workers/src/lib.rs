//! Worker backends behind one uniform `execute` contract: a subprocess CLI
//! adapter (Claude Code), an OpenAI-compatible HTTP adapter (a local/TabbyAPI
//! endpoint), and a native-REST "SDK" adapter (Gemini). All three share the
//! same model-selection priority: explicit override > per-task-type override
//! > configured default.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use overlord_config::WorkerConfig;
use overlord_types::{Tier, WorkerKind, WorkerResult};
use serde_json::json;
use thiserror::Error;
use tokio::process::Command;

pub mod model_router;
pub use model_router::{ModelEndpoint, ModelRouter};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("no worker named '{0}' is configured")]
    Unknown(String),
    #[error("worker '{0}' is not available")]
    Unavailable(WorkerKind),
    #[error("fallback chain exhausted; no configured worker is available")]
    ChainExhausted,
}

/// explicit > task-type override > default.
fn select_model(config: &WorkerConfig, task_type: &str, explicit: Option<&str>) -> String {
    if let Some(model) = explicit.map(str::trim).filter(|m| !m.is_empty()) {
        return model.to_string();
    }
    config
        .model_overrides
        .get(task_type)
        .cloned()
        .unwrap_or_else(|| config.default_model.clone())
}

#[async_trait]
pub trait Worker: Send + Sync {
    fn kind(&self) -> WorkerKind;
    fn available(&self) -> bool;
    async fn execute(
        &self,
        prompt: &str,
        project_path: &Path,
        task_type: &str,
        model: Option<&str>,
    ) -> WorkerResult;
}

fn failure(kind: WorkerKind, error: impl Into<String>) -> WorkerResult {
    WorkerResult {
        success: false,
        output: String::new(),
        error: Some(error.into()),
        duration_ms: 0,
        model_used: String::new(),
        worker_type: kind.to_string(),
        tokens_input: 0,
        tokens_output: 0,
        tokens_total: 0,
    }
}

/// Invokes an installed native binary: `<binary> -p <prompt> --model <model>
/// --print`, run in `project_path` if it exists.
pub struct SubprocessWorker {
    kind: WorkerKind,
    config: WorkerConfig,
    binary: Option<std::path::PathBuf>,
}

impl SubprocessWorker {
    pub fn new(kind: WorkerKind, config: WorkerConfig) -> Self {
        let binary = if config.enabled {
            let candidate = config
                .binary_path
                .clone()
                .unwrap_or_else(|| std::path::PathBuf::from(kind.to_string()));
            which::which(&candidate).ok()
        } else {
            None
        };
        if config.enabled && binary.is_none() {
            tracing::warn!(worker = %kind, "binary not found on PATH; worker disabled");
        }
        Self { kind, config, binary }
    }
}

#[async_trait]
impl Worker for SubprocessWorker {
    fn kind(&self) -> WorkerKind {
        self.kind
    }

    fn available(&self) -> bool {
        self.config.enabled && self.binary.is_some()
    }

    async fn execute(
        &self,
        prompt: &str,
        project_path: &Path,
        task_type: &str,
        model: Option<&str>,
    ) -> WorkerResult {
        let Some(binary) = &self.binary else {
            return failure(self.kind, format!("{} worker is not available", self.kind));
        };
        let selected_model = select_model(&self.config, task_type, model);

        let mut cmd = Command::new(binary);
        cmd.arg("-p")
            .arg(prompt)
            .arg("--model")
            .arg(&selected_model)
            .arg("--print")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if project_path.exists() {
            cmd.current_dir(project_path);
        }

        let start = Instant::now();
        let run = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            cmd.output(),
        )
        .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match run {
            Err(_) => {
                let mut result =
                    failure(self.kind, format!("timed out after {}s", self.config.timeout_secs));
                result.model_used = selected_model;
                result.duration_ms = duration_ms;
                result
            }
            Ok(Err(io_err)) => {
                let mut result = failure(self.kind, format!("failed to launch {}: {io_err}", self.kind));
                result.model_used = selected_model;
                result.duration_ms = duration_ms;
                result
            }
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if output.status.success() {
                    WorkerResult {
                        success: true,
                        output: stdout,
                        error: None,
                        duration_ms,
                        model_used: selected_model,
                        worker_type: self.kind.to_string(),
                        tokens_input: 0,
                        tokens_output: 0,
                        tokens_total: 0,
                    }
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                    let error = if stderr.is_empty() {
                        format!("exit code {}", output.status.code().unwrap_or(-1))
                    } else {
                        stderr
                    };
                    WorkerResult {
                        success: false,
                        output: stdout,
                        error: Some(error),
                        duration_ms,
                        model_used: selected_model,
                        worker_type: self.kind.to_string(),
                        tokens_input: 0,
                        tokens_output: 0,
                        tokens_total: 0,
                    }
                }
            }
        }
    }
}

/// OpenAI-compatible `/chat/completions` HTTP backend. Health is probed once
/// at construction with a GET to `/models`.
pub struct HttpWorker {
    kind: WorkerKind,
    config: WorkerConfig,
    endpoint: String,
    client: reqwest::Client,
    available: bool,
}

impl HttpWorker {
    pub async fn new(kind: WorkerKind, config: WorkerConfig) -> Self {
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| "http://localhost:5000/v1".to_string())
            .trim_end_matches('/')
            .to_string();
        let client = reqwest::Client::new();
        let available = if config.enabled {
            Self::check_health(&client, &endpoint, config.api_key.as_deref()).await
        } else {
            false
        };
        Self { kind, config, endpoint, client, available }
    }

    async fn check_health(client: &reqwest::Client, endpoint: &str, api_key: Option<&str>) -> bool {
        let mut req = client
            .get(format!("{endpoint}/models"))
            .timeout(Duration::from_secs(5));
        if let Some(key) = api_key {
            req = req.bearer_auth(key);
        }
        match req.send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), %endpoint, "local endpoint health check failed");
                false
            }
            Err(err) => {
                tracing::warn!(%endpoint, error = %err, "local endpoint unreachable");
                false
            }
        }
    }
}

#[async_trait]
impl Worker for HttpWorker {
    fn kind(&self) -> WorkerKind {
        self.kind
    }

    fn available(&self) -> bool {
        self.available
    }

    async fn execute(
        &self,
        prompt: &str,
        project_path: &Path,
        task_type: &str,
        model: Option<&str>,
    ) -> WorkerResult {
        if !self.available {
            return failure(self.kind, format!("{} worker is not available", self.kind));
        }
        let selected_model = select_model(&self.config, task_type, model);
        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&json!({
                "model": selected_model,
                "messages": [
                    {"role": "system", "content": format!("Working directory: {}", project_path.display())},
                    {"role": "user", "content": prompt},
                ],
                "max_tokens": 4096,
            }));
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }

        let start = Instant::now();
        let response = req.send().await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let response = match response {
            Ok(r) => r,
            Err(err) if err.is_timeout() => {
                let mut result =
                    failure(self.kind, format!("timed out after {}s", self.config.timeout_secs));
                result.model_used = selected_model;
                result.duration_ms = duration_ms;
                return result;
            }
            Err(err) => {
                let mut result = failure(self.kind, format!("http error: {err}"));
                result.model_used = selected_model;
                result.duration_ms = duration_ms;
                return result;
            }
        };

        let status = response.status();
        let body: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(err) => {
                let mut result = failure(self.kind, format!("invalid response body: {err}"));
                result.model_used = selected_model;
                result.duration_ms = duration_ms;
                return result;
            }
        };

        if !status.is_success() {
            let mut result = failure(self.kind, format!("HTTP {status}: {}", truncate(&body.to_string(), 500)));
            result.model_used = selected_model;
            result.duration_ms = duration_ms;
            return result;
        }

        let content = body["choices"][0]["message"]["content"].as_str().unwrap_or_default();
        let usage = body.get("usage");
        let tokens_input = usage.and_then(|u| u["prompt_tokens"].as_u64()).unwrap_or(0);
        let tokens_output = usage.and_then(|u| u["completion_tokens"].as_u64()).unwrap_or(0);

        WorkerResult {
            success: true,
            output: content.trim().to_string(),
            error: None,
            duration_ms,
            model_used: selected_model,
            worker_type: self.kind.to_string(),
            tokens_input,
            tokens_output,
            tokens_total: tokens_input + tokens_output,
        }
    }
}

/// Native REST call against a provider's own API shape (Google's
/// `generateContent`), surfacing token counts from the response metadata.
pub struct SdkWorker {
    kind: WorkerKind,
    config: WorkerConfig,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl SdkWorker {
    pub fn new(kind: WorkerKind, config: WorkerConfig, env_var: &str) -> Self {
        let api_key = if config.enabled {
            config.api_key.clone().or_else(|| std::env::var(env_var).ok())
                .filter(|k| !k.trim().is_empty())
        } else {
            None
        };
        if config.enabled && api_key.is_none() {
            tracing::warn!(worker = %kind, %env_var, "no API key found; worker disabled");
        }
        Self { kind, config, api_key, client: reqwest::Client::new() }
    }
}

#[async_trait]
impl Worker for SdkWorker {
    fn kind(&self) -> WorkerKind {
        self.kind
    }

    fn available(&self) -> bool {
        self.config.enabled && self.api_key.is_some()
    }

    async fn execute(
        &self,
        prompt: &str,
        _project_path: &Path,
        task_type: &str,
        model: Option<&str>,
    ) -> WorkerResult {
        let Some(api_key) = &self.api_key else {
            return failure(self.kind, format!("{} worker is not available", self.kind));
        };
        let selected_model = select_model(&self.config, task_type, model);
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{selected_model}:generateContent?key={api_key}"
        );

        let start = Instant::now();
        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&json!({
                "contents": [{"parts": [{"text": prompt}]}],
            }))
            .send()
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let response = match response {
            Ok(r) => r,
            Err(err) if err.is_timeout() => {
                let mut result =
                    failure(self.kind, format!("timed out after {}s", self.config.timeout_secs));
                result.model_used = selected_model;
                result.duration_ms = duration_ms;
                return result;
            }
            Err(err) => {
                let mut result = failure(self.kind, format!("http error: {err}"));
                result.model_used = selected_model;
                result.duration_ms = duration_ms;
                return result;
            }
        };

        let status = response.status();
        let body: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(err) => {
                let mut result = failure(self.kind, format!("invalid response body: {err}"));
                result.model_used = selected_model;
                result.duration_ms = duration_ms;
                return result;
            }
        };

        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("request failed");
            let mut result = failure(self.kind, format!("HTTP {status}: {message}"));
            result.model_used = selected_model;
            result.duration_ms = duration_ms;
            return result;
        }

        let content = body["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or_default();
        let tokens_input = body["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0);
        let tokens_output = body["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0);
        let tokens_total = body["usageMetadata"]["totalTokenCount"]
            .as_u64()
            .unwrap_or(tokens_input + tokens_output);

        WorkerResult {
            success: true,
            output: content.trim().to_string(),
            error: None,
            duration_ms,
            model_used: selected_model,
            worker_type: self.kind.to_string(),
            tokens_input,
            tokens_output,
            tokens_total,
        }
    }
}

fn truncate(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        format!("{}...", &input[..max_len])
    }
}

/// Fixed fallback order for worker selection (spec §4.2 step 4).
pub const FALLBACK_ORDER: &[WorkerKind] = &[WorkerKind::Claude, WorkerKind::Gemini, WorkerKind::Local];

/// Keyword-based tier inference, first hit wins, falling back to a
/// complexity-based default (spec §4.2 "tier map").
pub fn infer_tier(task_type: &str, complexity: &str) -> Tier {
    let t = task_type.to_ascii_lowercase();
    if ["format", "lint", "boilerplate"].iter().any(|k| t.contains(k)) {
        return Tier::Local;
    }
    if t.contains("review") {
        return Tier::CloudFast;
    }
    if t.contains("architecture") || t.contains("planning") {
        return Tier::CloudHeavy;
    }
    match complexity.to_ascii_lowercase().as_str() {
        "low" => Tier::Local,
        "high" => Tier::CloudHeavy,
        _ => Tier::CloudFast,
    }
}

/// Preferred worker kind for a routing tier: `local` stays on the HTTP-backed
/// local endpoint; both cloud tiers prefer Claude, with `cloud-heavy` additionally
/// forcing the heavy model (handled by the dispatcher, not here).
pub fn tier_preferred_worker(tier: Tier) -> WorkerKind {
    match tier {
        Tier::Local => WorkerKind::Local,
        Tier::CloudFast | Tier::CloudHeavy => WorkerKind::Claude,
    }
}

/// Holds the configured worker backends and implements the
/// explicit-name/tier/fallback-chain selection policy.
pub struct WorkerRegistry {
    workers: Vec<Box<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new(workers: Vec<Box<dyn Worker>>) -> Self {
        Self { workers }
    }

    pub async fn from_config(
        config: &std::collections::HashMap<WorkerKind, WorkerConfig>,
    ) -> Self {
        let mut workers: Vec<Box<dyn Worker>> = Vec::new();
        if let Some(cfg) = config.get(&WorkerKind::Claude) {
            workers.push(Box::new(SubprocessWorker::new(WorkerKind::Claude, cfg.clone())));
        }
        if let Some(cfg) = config.get(&WorkerKind::Gemini) {
            workers.push(Box::new(SdkWorker::new(WorkerKind::Gemini, cfg.clone(), "GOOGLE_API_KEY")));
        }
        if let Some(cfg) = config.get(&WorkerKind::Local) {
            workers.push(Box::new(HttpWorker::new(WorkerKind::Local, cfg.clone()).await));
        }
        Self { workers }
    }

    pub fn get(&self, kind: WorkerKind) -> Option<&dyn Worker> {
        self.workers.iter().find(|w| w.kind() == kind).map(|w| w.as_ref())
    }

    pub fn is_available(&self, kind: WorkerKind) -> bool {
        self.get(kind).map(|w| w.available()).unwrap_or(false)
    }

    /// `worker_name` given: use it iff available, else error. Otherwise walk
    /// the fixed fallback order and take the first available worker.
    pub fn select(&self, explicit: Option<WorkerKind>) -> Result<&dyn Worker, WorkerError> {
        if let Some(kind) = explicit {
            return self
                .get(kind)
                .filter(|w| w.available())
                .ok_or(WorkerError::Unavailable(kind));
        }
        for kind in FALLBACK_ORDER {
            if let Some(worker) = self.get(*kind) {
                if worker.available() {
                    return Ok(worker);
                }
            }
        }
        Err(WorkerError::ChainExhausted)
    }

    /// Reviewer selection: a worker different from the executor, if any is
    /// available (spec §4.2 step 10).
    pub fn select_reviewer(&self, executor: WorkerKind) -> Option<&dyn Worker> {
        FALLBACK_ORDER
            .iter()
            .filter(|k| **k != executor)
            .find_map(|k| self.get(*k).filter(|w| w.available()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(enabled: bool) -> WorkerConfig {
        WorkerConfig {
            enabled,
            binary_path: None,
            default_model: "default-model".to_string(),
            model_overrides: [("review".to_string(), "review-model".to_string())].into(),
            timeout_secs: 60,
            endpoint: None,
            api_key: None,
            api_key_env: None,
        }
    }

    #[test]
    fn model_selection_priority_is_explicit_then_override_then_default() {
        let config = cfg(true);
        assert_eq!(select_model(&config, "review", Some("explicit-model")), "explicit-model");
        assert_eq!(select_model(&config, "review", None), "review-model");
        assert_eq!(select_model(&config, "feature", None), "default-model");
    }

    #[test]
    fn tier_map_matches_keywords_first() {
        assert_eq!(infer_tier("format", "high"), Tier::Local);
        assert_eq!(infer_tier("code review", "low"), Tier::CloudFast);
        assert_eq!(infer_tier("architecture", "low"), Tier::CloudHeavy);
    }

    #[test]
    fn tier_map_falls_back_to_complexity() {
        assert_eq!(infer_tier("feature", "low"), Tier::Local);
        assert_eq!(infer_tier("feature", "high"), Tier::CloudHeavy);
        assert_eq!(infer_tier("feature", "medium"), Tier::CloudFast);
    }

    #[tokio::test]
    async fn select_explicit_unavailable_worker_errors() {
        let registry = WorkerRegistry::new(vec![Box::new(SubprocessWorker::new(
            WorkerKind::Claude,
            cfg(false),
        ))]);
        let err = registry.select(Some(WorkerKind::Claude)).unwrap_err();
        assert!(matches!(err, WorkerError::Unavailable(WorkerKind::Claude)));
    }

    #[tokio::test]
    async fn select_falls_back_through_fixed_order() {
        let registry = WorkerRegistry::new(vec![
            Box::new(SubprocessWorker::new(WorkerKind::Claude, cfg(false))),
            Box::new(SdkWorker::new(WorkerKind::Gemini, cfg(false), "GOOGLE_API_KEY")),
            Box::new(HttpWorker::new(WorkerKind::Local, cfg(false)).await),
        ]);
        let err = registry.select(None).unwrap_err();
        assert!(matches!(err, WorkerError::ChainExhausted));
    }

    #[tokio::test]
    async fn subprocess_worker_reports_unavailable_when_binary_missing() {
        let mut config = cfg(true);
        config.binary_path = Some("definitely-not-a-real-binary-xyz".into());
        let worker = SubprocessWorker::new(WorkerKind::Claude, config);
        assert!(!worker.available());
        let result = worker.execute("do work", Path::new("."), "feature", None).await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[test]
    fn reviewer_selection_excludes_executor() {
        let registry = WorkerRegistry::new(vec![
            Box::new(SubprocessWorker::new(WorkerKind::Claude, cfg(true))),
            Box::new(SdkWorker::new(WorkerKind::Gemini, cfg(true), "GOOGLE_API_KEY")),
        ]);
        let reviewer = registry.select_reviewer(WorkerKind::Claude).expect("reviewer");
        assert_eq!(reviewer.kind(), WorkerKind::Gemini);
    }
}
