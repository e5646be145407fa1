//! LLM-powered fallback for the chat command router (§4.12) and the
//! optional richer structured command parser (§4.13).
//!
//! Two call shapes share the same rolling per-channel [`ContextStore`]:
//! [`LlmFallback::chat`] asks an OpenAI-compatible chat-completions endpoint
//! a free-text question with ecosystem + memory context spliced into the
//! system prompt, while [`LlmFallback::parse_command`] asks the same
//! endpoint for strict JSON and falls back to a caller-supplied regex parser
//! below a confidence threshold. Ported from `llm_parser.py`'s
//! `LLMCommandParser`/`ContextStore`.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use overlord_config::LlmFallbackConfig;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct ConversationEntry {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub message: String,
    pub parsed_command: Option<String>,
}

impl ConversationEntry {
    fn format_for_prompt(&self) -> String {
        let age = Utc::now() - self.timestamp;
        let age_str = if age.num_seconds() < 60 {
            "just now".to_string()
        } else if age.num_seconds() < 3600 {
            format!("{} min ago", age.num_minutes())
        } else {
            format!("{} hr ago", age.num_hours())
        };
        match &self.parsed_command {
            Some(cmd) => format!("[{age_str}] {}: \"{}\" -> {cmd}", self.user_id, self.message),
            None => format!("[{age_str}] {}: \"{}\"", self.user_id, self.message),
        }
    }
}

/// In-memory rolling conversation history per channel, bounded by both
/// entry count and age. Single-writer cache guarded by one mutex, per the
/// source-pattern note on thread-based mutable caches.
pub struct ContextStore {
    max_entries: usize,
    ttl_minutes: i64,
    contexts: StdMutex<HashMap<String, Vec<ConversationEntry>>>,
}

impl ContextStore {
    pub fn new(max_entries: usize, ttl_minutes: i64) -> Self {
        Self { max_entries, ttl_minutes, contexts: StdMutex::new(HashMap::new()) }
    }

    pub fn add(&self, channel_id: &str, user_id: &str, message: &str, parsed_command: Option<String>) {
        let mut contexts = self.contexts.lock().unwrap();
        let entries = contexts.entry(channel_id.to_string()).or_default();
        entries.push(ConversationEntry {
            timestamp: Utc::now(),
            user_id: user_id.to_string(),
            message: message.to_string(),
            parsed_command,
        });
        self.prune(entries);
    }

    pub fn history(&self, channel_id: &str) -> Vec<ConversationEntry> {
        let mut contexts = self.contexts.lock().unwrap();
        let Some(entries) = contexts.get_mut(channel_id) else { return Vec::new() };
        self.prune(entries);
        entries.clone()
    }

    fn prune(&self, entries: &mut Vec<ConversationEntry>) {
        let cutoff = Utc::now() - chrono::Duration::minutes(self.ttl_minutes);
        entries.retain(|e| e.timestamp >= cutoff);
        if entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            entries.drain(0..excess);
        }
    }
}

/// Strict JSON shape the LLM is asked to respond with for §4.13's
/// structured command parser.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmCommand {
    pub command: String,
    pub issue_number: Option<i64>,
    pub pr_number: Option<i64>,
    pub repo: Option<String>,
    pub minion_id: Option<String>,
    #[serde(default)]
    pub confidence: f64,
    pub clarification: Option<String>,
}

pub enum ParseOutcome {
    Command(LlmCommand),
    NeedsClarification(String),
    Fallback,
}

/// Shared HTTP client + config for both the free-text chat fallback and the
/// structured command parser. Both degrade to a fixed, graceful result on
/// timeout or transport error rather than propagating.
pub struct LlmFallback {
    config: LlmFallbackConfig,
    client: reqwest::Client,
    context: ContextStore,
}

impl LlmFallback {
    pub fn new(config: LlmFallbackConfig) -> Self {
        let context = ContextStore::new(config.context_max_entries, config.context_ttl_minutes);
        Self { config, client: reqwest::Client::new(), context }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn api_key(&self) -> Option<String> {
        self.config.api_key_env.as_ref().and_then(|var| std::env::var(var).ok())
    }

    /// §4.12 free-text fallback: builds a system prompt from ecosystem
    /// context + recent memory + rolling conversation history, then asks
    /// for a plain-text reply. Records the turn in the context store either
    /// way so later turns see it.
    pub async fn chat(&self, channel_id: &str, user_id: &str, text: &str, ecosystem_context: &str, memory_context: &str) -> String {
        self.context.add(channel_id, user_id, text, None);

        if !self.config.enabled {
            return graceful_fallback_message();
        }

        let history = self.context.history(channel_id);
        let history_block = if history.is_empty() {
            "No recent conversation.".to_string()
        } else {
            let mut lines = vec!["Recent conversation:".to_string()];
            let start = history.len().saturating_sub(5);
            for entry in &history[start..] {
                lines.push(entry.format_for_prompt());
            }
            lines.join("\n")
        };

        let system_prompt = format!(
            "You are the Overlord's conversational assistant. Answer naturally and concisely.\n\n## Ecosystem Context\n{ecosystem_context}\n\n## Recent Memory\n{memory_context}\n\n## Conversation\n{history_block}"
        );

        match self.call_chat_completions(&system_prompt, text).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, "llm chat fallback failed");
                graceful_fallback_message()
            }
        }
    }

    /// §4.13 structured command parser. Returns [`ParseOutcome::Fallback`]
    /// when the LLM is disabled, times out, errors, or responds below
    /// confidence with no clarification — the caller then runs its own
    /// regex parser.
    pub async fn parse_command(&self, channel_id: &str, user_id: &str, text: &str, vocabulary_prompt: &str) -> ParseOutcome {
        if !self.config.enabled {
            self.context.add(channel_id, user_id, text, None);
            return ParseOutcome::Fallback;
        }

        let history = self.context.history(channel_id);
        let history_block = if history.is_empty() {
            "No recent conversation.".to_string()
        } else {
            let mut lines = vec!["Recent conversation:".to_string()];
            let start = history.len().saturating_sub(5);
            for entry in &history[start..] {
                lines.push(entry.format_for_prompt());
            }
            lines.join("\n")
        };

        let prompt = format!(
            "{vocabulary_prompt}\n\n## Context\n\n{history_block}\n\nRespond with JSON only, no other text. Now parse this message:\nUser: \"{text}\""
        );

        let result = tokio::time::timeout(Duration::from_secs(self.config.timeout_secs), self.call_chat_completions("", &prompt)).await;

        let raw = match result {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "llm command parse failed");
                self.context.add(channel_id, user_id, text, None);
                return ParseOutcome::Fallback;
            }
            Err(_) => {
                tracing::warn!(timeout_secs = self.config.timeout_secs, "llm command parse timed out");
                self.context.add(channel_id, user_id, text, None);
                return ParseOutcome::Fallback;
            }
        };

        let Some(command) = extract_json_command(&raw) else {
            self.context.add(channel_id, user_id, text, None);
            return ParseOutcome::Fallback;
        };

        if command.confidence >= self.config.confidence_threshold {
            self.context.add(channel_id, user_id, text, Some(command.command.clone()));
            return ParseOutcome::Command(command);
        }

        if let Some(clarification) = &command.clarification {
            self.context.add(channel_id, user_id, text, None);
            return ParseOutcome::NeedsClarification(clarification.clone());
        }

        self.context.add(channel_id, user_id, text, None);
        ParseOutcome::Fallback
    }

    async fn call_chat_completions(&self, system_prompt: &str, user_message: &str) -> anyhow::Result<String> {
        let mut messages = Vec::new();
        if !system_prompt.is_empty() {
            messages.push(serde_json::json!({"role": "system", "content": system_prompt}));
        }
        messages.push(serde_json::json!({"role": "user", "content": user_message}));

        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url.trim_end_matches('/')))
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&serde_json::json!({
                "model": self.config.model,
                "messages": messages,
                "temperature": 0.1,
                "max_tokens": 400,
            }));
        if let Some(key) = self.api_key() {
            req = req.bearer_auth(key);
        }

        let response = req.send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            anyhow::bail!("HTTP {status}: {body}");
        }
        let content = body["choices"][0]["message"]["content"].as_str().unwrap_or_default();
        Ok(content.trim().to_string())
    }
}

/// Pulls the first `{...}` object out of a (possibly markdown-fenced) LLM
/// response body, mirroring `_parse_llm_response`'s regex-and-json-load.
fn extract_json_command(content: &str) -> Option<LlmCommand> {
    let stripped = content.trim();
    let stripped = if stripped.starts_with("```") {
        stripped
            .lines()
            .filter(|l| !l.starts_with("```"))
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        stripped.to_string()
    };

    let start = stripped.find('{')?;
    let end = stripped.rfind('}')?;
    if end < start {
        return None;
    }
    let candidate = &stripped[start..=end];
    serde_json::from_str(candidate).ok()
}

fn graceful_fallback_message() -> String {
    "I'm not sure how to help with that right now. Try `help` to see what I can do.".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_store_prunes_by_max_entries() {
        let store = ContextStore::new(2, 30);
        store.add("c1", "u1", "one", None);
        store.add("c1", "u1", "two", None);
        store.add("c1", "u1", "three", None);
        let history = store.history("c1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message, "two");
        assert_eq!(history[1].message, "three");
    }

    #[test]
    fn extract_json_command_handles_fenced_response() {
        let content = "```json\n{\"command\": \"STATUS\", \"confidence\": 0.9}\n```";
        let parsed = extract_json_command(content).unwrap();
        assert_eq!(parsed.command, "STATUS");
        assert!((parsed.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn extract_json_command_returns_none_without_braces() {
        assert!(extract_json_command("no json here").is_none());
    }
}
