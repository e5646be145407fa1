//! Regex-dispatched chat command router: `status`, `scan`, a bare merge
//! sentence routed through the task parser, `release`, `autonomy`, `memory`,
//! `approve`/`deny`, `help`, and greetings. Anything else falls through to
//! the LLM chat fallback in [`crate::llm_parser`].

use once_cell::sync::Lazy;
use overlord_config::OverlordConfig;
use overlord_dispatch::{scan_ecosystem, scan_project, DetectionEngine, DispatchEngine, ReleaseCoordinator, ReleaseSpec, TaskParser};
use overlord_governance::autonomy::AutonomyEngine;
use overlord_graph::DependencyGraph;
use overlord_proposals::ProposalManager;
use overlord_types::{AutonomyLevel, ProposalState};
use regex::Regex;

use crate::llm_parser::LlmFallback;

static RE_STATUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^status(?:\s+(\S+))?$").unwrap());
static RE_SCAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^scan(?:\s+(\S+))?$").unwrap());
static RE_MERGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^merge\s+\S+\s+\S+\s+to\s+\S+$").unwrap());
static RE_RELEASE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^release\s+(\S+)\s+(\S+)$").unwrap());
static RE_AUTONOMY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^autonomy(?:\s+(\S+))?$").unwrap());
static RE_MEMORY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^memory\s+(.+)$").unwrap());
static RE_APPROVE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^approve\s+(\S+)$").unwrap());
static RE_DENY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^deny\s+(\S+)$").unwrap());
static RE_HELP: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^help$").unwrap());
static RE_GREETING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(hi|hello|hey|howdy|yo|sup|what'?s\s*up|how\s*are\s*you|how'?s\s*it\s*going)\b").unwrap());

/// Ports of `slack_commands.py`'s `SlackCommandRouter`, minus the LLM
/// fallback (that lives in [`crate::llm_parser::LlmFallback`] and is tried
/// by the caller only once this router returns `None`).
pub struct ChatCommandRouter<'a> {
    config: &'a OverlordConfig,
    graph: &'a DependencyGraph<'a>,
    autonomy: &'a AutonomyEngine<'a>,
    task_parser: &'a TaskParser<'a>,
    dispatch_engine: &'a DispatchEngine<'a>,
    release_coordinator: &'a ReleaseCoordinator<'a>,
    detection_engine: &'a DetectionEngine<'a>,
    proposals: Option<&'a ProposalManager<'a>>,
    llm: Option<&'a LlmFallback>,
    logs_dir: std::path::PathBuf,
}

impl<'a> ChatCommandRouter<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'a OverlordConfig,
        graph: &'a DependencyGraph<'a>,
        autonomy: &'a AutonomyEngine<'a>,
        task_parser: &'a TaskParser<'a>,
        dispatch_engine: &'a DispatchEngine<'a>,
        release_coordinator: &'a ReleaseCoordinator<'a>,
        detection_engine: &'a DetectionEngine<'a>,
        proposals: Option<&'a ProposalManager<'a>>,
        llm: Option<&'a LlmFallback>,
        logs_dir: std::path::PathBuf,
    ) -> Self {
        Self { config, graph, autonomy, task_parser, dispatch_engine, release_coordinator, detection_engine, proposals, llm, logs_dir }
    }

    /// Top-level entry point: the fixed vocabulary (`try_handle`), then the
    /// LLM chat fallback if configured, then a final "unknown command"
    /// message. `channel_id`/`user_id` only matter for the fallback's
    /// rolling context — the regex vocabulary is stateless.
    pub async fn handle(&self, channel_id: &str, user_id: &str, text: &str) -> String {
        if let Some(reply) = self.try_handle(text).await {
            return reply;
        }

        let trimmed = text.trim();

        match self.llm {
            Some(llm) if llm.enabled() => {
                let ecosystem_context = format_ecosystem_status(&scan_ecosystem(self.config).await);
                let memory_context = {
                    let hits = overlord_observability::search_memory(&self.logs_dir, trimmed, 5);
                    if hits.is_empty() {
                        "No relevant memory entries.".to_string()
                    } else {
                        hits.iter()
                            .map(|h| format!("({}) {}", h.category, h.content))
                            .collect::<Vec<_>>()
                            .join("\n")
                    }
                };
                llm.chat(channel_id, user_id, trimmed, &ecosystem_context, &memory_context).await
            }
            _ => format!("Unknown command: `{trimmed}`\nType `help` to see what I can do."),
        }
    }

    /// Tries the fixed vocabulary against `text`. Returns `None` for text
    /// that matches none of it and isn't a greeting, signalling the caller
    /// to try the LLM fallback (or report "unknown command" if that isn't
    /// configured).
    pub async fn try_handle(&self, text: &str) -> Option<String> {
        let text = text.trim();
        if text.is_empty() {
            return Some(self.handle_help());
        }

        if let Some(caps) = RE_STATUS.captures(text) {
            return Some(self.handle_status(caps.get(1).map(|m| m.as_str())).await);
        }
        if let Some(caps) = RE_SCAN.captures(text) {
            return Some(self.handle_scan(caps.get(1).map(|m| m.as_str())).await);
        }
        if RE_MERGE.is_match(text) {
            return Some(self.handle_dispatch(text).await);
        }
        if let Some(caps) = RE_RELEASE.captures(text) {
            return Some(self.handle_release(&caps[1], &caps[2]).await);
        }
        if let Some(caps) = RE_AUTONOMY.captures(text) {
            return Some(self.handle_autonomy(caps.get(1).map(|m| m.as_str())));
        }
        if let Some(caps) = RE_MEMORY.captures(text) {
            return Some(self.handle_memory(&caps[1]));
        }
        if let Some(caps) = RE_APPROVE.captures(text) {
            return Some(self.handle_approve(&caps[1]).await);
        }
        if let Some(caps) = RE_DENY.captures(text) {
            return Some(self.handle_deny(&caps[1]).await);
        }
        if RE_HELP.is_match(text) {
            return Some(self.handle_help());
        }
        if RE_GREETING.is_match(text) {
            return Some("Hey! I'm the Overlord — your ecosystem orchestrator.\nType `help` to see what I can do.".to_string());
        }

        None
    }

    async fn handle_status(&self, project: Option<&str>) -> String {
        match project {
            Some(name) => match self.config.projects.get(name) {
                Some(cfg) => format_project_status(&scan_project(name, cfg).await),
                None => unknown_project(name, self.config),
            },
            None => format_ecosystem_status(&scan_ecosystem(self.config).await),
        }
    }

    async fn handle_scan(&self, project: Option<&str>) -> String {
        let statuses = match project {
            Some(name) => match self.config.projects.get(name) {
                Some(cfg) => vec![scan_project(name, cfg).await],
                None => return unknown_project(name, self.config),
            },
            None => scan_ecosystem(self.config).await,
        };

        let mut text = statuses.iter().map(format_scan_detail).collect::<Vec<_>>().join("\n\n");
        let findings = self.detection_engine.filter_by_autonomy(self.detection_engine.run_all(&statuses));
        if !findings.is_empty() {
            text.push_str("\n\n");
            text.push_str(&self.detection_engine.format_summary(&findings));
        }
        text
    }

    async fn handle_dispatch(&self, text: &str) -> String {
        let plan = match self.task_parser.parse(text) {
            Ok(plan) => plan,
            Err(e) => return format!("Failed to parse task: {e}"),
        };

        let mut lines = vec![
            format!("Dispatch: {}", plan.task),
            format!("Steps: {}", plan.steps.len()),
            format!("Scope: {} | impact: {}", plan.scope.projects.join(", "), plan.scope.estimated_impact),
        ];

        if plan.requires_approval {
            lines.push(self.propose_or_defer(&plan.task, plan.scope.clone(), "Dispatched via chat", Some(plan)).await);
            return lines.join("\n");
        }

        let result = self.dispatch_engine.execute(&plan, true).await;
        lines.push(if result.success {
            "Result: completed successfully".to_string()
        } else {
            format!("Result: failed — {}", result.reason.unwrap_or_default())
        });
        lines.join("\n")
    }

    async fn handle_release(&self, project: &str, version: &str) -> String {
        if !self.config.projects.contains_key(project) {
            return unknown_project(project, self.config);
        }

        let spec = ReleaseSpec::new(project, version);
        let errors = overlord_dispatch::validate_release_spec(&spec, self.config);
        if !errors.is_empty() {
            return format!("Release validation failed:\n{}", errors.iter().map(|e| format!("  - {e}")).collect::<Vec<_>>().join("\n"));
        }

        let plan = match self.release_coordinator.plan_release(&spec) {
            Ok(plan) => plan,
            Err(e) => return format!("Failed to plan release: {e}"),
        };

        let mut lines = vec![
            format!("Release: {project} {version}"),
            format!("Steps: {}", plan.steps.len()),
            format!("Scope: {} | impact: {}", plan.scope.projects.join(", "), plan.scope.estimated_impact),
        ];

        if plan.requires_approval {
            lines.push(
                self.propose_or_defer(&format!("Release {project} {version}"), plan.scope.clone(), "Release requested via chat", Some(plan))
                    .await,
            );
            return lines.join("\n");
        }

        let result = self.release_coordinator.execute_release(&spec, self.dispatch_engine, true).await;
        lines.push(match result {
            Ok(r) if r.success => format!("Result: {project} {version} released successfully"),
            Ok(r) => format!("Result: failed — {}", r.reason.unwrap_or_default()),
            Err(e) => format!("Result: failed — {e}"),
        });
        lines.join("\n")
    }

    async fn propose_or_defer(
        &self,
        task: &str,
        scope: overlord_types::ActionScope,
        reason: &str,
        plan: Option<overlord_types::DispatchPlan>,
    ) -> String {
        match self.proposals {
            Some(proposals) => match proposals.propose(task, scope, reason, plan).await {
                Ok(id) => format!("Requires approval — proposal `{id}` created.\nReply in the proposal thread or use `approve {id}` / `deny {id}`."),
                Err(e) => format!("Requires approval, but failed to create proposal: {e}"),
            },
            None => "Requires approval — use the approval workflow.".to_string(),
        }
    }

    fn handle_autonomy(&self, level: Option<&str>) -> String {
        if let Some(level) = level {
            return match level.to_lowercase().as_str() {
                "cautious" => "Cautious: Nothing auto-executes. All actions require explicit approval.".to_string(),
                "proactive" => "Proactive: Safe local operations auto-execute. Remote-affecting actions require approval.".to_string(),
                "scheduled" => "Scheduled: Pre-approved actions auto-execute on schedule. Others require approval.".to_string(),
                _ => format!("Unknown autonomy level: `{level}`\nValid levels: cautious, proactive, scheduled"),
            };
        }

        let mut lines = vec![format!("Autonomy: global = {}", autonomy_level_str(self.autonomy.level(None)))];
        let mut names: Vec<&String> = self.config.projects.keys().collect();
        names.sort();
        for name in names {
            lines.push(format!("  {name}: {}", autonomy_level_str(self.autonomy.level(Some(name)))));
        }
        lines.join("\n")
    }

    fn handle_memory(&self, query: &str) -> String {
        let hits = overlord_observability::search_memory(&self.logs_dir, query, 5);
        if hits.is_empty() {
            return format!("No memories found for: {query}");
        }
        let mut lines = vec![format!("Memory results for '{query}':")];
        for hit in hits {
            let proj = hit.project.as_deref().unwrap_or("global");
            let content: String = hit.content.chars().take(80).collect();
            lines.push(format!("  ({proj}/{}) {content}", hit.category));
        }
        lines.join("\n")
    }

    async fn handle_approve(&self, proposal_id: &str) -> String {
        let Some(proposals) = self.proposals else { return "Proposal system not configured.".to_string() };
        let Ok(Some(proposal)) = proposals.get(proposal_id).await else {
            return format!("Proposal `{proposal_id}` not found.");
        };
        if proposal.state != ProposalState::Pending {
            return format!("Proposal `{proposal_id}` is {}, not pending.", proposal.state);
        }

        match proposals.approve(proposal_id).await {
            Ok(Some(summary)) => format!("Proposal `{proposal_id}` approved and executed: {summary}"),
            Ok(None) => format!("Proposal `{proposal_id}` approved (no execution plan cached)."),
            Err(e) => format!("Proposal `{proposal_id}` approved but failed: {e}"),
        }
    }

    async fn handle_deny(&self, proposal_id: &str) -> String {
        let Some(proposals) = self.proposals else { return "Proposal system not configured.".to_string() };
        let Ok(Some(proposal)) = proposals.get(proposal_id).await else {
            return format!("Proposal `{proposal_id}` not found.");
        };
        if proposal.state != ProposalState::Pending {
            return format!("Proposal `{proposal_id}` is {}, not pending.", proposal.state);
        }

        match proposals.deny(proposal_id, "Denied via command").await {
            Ok(()) => format!("Proposal `{proposal_id}` denied."),
            Err(e) => format!("Failed to deny proposal `{proposal_id}`: {e}"),
        }
    }

    fn handle_help(&self) -> String {
        "Overlord Commands:\n\
         \u{20}\u{20}`status [project]` — ecosystem or project health\n\
         \u{20}\u{20}`scan [project]` — detailed scan with issue detection\n\
         \u{20}\u{20}`merge <project> <source> to <target>` — dispatch a merge\n\
         \u{20}\u{20}`release <project> <version>` — coordinated release\n\
         \u{20}\u{20}`autonomy [level]` — show/describe autonomy level\n\
         \u{20}\u{20}`memory <query>` — search cross-project memory\n\
         \u{20}\u{20}`approve <id>` — approve a pending proposal\n\
         \u{20}\u{20}`deny <id>` — deny a pending proposal\n\
         \u{20}\u{20}`help` — show this message"
            .to_string()
    }
}

fn autonomy_level_str(level: AutonomyLevel) -> &'static str {
    match level {
        AutonomyLevel::Cautious => "cautious",
        AutonomyLevel::Proactive => "proactive",
        AutonomyLevel::Scheduled => "scheduled",
    }
}

fn unknown_project(name: &str, config: &OverlordConfig) -> String {
    let mut names: Vec<&String> = config.projects.keys().collect();
    names.sort();
    let available = names.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ");
    format!("Unknown project: `{name}`\nAvailable: {available}")
}

fn format_project_status(status: &overlord_dispatch::ProjectStatus) -> String {
    let icon = if status.issues.is_empty() { "[ok]" } else { "[warn]" };
    let clean = if status.git.clean { "clean" } else { "dirty" };
    let mut lines = vec![
        format!("{icon} {}", status.name),
        format!("  Branch: {} ({clean})", status.git.branch),
        format!("  Last commit: {}", truncate(&status.git.last_commit, 50)),
    ];
    if status.git.ahead > 0 {
        lines.push(format!("  Ahead: {} commits", status.git.ahead));
    }
    if !status.issues.is_empty() {
        lines.push(format!("  Issues: {}", status.issues.join("; ")));
    }
    lines.join("\n")
}

fn format_ecosystem_status(statuses: &[overlord_dispatch::ProjectStatus]) -> String {
    let total = statuses.len();
    let healthy = statuses.iter().filter(|s| s.issues.is_empty()).count();
    let icon = if healthy == total { "[ok]" } else { "[warn]" };
    let mut lines = vec![format!("{icon} Ecosystem Status: {healthy}/{total} healthy")];
    for s in statuses {
        let status_icon = if s.issues.is_empty() { "[ok]" } else { "[warn]" };
        let clean = if s.git.clean { "clean" } else { "dirty" };
        lines.push(format!("  {status_icon} {} — {} ({clean})", s.name, s.git.branch));
    }
    lines.join("\n")
}

fn format_scan_detail(status: &overlord_dispatch::ProjectStatus) -> String {
    let mut lines = vec![
        status.name.clone(),
        format!("  Branch: {} | Clean: {}", status.git.branch, if status.git.clean { "yes" } else { "no" }),
        format!("  Ahead/Behind: {}/{}", status.git.ahead, status.git.behind),
        format!("  Last commit: {}", truncate(&status.git.last_commit, 60)),
    ];
    if !status.git.stale_branches.is_empty() {
        lines.push(format!("  Stale branches: {}", status.git.stale_branches.join(", ")));
    }
    if !status.git.tags.is_empty() {
        lines.push(format!("  Tags: {}", status.git.tags.join(", ")));
    }
    if let Some(cmd) = &status.tests.test_command {
        lines.push(format!("  Tests: {cmd}"));
    }
    if !status.issues.is_empty() {
        lines.push("  Issues:".to_string());
        for issue in &status.issues {
            lines.push(format!("    - {issue}"));
        }
    }
    lines.join("\n")
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_regex_matches_bare_and_with_project() {
        assert!(RE_STATUS.is_match("status"));
        assert!(RE_STATUS.is_match("status core"));
        assert!(!RE_STATUS.is_match("status core extra"));
    }

    #[test]
    fn merge_regex_requires_full_sentence_shape() {
        assert!(RE_MERGE.is_match("merge core feat/x to develop"));
        assert!(!RE_MERGE.is_match("merge core"));
    }

    #[test]
    fn greeting_regex_matches_common_openers() {
        assert!(RE_GREETING.is_match("hey there"));
        assert!(RE_GREETING.is_match("what's up"));
        assert!(!RE_GREETING.is_match("status"));
    }
}
