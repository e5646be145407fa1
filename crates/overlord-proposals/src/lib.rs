//! Persists proposals awaiting human approval and drives them from
//! `pending` through `approved`/`denied`/`expired` to `completed`/`failed`.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use overlord_dispatch::DispatchEngine;
use overlord_types::{ActionScope, DispatchPlan, Proposal, ProposalState, ScopeImpact};

#[derive(Debug, Error)]
pub enum ProposalError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("proposal not found: {0}")]
    NotFound(String),
    #[error("proposal {0} has no cached plan")]
    NoCachedPlan(String),
}

pub type ProposalResult<T> = Result<T, ProposalError>;

/// SQLite-backed store for proposals, one writer connection behind an
/// async mutex, the same shape as `overlord-storage`'s work queue.
pub struct ProposalStore {
    conn: Mutex<Connection>,
}

impl ProposalStore {
    pub async fn open(path: &Path) -> ProposalResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn open_in_memory() -> ProposalResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> ProposalResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS overlord_proposals (
                id TEXT PRIMARY KEY,
                task TEXT NOT NULL,
                scope_projects TEXT NOT NULL,
                scope_impact TEXT NOT NULL,
                affects_remote INTEGER NOT NULL,
                reason TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                thread_ts TEXT,
                created_at TEXT NOT NULL,
                resolved_at TEXT,
                result_summary TEXT
            )",
            [],
        )?;
        Ok(())
    }

    pub async fn save(&self, proposal: &Proposal) -> ProposalResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO overlord_proposals (
                id, task, scope_projects, scope_impact, affects_remote, reason,
                state, thread_ts, created_at, resolved_at, result_summary
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                proposal.id,
                proposal.task,
                proposal.scope_projects.join(","),
                proposal.scope_impact.to_string(),
                proposal.affects_remote as i64,
                proposal.reason,
                proposal.state.to_string(),
                proposal.thread_ts,
                proposal.created_at.to_rfc3339(),
                proposal.resolved_at.map(|t| t.to_rfc3339()),
                proposal.result_summary,
            ],
        )?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> ProposalResult<Option<Proposal>> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT * FROM overlord_proposals WHERE id = ?1", params![id], row_to_proposal)
            .optional()
            .map_err(Into::into)
    }

    /// Only matches a proposal still `pending` — a resolved thread doesn't
    /// get reinterpreted by a late reply.
    pub async fn get_by_thread(&self, thread_ts: &str) -> ProposalResult<Option<Proposal>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM overlord_proposals WHERE thread_ts = ?1 AND state = 'pending'",
            params![thread_ts],
            row_to_proposal,
        )
        .optional()
        .map_err(Into::into)
    }

    pub async fn list_pending(&self) -> ProposalResult<Vec<Proposal>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM overlord_proposals WHERE state = 'pending' ORDER BY created_at")?;
        let rows = stmt.query_map([], row_to_proposal)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub async fn update_state(&self, id: &str, state: ProposalState, result_summary: Option<&str>) -> ProposalResult<()> {
        let conn = self.conn.lock().await;
        let is_terminal = matches!(
            state,
            ProposalState::Completed | ProposalState::Failed | ProposalState::Denied | ProposalState::Expired
        );
        let resolved_at = if is_terminal { Some(Utc::now().to_rfc3339()) } else { None };
        conn.execute(
            "UPDATE overlord_proposals SET state = ?1, result_summary = ?2, resolved_at = COALESCE(?3, resolved_at) WHERE id = ?4",
            params![state.to_string(), result_summary, resolved_at, id],
        )?;
        Ok(())
    }

    /// Expires every proposal still `pending` past `ttl_minutes`, returning
    /// how many were expired.
    pub async fn cleanup_expired(&self, ttl_minutes: i64) -> ProposalResult<usize> {
        let cutoff = (Utc::now() - ChronoDuration::minutes(ttl_minutes)).to_rfc3339();
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "UPDATE overlord_proposals SET state = 'expired', resolved_at = ?1 WHERE state = 'pending' AND created_at < ?2",
            params![Utc::now().to_rfc3339(), cutoff],
        )?;
        Ok(affected)
    }
}

fn row_to_proposal(row: &Row<'_>) -> rusqlite::Result<Proposal> {
    let scope_projects: String = row.get("scope_projects")?;
    let scope_impact: String = row.get("scope_impact")?;
    let state: String = row.get("state")?;
    let created_at: String = row.get("created_at")?;
    let resolved_at: Option<String> = row.get("resolved_at")?;

    Ok(Proposal {
        id: row.get("id")?,
        task: row.get("task")?,
        scope_projects: scope_projects.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect(),
        scope_impact: match scope_impact.as_str() {
            "high" => ScopeImpact::High,
            "medium" => ScopeImpact::Medium,
            _ => ScopeImpact::Low,
        },
        affects_remote: row.get::<_, i64>("affects_remote")? != 0,
        reason: row.get("reason")?,
        state: match state.as_str() {
            "pending" => ProposalState::Pending,
            "approved" => ProposalState::Approved,
            "executing" => ProposalState::Executing,
            "completed" => ProposalState::Completed,
            "failed" => ProposalState::Failed,
            "denied" => ProposalState::Denied,
            _ => ProposalState::Expired,
        },
        thread_ts: row.get("thread_ts")?,
        created_at: parse_rfc3339(&created_at)?,
        resolved_at: resolved_at.map(|s| parse_rfc3339(&s)).transpose()?,
        result_summary: row.get("result_summary")?,
    })
}

fn parse_rfc3339(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))
}

/// A surface a proposal's lifecycle gets announced on (chat, log, etc).
/// `overlord-channels` supplies the Slack-backed implementation; tests and
/// headless use can omit a notifier entirely.
pub trait ProposalNotifier: Send + Sync {
    fn notify_new(&self, proposal: &Proposal);
    fn notify_result(&self, proposal: &Proposal);
}

/// Coordinates proposal creation, chat replies, and execution, caching the
/// `DispatchPlan` for each pending proposal in memory (plans aren't
/// persisted — only the proposal metadata is).
pub struct ProposalManager<'a> {
    store: &'a ProposalStore,
    engine: &'a DispatchEngine<'a>,
    notifier: Option<Box<dyn ProposalNotifier>>,
    plans: Mutex<HashMap<String, DispatchPlan>>,
}

impl<'a> ProposalManager<'a> {
    pub fn new(store: &'a ProposalStore, engine: &'a DispatchEngine<'a>, notifier: Option<Box<dyn ProposalNotifier>>) -> Self {
        Self { store, engine, notifier, plans: Mutex::new(HashMap::new()) }
    }

    /// Creates a pending proposal, caching its plan (if given) for later
    /// execution on approval. Notification failures are logged, not fatal.
    pub async fn propose(&self, task: &str, scope: ActionScope, reason: &str, plan: Option<DispatchPlan>) -> ProposalResult<String> {
        let id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let proposal = Proposal {
            id: id.clone(),
            task: task.to_string(),
            scope_projects: scope.projects.clone(),
            scope_impact: scope.estimated_impact,
            affects_remote: scope.affects_remote,
            reason: reason.to_string(),
            state: ProposalState::Pending,
            thread_ts: None,
            created_at: Utc::now(),
            resolved_at: None,
            result_summary: None,
        };

        if let Some(plan) = plan {
            self.plans.lock().await.insert(id.clone(), plan);
        }

        if let Some(notifier) = &self.notifier {
            notifier.notify_new(&proposal);
        }

        self.store.save(&proposal).await?;
        Ok(id)
    }

    /// Recognizes `approve`/`approved`/`yes`/`lgtm` and `deny`/`denied`/`no`/`reject`
    /// (case-insensitive, trimmed); returns `None` for anything else.
    pub async fn handle_reply(&self, thread_ts: &str, text: &str) -> ProposalResult<Option<String>> {
        let Some(mut proposal) = self.store.get_by_thread(thread_ts).await? else { return Ok(None) };
        let normalized = text.trim().to_lowercase();

        if ["approve", "approved", "yes", "lgtm"].contains(&normalized.as_str()) {
            proposal.state = ProposalState::Approved;
            self.store.update_state(&proposal.id, ProposalState::Approved, None).await?;
            return match self.execute_approved(&proposal.id).await? {
                Some(summary) => Ok(Some(summary)),
                None => Ok(Some("Approved, but no cached plan was found to execute.".to_string())),
            };
        }

        if ["deny", "denied", "no", "reject"].contains(&normalized.as_str()) {
            self.store.update_state(&proposal.id, ProposalState::Denied, Some("Denied by user")).await?;
            return Ok(Some("Denied.".to_string()));
        }

        Ok(None)
    }

    /// Executes the cached plan for `proposal_id`, if any, and records the
    /// outcome. Always drops the cached plan afterward regardless of
    /// outcome.
    pub async fn execute_approved(&self, proposal_id: &str) -> ProposalResult<Option<String>> {
        let plan = self.plans.lock().await.remove(proposal_id);
        let Some(plan) = plan else {
            tracing::warn!(proposal_id, "no cached plan to execute");
            return Ok(None);
        };

        self.store.update_state(proposal_id, ProposalState::Executing, None).await?;
        let result = self.engine.execute(&plan, true).await;

        let (state, summary) = if result.success {
            (ProposalState::Completed, "Completed successfully".to_string())
        } else {
            (ProposalState::Failed, result.reason.clone().unwrap_or_else(|| "failed".to_string()))
        };
        self.store.update_state(proposal_id, state, Some(&summary)).await?;

        if let (Some(notifier), Ok(Some(proposal))) = (&self.notifier, self.store.get(proposal_id).await) {
            notifier.notify_result(&proposal);
        }

        Ok(Some(summary))
    }

    /// Looks up a proposal by id, for callers (the chat command router's
    /// explicit `approve <id>`/`deny <id>`) that need to inspect its state
    /// before acting, without reaching into the store directly.
    pub async fn get(&self, id: &str) -> ProposalResult<Option<Proposal>> {
        self.store.get(id).await
    }

    /// Approves a proposal by id directly (as opposed to `handle_reply`,
    /// which resolves one by thread). Caller is expected to have already
    /// checked the proposal is still pending.
    pub async fn approve(&self, proposal_id: &str) -> ProposalResult<Option<String>> {
        self.store.update_state(proposal_id, ProposalState::Approved, None).await?;
        self.execute_approved(proposal_id).await
    }

    /// Denies a proposal by id directly. Caller is expected to have already
    /// checked the proposal is still pending.
    pub async fn deny(&self, proposal_id: &str, reason: &str) -> ProposalResult<()> {
        self.store.update_state(proposal_id, ProposalState::Denied, Some(reason)).await
    }

    /// Thin wrapper over `ProposalStore::cleanup_expired`, logging how many
    /// were swept.
    pub async fn cleanup_expired(&self, ttl_minutes: i64) -> ProposalResult<usize> {
        let count = self.store.cleanup_expired(ttl_minutes).await?;
        if count > 0 {
            tracing::info!(count, "expired stale proposals");
        }
        Ok(count)
    }

    /// Called once on startup: every still-`pending` proposal with a
    /// `thread_ts` may have been answered while this process was down.
    /// Fetches each thread's reply history, applies the latest approve/deny
    /// reply found, and acknowledges the resolution through the notifier.
    /// Proposals are processed in batches of `batch_size` with a short pause
    /// between batches; a chat-API failure for one proposal is logged and
    /// skipped rather than aborting the sweep.
    pub async fn reconcile_pending(&self, history: &dyn ThreadHistoryProvider, batch_size: usize) -> ProposalResult<usize> {
        let pending: Vec<Proposal> = self.store.list_pending().await?.into_iter().filter(|p| p.thread_ts.is_some()).collect();
        let mut reconciled = 0usize;

        for batch in pending.chunks(batch_size.max(1)) {
            for proposal in batch {
                let thread_ts = proposal.thread_ts.as_deref().expect("filtered to Some above");
                let replies = match history.fetch_replies(thread_ts).await {
                    Ok(replies) => replies,
                    Err(e) => {
                        tracing::warn!(proposal_id = %proposal.id, error = %e, "failed to fetch thread history during reconciliation");
                        continue;
                    }
                };

                let Some(decision) = replies.iter().rev().find_map(|text| classify_reply(text)) else { continue };

                match decision {
                    ReplyDecision::Approve => {
                        self.store.update_state(&proposal.id, ProposalState::Approved, None).await?;
                        let _ = self.execute_approved(&proposal.id).await;
                    }
                    ReplyDecision::Deny => {
                        self.store.update_state(&proposal.id, ProposalState::Denied, Some("Denied while offline")).await?;
                    }
                }

                if let (Some(notifier), Ok(Some(resolved))) = (&self.notifier, self.store.get(&proposal.id).await) {
                    notifier.notify_result(&resolved);
                }
                reconciled += 1;
            }
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }

        if reconciled > 0 {
            tracing::info!(reconciled, "reconciled proposals resolved while offline");
        }
        Ok(reconciled)
    }
}

/// Fetches the reply history of a chat thread the daemon may have missed
/// while it was down. `overlord-channels` supplies the chat-backed
/// implementation; tests can stub this trivially.
#[async_trait::async_trait]
pub trait ThreadHistoryProvider: Send + Sync {
    async fn fetch_replies(&self, thread_ts: &str) -> Result<Vec<String>, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyDecision {
    Approve,
    Deny,
}

fn classify_reply(text: &str) -> Option<ReplyDecision> {
    let normalized = text.trim().to_lowercase();
    if ["approve", "approved", "yes", "lgtm"].contains(&normalized.as_str()) {
        Some(ReplyDecision::Approve)
    } else if ["deny", "denied", "no", "reject"].contains(&normalized.as_str()) {
        Some(ReplyDecision::Deny)
    } else {
        None
    }
}

/// Renders the chat-facing message for a new proposal.
pub fn format_proposal_message(proposal: &Proposal) -> String {
    let remote = if proposal.affects_remote { "affects remote" } else { "local-only" };
    format!(
        "Proposal: {}\n\nScope: {} | {} | estimated: {}\nReason: {}\n\nReply \"approve\" or \"deny\" in this thread.\nAuto-expires in 30 minutes.",
        proposal.task,
        proposal.scope_projects.join(", "),
        remote,
        proposal.scope_impact,
        proposal.reason,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_and_get_round_trips() {
        let store = ProposalStore::open_in_memory().await.unwrap();
        let proposal = Proposal {
            id: "abcd1234".to_string(),
            task: "merge x into y".to_string(),
            scope_projects: vec!["core".to_string()],
            scope_impact: ScopeImpact::Medium,
            affects_remote: false,
            reason: "weekly sync".to_string(),
            state: ProposalState::Pending,
            thread_ts: Some("t1".to_string()),
            created_at: Utc::now(),
            resolved_at: None,
            result_summary: None,
        };
        store.save(&proposal).await.unwrap();
        let fetched = store.get("abcd1234").await.unwrap().unwrap();
        assert_eq!(fetched.task, "merge x into y");
        assert_eq!(fetched.scope_projects, vec!["core".to_string()]);
    }

    #[tokio::test]
    async fn get_by_thread_ignores_resolved_proposals() {
        let store = ProposalStore::open_in_memory().await.unwrap();
        let mut proposal = Proposal {
            id: "resolved1".to_string(),
            task: "t".to_string(),
            scope_projects: vec![],
            scope_impact: ScopeImpact::Low,
            affects_remote: false,
            reason: "r".to_string(),
            state: ProposalState::Pending,
            thread_ts: Some("thread-1".to_string()),
            created_at: Utc::now(),
            resolved_at: None,
            result_summary: None,
        };
        store.save(&proposal).await.unwrap();
        proposal.state = ProposalState::Denied;
        store.save(&proposal).await.unwrap();
        assert!(store.get_by_thread("thread-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cleanup_expired_only_touches_pending_past_ttl() {
        let store = ProposalStore::open_in_memory().await.unwrap();
        let mut stale = Proposal {
            id: "stale1".to_string(),
            task: "t".to_string(),
            scope_projects: vec![],
            scope_impact: ScopeImpact::Low,
            affects_remote: false,
            reason: "r".to_string(),
            state: ProposalState::Pending,
            thread_ts: None,
            created_at: Utc::now() - ChronoDuration::minutes(45),
            resolved_at: None,
            result_summary: None,
        };
        store.save(&stale).await.unwrap();
        stale.id = "fresh1".to_string();
        stale.created_at = Utc::now();
        store.save(&stale).await.unwrap();

        let expired = store.cleanup_expired(30).await.unwrap();
        assert_eq!(expired, 1);
        assert_eq!(store.get("stale1").await.unwrap().unwrap().state, ProposalState::Expired);
        assert_eq!(store.get("fresh1").await.unwrap().unwrap().state, ProposalState::Pending);
    }

    #[test]
    fn format_proposal_message_includes_scope_and_reason() {
        let proposal = Proposal {
            id: "x".to_string(),
            task: "release core".to_string(),
            scope_projects: vec!["core".to_string(), "api".to_string()],
            scope_impact: ScopeImpact::High,
            affects_remote: true,
            reason: "version bump".to_string(),
            state: ProposalState::Pending,
            thread_ts: None,
            created_at: Utc::now(),
            resolved_at: None,
            result_summary: None,
        };
        let message = format_proposal_message(&proposal);
        assert!(message.contains("core, api"));
        assert!(message.contains("affects remote"));
        assert!(message.contains("version bump"));
    }

    #[tokio::test]
    async fn approve_executes_cached_plan_and_records_outcome() {
        use overlord_config::{AutonomyConfig, CostControlConfig, NotificationConfig, OverlordConfig, ScheduleConfig};
        use overlord_dispatch::build_simple_plan;
        use overlord_workers::{ModelRouter, WorkerRegistry};

        let config = OverlordConfig {
            workspace_root: None,
            projects: HashMap::new(),
            autonomy: AutonomyConfig::default(),
            models: HashMap::new(),
            schedule: ScheduleConfig::default(),
            workers: HashMap::new(),
            notifications: NotificationConfig::default(),
            cost_controls: CostControlConfig::default(),
            llm_fallback: overlord_config::LlmFallbackConfig::default(),
        };
        let registry = WorkerRegistry::new(vec![]);
        let router = ModelRouter::new(&config);
        let engine = DispatchEngine::new(&config, &registry, &router);

        let store = ProposalStore::open_in_memory().await.unwrap();
        let manager = ProposalManager::new(&store, &engine, None);

        let plan = build_simple_plan("do something unrecognized", "core", ActionScope::default(), false);
        let id = manager.propose("do something unrecognized", ActionScope::default(), "test", Some(plan)).await.unwrap();

        let reply = manager.handle_reply("nonexistent-thread", "approve").await.unwrap();
        assert!(reply.is_none());

        let outcome = manager.execute_approved(&id).await.unwrap();
        assert!(outcome.is_some());
        let proposal = store.get(&id).await.unwrap().unwrap();
        assert_eq!(proposal.state, ProposalState::Failed);
    }

    struct StubHistory(HashMap<String, Vec<String>>);

    #[async_trait::async_trait]
    impl ThreadHistoryProvider for StubHistory {
        async fn fetch_replies(&self, thread_ts: &str) -> Result<Vec<String>, String> {
            self.0.get(thread_ts).cloned().ok_or_else(|| "no such thread".to_string())
        }
    }

    #[tokio::test]
    async fn reconcile_pending_applies_latest_matching_reply() {
        use overlord_config::{AutonomyConfig, CostControlConfig, NotificationConfig, OverlordConfig, ScheduleConfig};
        use overlord_workers::{ModelRouter, WorkerRegistry};

        let config = OverlordConfig {
            workspace_root: None,
            projects: HashMap::new(),
            autonomy: AutonomyConfig::default(),
            models: HashMap::new(),
            schedule: ScheduleConfig::default(),
            workers: HashMap::new(),
            notifications: NotificationConfig::default(),
            cost_controls: CostControlConfig::default(),
            llm_fallback: overlord_config::LlmFallbackConfig::default(),
        };
        let registry = WorkerRegistry::new(vec![]);
        let router = ModelRouter::new(&config);
        let engine = DispatchEngine::new(&config, &registry, &router);

        let store = ProposalStore::open_in_memory().await.unwrap();
        let manager = ProposalManager::new(&store, &engine, None);

        let id = manager.propose("merge x to y", ActionScope::default(), "offline test", None).await.unwrap();
        let mut proposal = store.get(&id).await.unwrap().unwrap();
        proposal.thread_ts = Some("thread-offline".to_string());
        store.save(&proposal).await.unwrap();

        let mut threads = HashMap::new();
        threads.insert("thread-offline".to_string(), vec!["not sure".to_string(), "deny".to_string()]);
        let history = StubHistory(threads);

        let count = manager.reconcile_pending(&history, 5).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.get(&id).await.unwrap().unwrap().state, ProposalState::Denied);
    }

    #[tokio::test]
    async fn reconcile_pending_skips_proposal_on_fetch_error() {
        use overlord_config::{AutonomyConfig, CostControlConfig, NotificationConfig, OverlordConfig, ScheduleConfig};
        use overlord_workers::{ModelRouter, WorkerRegistry};

        let config = OverlordConfig {
            workspace_root: None,
            projects: HashMap::new(),
            autonomy: AutonomyConfig::default(),
            models: HashMap::new(),
            schedule: ScheduleConfig::default(),
            workers: HashMap::new(),
            notifications: NotificationConfig::default(),
            cost_controls: CostControlConfig::default(),
            llm_fallback: overlord_config::LlmFallbackConfig::default(),
        };
        let registry = WorkerRegistry::new(vec![]);
        let router = ModelRouter::new(&config);
        let engine = DispatchEngine::new(&config, &registry, &router);

        let store = ProposalStore::open_in_memory().await.unwrap();
        let manager = ProposalManager::new(&store, &engine, None);

        let id = manager.propose("merge x to y", ActionScope::default(), "offline test", None).await.unwrap();
        let mut proposal = store.get(&id).await.unwrap().unwrap();
        proposal.thread_ts = Some("thread-missing".to_string());
        store.save(&proposal).await.unwrap();

        let history = StubHistory(HashMap::new());
        let count = manager.reconcile_pending(&history, 5).await.unwrap();
        assert_eq!(count, 0);
        assert_eq!(store.get(&id).await.unwrap().unwrap().state, ProposalState::Pending);
    }
}
