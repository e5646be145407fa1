//! Shared value types for the dispatch/governance substrate.
//!
//! Closed tagged enums stand in for the loosely-typed config/state maps of
//! the system this crate was distilled from: every status, priority, scope
//! impact and proposal state the rest of the workspace passes around is a
//! variant here, never a bare string.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Active,
    Dispatched,
    InReview,
    Completed,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Backlog => "backlog",
            Self::Active => "active",
            Self::Dispatched => "dispatched",
            Self::InReview => "in_review",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// The complete set of permitted `(from, to)` transitions. Anything not in
/// this table is rejected before it ever reaches the audit log.
pub const TRANSITIONS: &[(TaskStatus, TaskStatus)] = &[
    (TaskStatus::Backlog, TaskStatus::Active),
    (TaskStatus::Backlog, TaskStatus::Failed),
    (TaskStatus::Active, TaskStatus::Dispatched),
    (TaskStatus::Active, TaskStatus::Backlog),
    (TaskStatus::Active, TaskStatus::Failed),
    (TaskStatus::Dispatched, TaskStatus::InReview),
    (TaskStatus::Dispatched, TaskStatus::Failed),
    (TaskStatus::InReview, TaskStatus::Completed),
    (TaskStatus::InReview, TaskStatus::Failed),
    (TaskStatus::InReview, TaskStatus::Active),
    (TaskStatus::Failed, TaskStatus::Backlog),
];

pub fn is_transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    TRANSITIONS.iter().any(|(f, t)| *f == from && *t == to)
}

/// `failed -> backlog` is the only transition that bumps `retry_count`.
pub fn transition_increments_retry(from: TaskStatus, to: TaskStatus) -> bool {
    from == TaskStatus::Failed && to == TaskStatus::Backlog
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyLevel {
    Cautious,
    Proactive,
    Scheduled,
}

impl std::fmt::Display for AutonomyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Cautious => "cautious",
            Self::Proactive => "proactive",
            Self::Scheduled => "scheduled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeImpact {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for ScopeImpact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    Pending,
    Approved,
    Executing,
    Completed,
    Failed,
    Denied,
    Expired,
}

impl std::fmt::Display for ProposalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Denied => "denied",
            Self::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectRole {
    SharedLibrary,
    PlatformDeployment,
    Frontend,
    Tooling,
    Provisioning,
    Personal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BranchModel {
    DevelopMain,
    TrunkBased,
    Gitflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Claude,
    Gemini,
    Local,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Local => "local",
        };
        write!(f, "{s}")
    }
}

/// Routing tier, independent of which concrete worker kind backs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    Local,
    CloudFast,
    CloudHeavy,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Local => "local",
            Self::CloudFast => "cloud-fast",
            Self::CloudHeavy => "cloud-heavy",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Passed,
    Failed,
    Skipped,
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub project: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub complexity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    pub retry_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// `atom/<first-8-of-task-id>` -- the worktree branch and directory name
    /// shared by every lifecycle stage that touches this task's worktree.
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }

    pub fn branch_name(&self) -> String {
        format!("atom/{}", self.short_id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDependency {
    pub task_id: Uuid,
    pub depends_on_task_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub id: i64,
    pub task_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_status: Option<TaskStatus>,
    pub new_status: TaskStatus,
    pub changed_by: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResultRecord {
    pub id: i64,
    pub task_id: Uuid,
    pub worker_id: String,
    pub model_id: String,
    pub branch_name: String,
    pub mission_brief_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_status: Option<ReviewStatus>,
    pub tokens_used: i64,
    pub usage_stats: serde_json::Value,
    pub output_log: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostLedgerRow {
    pub date: chrono::NaiveDate,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub estimated_cost_usd: f64,
    pub ceiling_usd: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub task: String,
    pub scope_projects: Vec<String>,
    pub scope_impact: ScopeImpact,
    pub affects_remote: bool,
    pub reason: String,
    pub state: ProposalState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
}

/// Blast-radius description of a proposed or in-flight action. Not
/// persisted on its own -- it rides along with a `Proposal` or a
/// `DispatchPlan`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionScope {
    pub projects: Vec<String>,
    pub branches: Vec<String>,
    pub destructive: bool,
    pub reversible: bool,
    pub affects_remote: bool,
    pub estimated_impact: ScopeImpact,
}

impl Default for ScopeImpact {
    fn default() -> Self {
        Self::Low
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeVerdict {
    pub approved: bool,
    pub reason: String,
    pub escalation_required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchStep {
    pub id: String,
    pub action: String,
    pub project: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_tier: Option<Tier>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchPlan {
    pub task: String,
    pub steps: Vec<DispatchStep>,
    pub scope: ActionScope,
    pub estimated_duration_secs: u64,
    pub requires_approval: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub model_used: String,
    pub worker_type: String,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub tokens_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backlog_to_active_is_allowed() {
        assert!(is_transition_allowed(TaskStatus::Backlog, TaskStatus::Active));
    }

    #[test]
    fn completed_is_terminal() {
        assert!(!is_transition_allowed(TaskStatus::Completed, TaskStatus::Active));
        assert!(!is_transition_allowed(TaskStatus::Completed, TaskStatus::Backlog));
    }

    #[test]
    fn only_failed_to_backlog_increments_retry() {
        assert!(transition_increments_retry(TaskStatus::Failed, TaskStatus::Backlog));
        assert!(!transition_increments_retry(TaskStatus::Backlog, TaskStatus::Active));
        assert!(!transition_increments_retry(TaskStatus::InReview, TaskStatus::Active));
    }

    #[test]
    fn branch_name_uses_first_eight_chars_of_simple_uuid() {
        let task = Task {
            id: Uuid::nil(),
            title: "t".into(),
            project: "p".into(),
            description: String::new(),
            status: TaskStatus::Backlog,
            priority: Priority::Low,
            complexity: "low".into(),
            external_id: None,
            external_source: None,
            locked_by: None,
            locked_at: None,
            retry_count: 0,
            mirror_path: None,
            token_budget: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(task.branch_name(), "atom/00000000");
    }
}
