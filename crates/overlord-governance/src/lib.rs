//! Pre-dispatch policy enforcement: root-workspace protection, concurrency,
//! branch naming, strategic drift, and file-conflict detection between a
//! candidate task and whatever is already dispatched, plus the autonomy-level
//! and blast-radius gate in [`autonomy`].

pub mod autonomy;

use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use overlord_config::ProjectConfig;
use overlord_storage::{WorkQueue, WorkQueueError};
use overlord_types::{Task, TaskStatus};
use regex::Regex;
use std::collections::HashSet;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum GovernanceError {
    #[error("work queue error: {0}")]
    Storage(#[from] WorkQueueError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    HardBlock,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::HardBlock => "hard-block",
            Self::Warning => "warning",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    RootWorkspace,
    Concurrency,
    BranchPolicy,
    StrategicDrift,
    Conflict,
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RootWorkspace => "root-workspace",
            Self::Concurrency => "concurrency",
            Self::BranchPolicy => "branch-policy",
            Self::StrategicDrift => "strategic-drift",
            Self::Conflict => "conflict",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct GovernanceViolation {
    pub rule: Rule,
    pub severity: Severity,
    pub message: String,
    pub project: String,
}

#[derive(Debug, Clone)]
pub struct GovernanceResult {
    pub approved: bool,
    pub violations: Vec<GovernanceViolation>,
}

/// Branches matching any of these prefixes, or exactly `develop`/`main`,
/// satisfy the `develop-main` branch policy.
const VALID_BRANCH_PREFIXES: &[&str] =
    &["feat/", "fix/", "docs/", "chore/", "develop", "main"];

pub struct GovernanceEngine {
    workspace_root: Option<PathBuf>,
    priority_keywords: Vec<String>,
}

impl GovernanceEngine {
    pub fn new(workspace_root: Option<PathBuf>) -> Self {
        Self { workspace_root, priority_keywords: Vec::new() }
    }

    pub fn set_priority_keywords(&mut self, keywords: &[String]) {
        self.priority_keywords = keywords.iter().map(|k| k.to_lowercase()).collect();
    }

    pub async fn pre_dispatch_check(
        &self,
        queue: &WorkQueue,
        task: &Task,
        project_name: &str,
        project_config: &ProjectConfig,
    ) -> Result<GovernanceResult, GovernanceError> {
        let mut violations = Vec::new();

        if let Some(v) = self.check_root_workspace(project_name, project_config) {
            violations.push(v);
        }
        if let Some(v) = self.check_concurrency(queue, task).await? {
            violations.push(v);
        }
        if let Some(v) = self.check_branch_policy(project_name, project_config).await {
            violations.push(v);
        }
        if let Some(v) = self.check_strategic_drift(task) {
            violations.push(v);
        }

        let approved = !violations.iter().any(|v| v.severity == Severity::HardBlock);
        Ok(GovernanceResult { approved, violations })
    }

    fn check_root_workspace(
        &self,
        project_name: &str,
        project_config: &ProjectConfig,
    ) -> Option<GovernanceViolation> {
        let workspace_root = self.workspace_root.as_ref()?;

        let project_path = match project_config.path.canonicalize() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(project = %project_name, error = %e, "failed to resolve project path for root workspace check");
                return None;
            }
        };
        let workspace_path = match workspace_root.canonicalize() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "failed to resolve workspace root for root workspace check");
                return None;
            }
        };

        if project_path == workspace_path {
            Some(GovernanceViolation {
                rule: Rule::RootWorkspace,
                severity: Severity::HardBlock,
                message: format!(
                    "Cannot dispatch to workspace root: {}. The root workspace is protected from autonomous changes.",
                    project_path.display()
                ),
                project: project_name.to_string(),
            })
        } else {
            None
        }
    }

    async fn check_concurrency(
        &self,
        queue: &WorkQueue,
        task: &Task,
    ) -> Result<Option<GovernanceViolation>, GovernanceError> {
        let dispatched = queue.list_tasks(Some(TaskStatus::Dispatched), None, i64::MAX).await?;
        for active in dispatched {
            if active.project == task.project && active.id != task.id {
                return Ok(Some(GovernanceViolation {
                    rule: Rule::Concurrency,
                    severity: Severity::HardBlock,
                    message: format!(
                        "Project '{}' already has a dispatched task: {} ({}). Wait for it to complete before dispatching another.",
                        task.project,
                        active.short_id(),
                        active.title
                    ),
                    project: task.project.clone(),
                }));
            }
        }
        Ok(None)
    }

    async fn check_branch_policy(
        &self,
        project_name: &str,
        project_config: &ProjectConfig,
    ) -> Option<GovernanceViolation> {
        use overlord_types::BranchModel;
        if project_config.branch_model != BranchModel::DevelopMain {
            return None;
        }

        let branch = current_branch(&project_config.path).await?;
        if branch.is_empty() {
            return None;
        }

        if VALID_BRANCH_PREFIXES.iter().any(|p| branch.starts_with(p)) {
            return None;
        }

        Some(GovernanceViolation {
            rule: Rule::BranchPolicy,
            severity: Severity::Warning,
            message: format!(
                "Project '{project_name}' is on branch '{branch}' which doesn't follow the expected naming convention. Expected: feat/, fix/, docs/, chore/, develop, or main."
            ),
            project: project_name.to_string(),
        })
    }

    fn check_strategic_drift(&self, task: &Task) -> Option<GovernanceViolation> {
        if self.priority_keywords.is_empty() {
            return None;
        }

        let text = format!("{} {}", task.title, task.description).to_lowercase();
        let matched = self.priority_keywords.iter().any(|kw| text.contains(kw.as_str()));

        if matched {
            return None;
        }

        Some(GovernanceViolation {
            rule: Rule::StrategicDrift,
            severity: Severity::Warning,
            message: format!(
                "Task '{}' does not match any business priority keywords. Consider reviewing alignment with current priorities.",
                task.title
            ),
            project: task.project.clone(),
        })
    }

    /// Detect potential file-path overlap between `task` and any already
    /// dispatched task, by token-intersecting file/module-like patterns
    /// pulled from their titles and descriptions.
    pub fn check_conflict(&self, task: &Task, active_tasks: &[Task]) -> Option<GovernanceViolation> {
        if task.description.is_empty() {
            return None;
        }

        let mut task_paths = extract_file_patterns(&task.description);
        if task_paths.is_empty() {
            task_paths = extract_file_patterns(&task.title);
        }
        if task_paths.is_empty() {
            return None;
        }

        for active in active_tasks {
            if active.id == task.id {
                continue;
            }
            let active_text = format!("{} {}", active.title, active.description);
            let active_paths = extract_file_patterns(&active_text);

            let overlap: Vec<&String> = task_paths.intersection(&active_paths).collect();
            if !overlap.is_empty() {
                let mut sorted: Vec<&str> = overlap.iter().map(|s| s.as_str()).collect();
                sorted.sort_unstable();
                sorted.truncate(5);
                return Some(GovernanceViolation {
                    rule: Rule::Conflict,
                    severity: Severity::HardBlock,
                    message: format!(
                        "Potential file conflict with dispatched task {} ({}). Overlapping paths: {}",
                        active.short_id(),
                        active.title,
                        sorted.join(", ")
                    ),
                    project: task.project.clone(),
                });
            }
        }

        None
    }
}

async fn current_branch(project_path: &Path) -> Option<String> {
    let output = tokio::time::timeout(
        Duration::from_secs(5),
        Command::new("git")
            .args(["branch", "--show-current"])
            .current_dir(project_path)
            .output(),
    )
    .await
    .ok()?
    .ok()?;

    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

static PATH_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\w./]+\.\w{1,5}").unwrap());
static MODULE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\w+[/.](?:\w+[/.])*\w+)\b").unwrap());

fn extract_file_patterns(text: &str) -> HashSet<String> {
    let mut patterns = HashSet::new();
    for m in PATH_PATTERN.find_iter(text) {
        let path = m.as_str().trim_start_matches("./").trim_end_matches('.');
        if !path.is_empty() {
            patterns.insert(path.to_string());
        }
    }
    for caps in MODULE_PATTERN.captures_iter(text) {
        if let Some(m) = caps.get(1) {
            patterns.insert(m.as_str().to_string());
        }
    }
    patterns
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use overlord_config::ProjectConfig;
    use overlord_storage::NewTask;
    use overlord_types::{BranchModel, Priority, ProjectRole};
    use uuid::Uuid;

    fn project_config(path: &Path) -> ProjectConfig {
        ProjectConfig {
            path: path.to_path_buf(),
            remote: "git@example.com:org/core.git".into(),
            role: ProjectRole::SharedLibrary,
            branch_model: BranchModel::DevelopMain,
            depends_on: vec![],
        }
    }

    fn sample_task(project: &str, title: &str, description: &str) -> Task {
        Task {
            id: Uuid::new_v4(),
            title: title.into(),
            project: project.into(),
            description: description.into(),
            status: TaskStatus::Active,
            priority: Priority::Medium,
            complexity: "medium".into(),
            external_id: None,
            external_source: None,
            locked_by: None,
            locked_at: None,
            retry_count: 0,
            mirror_path: None,
            token_budget: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn root_workspace_is_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let engine = GovernanceEngine::new(Some(dir.path().to_path_buf()));
        let project = project_config(dir.path());
        let v = engine.check_root_workspace("core", &project);
        assert!(v.is_some());
        assert_eq!(v.unwrap().severity, Severity::HardBlock);
    }

    #[tokio::test]
    async fn non_root_project_passes_workspace_check() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("core");
        std::fs::create_dir(&sub).unwrap();
        let engine = GovernanceEngine::new(Some(dir.path().to_path_buf()));
        let project = project_config(&sub);
        assert!(engine.check_root_workspace("core", &project).is_none());
    }

    #[tokio::test]
    async fn concurrency_blocks_second_dispatch_for_same_project() {
        let queue = WorkQueue::open_in_memory().await.unwrap();
        let existing_id = queue
            .add_task(NewTask {
                title: "first".into(),
                project: "core".into(),
                priority: Priority::Medium,
                complexity: "medium".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        queue.transition(existing_id, TaskStatus::Active, "test", None).await.unwrap();
        queue.transition(existing_id, TaskStatus::Dispatched, "test", None).await.unwrap();

        let engine = GovernanceEngine::new(None);
        let new_task = sample_task("core", "second task", "");
        let violation = engine.check_concurrency(&queue, &new_task).await.unwrap();
        assert!(violation.is_some());
        assert_eq!(violation.unwrap().rule, Rule::Concurrency);
    }

    #[tokio::test]
    async fn concurrency_allows_dispatch_for_different_project() {
        let queue = WorkQueue::open_in_memory().await.unwrap();
        let engine = GovernanceEngine::new(None);
        let task = sample_task("core", "task", "");
        assert!(engine.check_concurrency(&queue, &task).await.unwrap().is_none());
    }

    #[test]
    fn strategic_drift_flags_unmatched_task() {
        let mut engine = GovernanceEngine::new(None);
        engine.set_priority_keywords(&["billing".to_string(), "checkout".to_string()]);
        let task = sample_task("core", "Refactor logging", "Clean up log formatting");
        let v = engine.check_strategic_drift(&task);
        assert!(v.is_some());
        assert_eq!(v.unwrap().severity, Severity::Warning);
    }

    #[test]
    fn strategic_drift_passes_matched_task() {
        let mut engine = GovernanceEngine::new(None);
        engine.set_priority_keywords(&["billing".to_string()]);
        let task = sample_task("core", "Fix billing bug", "");
        assert!(engine.check_strategic_drift(&task).is_none());
    }

    #[test]
    fn conflict_detects_overlapping_paths() {
        let engine = GovernanceEngine::new(None);
        let task = sample_task("core", "Update auth", "Touches src/auth.rs and config/settings.py");
        let active = sample_task("core", "Refactor auth module", "Edits src/auth.rs heavily");
        let v = engine.check_conflict(&task, std::slice::from_ref(&active));
        assert!(v.is_some());
        assert_eq!(v.unwrap().rule, Rule::Conflict);
    }

    #[test]
    fn conflict_ignores_self() {
        let engine = GovernanceEngine::new(None);
        let task = sample_task("core", "Update auth", "Touches src/auth.rs");
        assert!(engine.check_conflict(&task, std::slice::from_ref(&task)).is_none());
    }

    #[test]
    fn conflict_ignores_unrelated_tasks() {
        let engine = GovernanceEngine::new(None);
        let task = sample_task("core", "Update auth", "Touches src/auth.rs");
        let active = sample_task("core", "Unrelated docs change", "Updates README.md only");
        assert!(engine.check_conflict(&task, &[active]).is_none());
    }
}
