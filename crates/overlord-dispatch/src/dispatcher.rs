//! Core dispatch loop: Analyze → Brief → Provision → Execute → Review.
//!
//! Drives the full lifecycle of one task from the work queue through worker
//! execution and optional review, with guaranteed unlock on every exit path.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use overlord_config::{OverlordConfig, ProjectConfig};
use overlord_governance::GovernanceEngine;
use overlord_storage::{NewDispatchResult, WorkQueue};
use overlord_types::{ReviewStatus, Task, TaskStatus, Tier, WorkerKind};
use overlord_workers::WorkerRegistry;
use uuid::Uuid;

use crate::mirrors::MirrorManager;
use crate::mission_brief::{build_review_prompt, build_worker_prompt, generate_mission_brief};

/// Model forced for the cloud-heavy tier, overriding whatever the worker's
/// own config default is.
const CLOUD_HEAVY_MODEL: &str = "opus";

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub dry_run: bool,
    pub worker_name: Option<WorkerKind>,
    pub skip_review: bool,
    /// `"default"` or `"pm"`.
    pub role: String,
    pub ecosystem_context: Option<String>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            worker_name: None,
            skip_review: false,
            role: "default".to_string(),
            ecosystem_context: None,
        }
    }
}

/// Orchestrates the Analyze → Brief → Provision → Execute → Review loop for
/// one task at a time.
pub struct Dispatcher<'a> {
    queue: &'a WorkQueue,
    config: &'a OverlordConfig,
    mirrors: &'a MirrorManager<'a>,
    governance: &'a GovernanceEngine,
    workers: &'a WorkerRegistry,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        queue: &'a WorkQueue,
        config: &'a OverlordConfig,
        mirrors: &'a MirrorManager<'a>,
        governance: &'a GovernanceEngine,
        workers: &'a WorkerRegistry,
    ) -> Self {
        Self { queue, config, mirrors, governance, workers }
    }

    /// Full lifecycle for one task. On any failure, best-effort transitions
    /// the task to `failed` (only from `dispatched`/`in_review`) before
    /// propagating the error; always unlocks on the way out.
    pub async fn dispatch_task(&self, task_id: Uuid, options: DispatchOptions) -> Result<()> {
        let result = self.run(task_id, &options).await;

        if result.is_err() {
            if let Ok(Some(current)) = self.queue.get_task(task_id).await {
                if matches!(current.status, TaskStatus::Dispatched | TaskStatus::InReview) {
                    let reason = result.as_ref().err().map(|e| e.to_string()).unwrap_or_default();
                    if let Err(e) = self.queue.transition(task_id, TaskStatus::Failed, "dispatcher", Some(&reason)).await {
                        tracing::error!(task_id = %task_id, error = %e, "failed to transition task to failed");
                    }
                }
            }
        }

        if let Err(e) = self.queue.unlock_task(task_id).await {
            tracing::error!(task_id = %task_id, error = %e, "failed to unlock task");
        }

        result
    }

    async fn run(&self, task_id: Uuid, options: &DispatchOptions) -> Result<()> {
        // 1. Load & validate.
        let task = self.queue.get_task(task_id).await?.ok_or_else(|| anyhow!("task not found: {task_id}"))?;
        if task.status != TaskStatus::Active {
            bail!("task {} is '{}', expected 'active'", task.short_id(), task.status);
        }
        let project_config = self
            .config
            .projects
            .get(&task.project)
            .cloned()
            .ok_or_else(|| anyhow!("unknown project: {}", task.project))?;

        // 2. Pre-dispatch health probe (non-dry-run only).
        if !options.dry_run {
            if let Some(issue) = check_project_health(&project_config).await {
                self.queue
                    .transition(task_id, TaskStatus::Failed, "dispatcher", Some(&format!("unhealthy repo: {issue}")))
                    .await?;
                bail!("unhealthy repo: {issue}");
            }
        }

        // 3. Budget pre-check (non-dry-run only).
        if !options.dry_run {
            let ceiling = self.config.cost_controls.daily_ceiling_usd;
            if ceiling > 0.0 {
                let (available, pct) = self.queue.check_budget_available(ceiling).await?;
                if !available {
                    self.queue
                        .transition(task_id, TaskStatus::Failed, "dispatcher", Some("budget exhausted"))
                        .await?;
                    bail!("budget exhausted");
                }
                if pct >= self.config.cost_controls.warning_threshold_pct {
                    let spend = ceiling * pct / 100.0;
                    overlord_observability::emit_budget_warning(&task.project, spend, ceiling, pct);
                }
            }
        }

        // 4. Select worker.
        let (worker, worker_kind) = self.select_worker(&task, options.worker_name)?;

        // Governance pre-dispatch check — same rules the dispatcher gates on.
        let governance = self.governance.pre_dispatch_check(self.queue, &task, &task.project, &project_config).await?;
        if !governance.approved {
            let reasons: Vec<String> = governance.violations.iter().map(|v| v.message.clone()).collect();
            bail!("governance denied dispatch: {}", reasons.join("; "));
        }

        // 5. Lock, then transition active -> dispatched.
        self.queue.lock_task(task_id, &worker_kind.to_string()).await?;
        self.queue
            .transition(
                task_id,
                TaskStatus::Dispatched,
                "dispatcher",
                Some(&format!("dispatched to worker={worker_kind}")),
            )
            .await?;

        let tier = infer_tier_from_task(&task);
        let model = if tier == Tier::CloudHeavy { Some(CLOUD_HEAVY_MODEL) } else { None };

        // 6. Provision worktree.
        let worktree_path = self
            .mirrors
            .provision_worktree(&task.project, task_id, None)
            .await
            .context("provisioning worktree")?;

        // 7. Generate mission brief.
        let brief_path = generate_mission_brief(
            &task,
            &project_config,
            &worktree_path,
            &options.role,
            options.ecosystem_context.as_deref(),
        )
        .await
        .context("generating mission brief")?;

        // 8. Execute (skip if dry_run).
        let exec_result = if options.dry_run {
            None
        } else {
            let prompt = build_worker_prompt(&brief_path).await?;
            let result = worker.execute(&prompt, &worktree_path, &task.complexity, model).await;
            if !result.success {
                self.fail_task(
                    task_id,
                    &worker_kind,
                    &task,
                    &brief_path,
                    Some(&result),
                    &format!("worker execution failed: {}", result.error.clone().unwrap_or_default()),
                    None,
                )
                .await?;
                bail!("worker execution failed");
            }
            Some(result)
        };

        // 9. Record token usage / enforce per-task budget.
        if let Some(result) = &exec_result {
            let estimated_cost = result.tokens_total as f64 * 0.000002;
            self.queue
                .record_token_usage(
                    result.tokens_input as i64,
                    result.tokens_output as i64,
                    estimated_cost,
                    self.config.cost_controls.daily_ceiling_usd,
                )
                .await?;
            if let Some(budget) = task.token_budget {
                if result.tokens_total as i64 > budget {
                    self.fail_task(
                        task_id,
                        &worker_kind,
                        &task,
                        &brief_path,
                        Some(result),
                        &format!("task token budget exceeded: {} > {budget}", result.tokens_total),
                        None,
                    )
                    .await?;
                    bail!("task token budget exceeded");
                }
            }
        }

        // 10. Review (skip if dry_run or skip_review).
        let review_status = if options.dry_run {
            ReviewStatus::Skipped
        } else {
            self.queue
                .transition(
                    task_id,
                    TaskStatus::InReview,
                    "dispatcher",
                    Some(if options.skip_review { "execution complete, review skipped" } else { "execution complete, starting review" }),
                )
                .await?;

            if options.skip_review {
                ReviewStatus::Skipped
            } else {
                let exec_result = exec_result.as_ref().expect("execute ran when not dry_run");
                let reviewer = self
                    .workers
                    .select_reviewer(worker_kind)
                    .ok_or_else(|| anyhow!("no review workers available"))?;
                let review_prompt = build_review_prompt(&brief_path, &exec_result.output).await?;
                let review_result = reviewer.execute(&review_prompt, &worktree_path, "review", None).await;
                if !review_result.success {
                    self.fail_task(
                        task_id,
                        &worker_kind,
                        &task,
                        &brief_path,
                        Some(exec_result),
                        &format!("review failed: {}", review_result.error.clone().unwrap_or_default()),
                        Some(ReviewStatus::Failed),
                    )
                    .await?;
                    bail!("review failed");
                }
                ReviewStatus::Passed
            }
        };

        // 11. Record success.
        self.queue
            .record_dispatch_result(NewDispatchResult {
                task_id,
                worker_id: worker_kind.to_string(),
                model_id: exec_result.as_ref().map(|r| r.model_used.clone()).unwrap_or_default(),
                branch_name: task.branch_name(),
                mission_brief_path: brief_path.display().to_string(),
                review_status: Some(review_status),
                usage_stats: serde_json::json!({
                    "tokens_input": exec_result.as_ref().map(|r| r.tokens_input).unwrap_or(0),
                    "tokens_output": exec_result.as_ref().map(|r| r.tokens_output).unwrap_or(0),
                }),
                output_log: exec_result.as_ref().map(|r| r.output.clone()).unwrap_or_else(|| "dry-run".to_string()),
                tokens_used: exec_result.as_ref().map(|r| r.tokens_total as i64).unwrap_or(0),
            })
            .await?;

        if !options.dry_run {
            self.queue
                .transition(task_id, TaskStatus::Completed, "dispatcher", Some("dispatch completed successfully"))
                .await?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail_task(
        &self,
        task_id: Uuid,
        worker_kind: &WorkerKind,
        task: &Task,
        brief_path: &std::path::Path,
        exec_result: Option<&overlord_types::WorkerResult>,
        reason: &str,
        review_status: Option<ReviewStatus>,
    ) -> Result<()> {
        self.queue
            .record_dispatch_result(NewDispatchResult {
                task_id,
                worker_id: worker_kind.to_string(),
                model_id: exec_result.map(|r| r.model_used.clone()).unwrap_or_default(),
                branch_name: task.branch_name(),
                mission_brief_path: brief_path.display().to_string(),
                review_status,
                usage_stats: serde_json::json!({}),
                output_log: exec_result.map(|r| r.output.clone()).unwrap_or_default(),
                tokens_used: exec_result.map(|r| r.tokens_total as i64).unwrap_or(0),
            })
            .await?;
        self.queue.transition(task_id, TaskStatus::Failed, "dispatcher", Some(reason)).await?;
        Ok(())
    }

    /// Explicit override if given and available; else infer a tier from the
    /// task and resolve tier -> preferred worker, falling back through the
    /// fixed order.
    fn select_worker(&self, task: &Task, explicit: Option<WorkerKind>) -> Result<(&dyn overlord_workers::Worker, WorkerKind)> {
        if let Some(kind) = explicit {
            let worker = self.workers.get(kind).filter(|w| w.available());
            return match worker {
                Some(w) => Ok((w, kind)),
                None => bail!("requested worker '{kind}' is not available"),
            };
        }

        let tier = infer_tier_from_task(task);
        let preferred = overlord_workers::tier_preferred_worker(tier);
        if let Some(w) = self.workers.get(preferred).filter(|w| w.available()) {
            return Ok((w, preferred));
        }

        for kind in overlord_workers::FALLBACK_ORDER {
            if let Some(w) = self.workers.get(*kind).filter(|w| w.available()) {
                return Ok((w, *kind));
            }
        }

        bail!("no eligible workers available")
    }
}

/// Keyword match against title+description (first hit wins), falling back
/// to complexity.
fn infer_tier_from_task(task: &Task) -> Tier {
    let text = format!("{} {}", task.title, task.description).to_lowercase();
    const TIER_MAP: &[(&str, Tier)] = &[
        ("format", Tier::Local),
        ("lint", Tier::Local),
        ("boilerplate", Tier::Local),
        ("review", Tier::CloudFast),
        ("architecture", Tier::CloudHeavy),
        ("planning", Tier::CloudHeavy),
    ];
    for (keyword, tier) in TIER_MAP {
        if text.contains(keyword) {
            return *tier;
        }
    }
    match task.complexity.as_str() {
        "low" => Tier::Local,
        "high" => Tier::CloudHeavy,
        _ => Tier::CloudFast,
    }
}

/// Lightweight project-health probe: dirty working tree is the only signal
/// available without a full ecosystem scan (see `overlord-daemon::scanner`
/// for the richer sweep).
async fn check_project_health(project_config: &ProjectConfig) -> Option<String> {
    if !project_config.path.join(".git").exists() {
        return None;
    }
    let output = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::process::Command::new("git").arg("status").arg("--porcelain").current_dir(&project_config.path).output(),
    )
    .await
    .ok()?
    .ok()?;
    let dirty = String::from_utf8_lossy(&output.stdout);
    if dirty.trim().is_empty() {
        None
    } else {
        Some("uncommitted changes".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlord_types::{Priority, TaskStatus};

    fn task(title: &str, description: &str, complexity: &str) -> Task {
        Task {
            id: Uuid::nil(),
            title: title.to_string(),
            project: "core".to_string(),
            description: description.to_string(),
            status: TaskStatus::Active,
            priority: Priority::Medium,
            complexity: complexity.to_string(),
            external_id: None,
            external_source: None,
            locked_by: None,
            locked_at: None,
            retry_count: 0,
            mirror_path: None,
            token_budget: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn tier_inference_matches_keyword_before_complexity() {
        assert_eq!(infer_tier_from_task(&task("Format the codebase", "", "high")), Tier::Local);
        assert_eq!(infer_tier_from_task(&task("Design the architecture", "", "low")), Tier::CloudHeavy);
    }

    #[test]
    fn tier_inference_falls_back_to_complexity() {
        assert_eq!(infer_tier_from_task(&task("Add a feature", "", "low")), Tier::Local);
        assert_eq!(infer_tier_from_task(&task("Add a feature", "", "high")), Tier::CloudHeavy);
        assert_eq!(infer_tier_from_task(&task("Add a feature", "", "medium")), Tier::CloudFast);
    }
}
