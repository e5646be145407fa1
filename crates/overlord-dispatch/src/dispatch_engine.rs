//! Executes a [`DispatchPlan`]'s steps in dependency order, routing each
//! step either to a configured worker/model-tier or to a direct shell
//! command for the handful of mechanical actions this understands.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::time::{Duration, Instant};

use overlord_config::OverlordConfig;
use overlord_types::{ActionScope, DispatchPlan, DispatchStep};
use overlord_workers::{ModelRouter, WorkerRegistry};
use tokio::process::Command;

/// Phrase -> shell command for actions this executes directly rather than
/// dispatching to a worker. Checked in order; the first substring match wins.
const ACTION_COMMANDS: &[(&str, &str)] = &[
    ("run tests", "pytest -v"),
    ("lint", "ruff check ."),
    ("format code", "ruff format ."),
    ("type check", "mypy ."),
    ("typecheck", "mypy ."),
];

#[derive(Debug, Clone)]
pub struct StepResult {
    pub step_id: String,
    pub success: bool,
    pub output: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub success: bool,
    pub step_results: Vec<StepResult>,
    pub reason: Option<String>,
}

/// Executes dispatch plans. Holds the pieces needed to either run a step
/// directly as a subprocess or route it through a worker/model tier.
pub struct DispatchEngine<'a> {
    config: &'a OverlordConfig,
    workers: &'a WorkerRegistry,
    router: &'a ModelRouter,
}

impl<'a> DispatchEngine<'a> {
    pub fn new(config: &'a OverlordConfig, workers: &'a WorkerRegistry, router: &'a ModelRouter) -> Self {
        Self { config, workers, router }
    }

    /// Runs every step of `plan` in topological order, halting at the first
    /// failure. Requires `auto_approve` when the plan demands approval.
    pub async fn execute(&self, plan: &DispatchPlan, auto_approve: bool) -> DispatchResult {
        if plan.requires_approval && !auto_approve {
            return DispatchResult {
                success: false,
                step_results: vec![],
                reason: Some("plan requires approval".to_string()),
            };
        }

        let order = match topological_order(&plan.steps) {
            Ok(order) => order,
            Err(()) => {
                tracing::error!(task = %plan.task, "dependency cycle detected, falling back to declared order");
                plan.steps.iter().map(|s| s.id.clone()).collect()
            }
        };

        let by_id: HashMap<&str, &DispatchStep> = plan.steps.iter().map(|s| (s.id.as_str(), s)).collect();
        let mut step_results = Vec::with_capacity(order.len());

        for step_id in &order {
            let Some(step) = by_id.get(step_id.as_str()) else { continue };
            let result = self.execute_step(step, &plan.scope).await;
            let failed = !result.success;
            step_results.push(result);
            if failed {
                return DispatchResult {
                    success: false,
                    step_results,
                    reason: Some(format!("step '{step_id}' failed")),
                };
            }
        }

        DispatchResult { success: true, step_results, reason: None }
    }

    async fn execute_step(&self, step: &DispatchStep, scope: &ActionScope) -> StepResult {
        let start = Instant::now();
        let outcome = if step.model_tier.is_some() {
            self.dispatch_to_worker(step).await
        } else {
            self.execute_direct(step, scope).await
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(output) => StepResult { step_id: step.id.clone(), success: true, output, duration_ms },
            Err(reason) => StepResult { step_id: step.id.clone(), success: false, output: reason, duration_ms },
        }
    }

    async fn dispatch_to_worker(&self, step: &DispatchStep) -> Result<String, String> {
        let tier = step.model_tier.expect("dispatch_to_worker called without a tier");
        let preferred = overlord_workers::tier_preferred_worker(tier);
        if let Some(worker) = self.workers.get(preferred).filter(|w| w.available()) {
            let result = worker.execute(&step.action, Path::new("."), &infer_task_type(&step.action), None).await;
            return if result.success {
                Ok(result.output)
            } else {
                Err(result.error.unwrap_or_else(|| "worker execution failed".to_string()))
            };
        }

        match self.router.select_model(&infer_task_type(&step.action), "medium", true) {
            Some(endpoint) => Ok(format!("[Simulated] Dispatched to {}", endpoint.name)),
            None => Err("No healthy model endpoint available".to_string()),
        }
    }

    async fn execute_direct(&self, step: &DispatchStep, scope: &ActionScope) -> Result<String, String> {
        let Some(command) = action_to_command(&step.action) else {
            return Err(format!("no command mapping for action: {}", step.action));
        };

        let project_config = self.config.projects.get(&step.project);
        let Some(project_config) = project_config else {
            return Err(format!("unknown project: {}", step.project));
        };

        if !can_execute_in(&command, &project_config.path) {
            return Ok(format!("[Simulated] Executed: {command}"));
        }

        let _ = scope; // scope gates approval upstream; execution itself is unconditional here.
        let timeout = Duration::from_secs(step.timeout_secs);
        let run = Command::new("sh").arg("-c").arg(&command).current_dir(&project_config.path).output();

        match tokio::time::timeout(timeout, run).await {
            Ok(Ok(output)) => {
                let combined = format!(
                    "{}{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                );
                if output.status.success() {
                    Ok(combined)
                } else {
                    Err(format!("exit code {:?}: {combined}", output.status.code()))
                }
            }
            Ok(Err(e)) => Err(format!("failed to run command: {e}")),
            Err(_) => Err(format!("command timed out after {}s", step.timeout_secs)),
        }
    }
}

fn action_to_command(action: &str) -> Option<String> {
    let lower = action.to_lowercase();
    for (phrase, command) in ACTION_COMMANDS {
        if lower.contains(phrase) {
            return Some(command.to_string());
        }
    }

    if let Some(captures) = regex::Regex::new(r"merge (\S+) (?:to|into) (\S+)").unwrap().captures(&lower) {
        let source = &captures[1];
        let target = &captures[2];
        return Some(format!("git checkout {target} && git merge --no-ff {source}"));
    }

    if let Some(captures) = regex::Regex::new(r"checkout (\S+)").unwrap().captures(&lower) {
        return Some(format!("git checkout {}", &captures[1]));
    }

    None
}

/// A command only runs for real when the project looks like it has the
/// structure that command expects; otherwise it's simulated rather than
/// risking an error against an unrelated directory.
fn can_execute_in(command: &str, project_path: &Path) -> bool {
    if command.starts_with("git") {
        return project_path.join(".git").exists();
    }
    if command.starts_with("pytest") || command.starts_with("ruff") || command.starts_with("mypy") {
        return project_path.join("pyproject.toml").exists() || project_path.join("setup.py").exists();
    }
    false
}

fn infer_task_type(action: &str) -> String {
    let lower = action.to_lowercase();
    if ["format", "lint", "style"].iter().any(|k| lower.contains(k)) {
        "format".to_string()
    } else if ["review", "check", "validate"].iter().any(|k| lower.contains(k)) {
        "review".to_string()
    } else if ["feature", "implement", "add"].iter().any(|k| lower.contains(k)) {
        "feature".to_string()
    } else if ["architecture", "design", "plan"].iter().any(|k| lower.contains(k)) {
        "architecture".to_string()
    } else {
        "feature".to_string()
    }
}

/// Kahn's algorithm over step dependencies; ties broken by declared order
/// so the result is deterministic. Returns `Err(())` on a cycle.
fn topological_order(steps: &[DispatchStep]) -> Result<Vec<String>, ()> {
    let ids: Vec<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    let index: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut in_degree: Vec<usize> = vec![0; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];

    for (i, step) in steps.iter().enumerate() {
        for dep in &step.dependencies {
            let Some(&dep_idx) = index.get(dep.as_str()) else { continue };
            dependents[dep_idx].push(i);
            in_degree[i] += 1;
        }
    }

    let mut queue: VecDeque<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());
    let mut visited: HashSet<usize> = HashSet::new();

    while let Some(i) = queue.pop_front() {
        if !visited.insert(i) {
            continue;
        }
        order.push(steps[i].id.clone());
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if order.len() != steps.len() {
        return Err(());
    }
    Ok(order)
}

/// Builds a single-step plan for ad hoc dispatch outside the natural
/// language parser.
pub fn build_simple_plan(task: &str, project: &str, scope: ActionScope, requires_approval: bool) -> DispatchPlan {
    DispatchPlan {
        task: task.to_string(),
        steps: vec![DispatchStep {
            id: "step-1".to_string(),
            action: task.to_string(),
            project: project.to_string(),
            dependencies: vec![],
            model_tier: None,
            timeout_secs: 300,
        }],
        scope,
        estimated_duration_secs: 300,
        requires_approval,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlord_types::ScopeImpact;

    fn scope() -> ActionScope {
        ActionScope {
            projects: vec!["core".to_string()],
            branches: vec![],
            destructive: false,
            reversible: true,
            affects_remote: false,
            estimated_impact: ScopeImpact::Low,
        }
    }

    fn step(id: &str, action: &str, deps: &[&str]) -> DispatchStep {
        DispatchStep {
            id: id.to_string(),
            action: action.to_string(),
            project: "core".to_string(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            model_tier: None,
            timeout_secs: 60,
        }
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let steps = vec![step("a", "run tests", &[]), step("b", "lint", &["a"]), step("c", "format code", &["b"])];
        let order = topological_order(&steps).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn topological_order_detects_cycle() {
        let steps = vec![step("a", "run tests", &["b"]), step("b", "lint", &["a"])];
        assert!(topological_order(&steps).is_err());
    }

    #[test]
    fn action_to_command_maps_known_phrases() {
        assert_eq!(action_to_command("Run tests please"), Some("pytest -v".to_string()));
        assert_eq!(action_to_command("please lint this"), Some("ruff check .".to_string()));
    }

    #[test]
    fn action_to_command_handles_merge_and_checkout() {
        assert_eq!(action_to_command("merge feat/x into develop"), Some("git checkout develop && git merge --no-ff feat/x".to_string()));
        assert_eq!(action_to_command("checkout develop"), Some("git checkout develop".to_string()));
    }

    #[test]
    fn action_to_command_returns_none_for_unknown_phrase() {
        assert_eq!(action_to_command("do something mysterious"), None);
    }

    #[test]
    fn can_execute_in_requires_structure_markers() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!can_execute_in("pytest -v", tmp.path()));
        std::fs::write(tmp.path().join("pyproject.toml"), "").unwrap();
        assert!(can_execute_in("pytest -v", tmp.path()));
    }

    #[test]
    fn build_simple_plan_has_single_step() {
        let plan = build_simple_plan("run tests", "core", scope(), false);
        assert_eq!(plan.steps.len(), 1);
        assert!(!plan.requires_approval);
    }
}
