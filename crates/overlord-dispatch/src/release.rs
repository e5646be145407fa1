//! Coordinates a multi-project release: tests, merge, tag, cascade version
//! bumps to downstream dependents, and optionally push.

use overlord_config::OverlordConfig;
use overlord_graph::DependencyGraph;
use overlord_types::{ActionScope, DispatchPlan, DispatchStep, ScopeImpact};

use crate::dispatch_engine::{DispatchEngine, DispatchResult};

#[derive(Debug, Clone)]
pub struct ReleaseSpec {
    pub project: String,
    pub version: String,
    pub source_branch: String,
    pub target_branch: String,
    pub update_dependents: bool,
    pub push_to_remote: bool,
}

impl ReleaseSpec {
    pub fn new(project: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            version: version.into(),
            source_branch: "develop".to_string(),
            target_branch: "main".to_string(),
            update_dependents: true,
            push_to_remote: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("unknown project: {0}")]
    UnknownProject(String),
    #[error("invalid version string '{0}': {1}")]
    InvalidVersion(String, String),
    #[error("source and target branch must differ")]
    SameBranch,
    #[error("source branch must not be empty")]
    EmptySourceBranch,
    #[error("target branch must not be empty")]
    EmptyTargetBranch,
    #[error("graph error: {0}")]
    Graph(#[from] overlord_graph::GraphError),
}

/// Validates a release spec, collecting every problem rather than
/// short-circuiting on the first one found (except an unknown project,
/// which makes the rest of the checks meaningless).
pub fn validate_release_spec(spec: &ReleaseSpec, config: &OverlordConfig) -> Vec<String> {
    let mut errors = Vec::new();

    if !config.projects.contains_key(&spec.project) {
        errors.push(format!("unknown project: {}", spec.project));
        return errors;
    }

    if let Err(e) = parse_version_string(&spec.version) {
        errors.push(e.to_string());
    }
    if spec.source_branch.is_empty() {
        errors.push("source branch must not be empty".to_string());
    }
    if spec.target_branch.is_empty() {
        errors.push("target branch must not be empty".to_string());
    }
    if spec.source_branch == spec.target_branch {
        errors.push("source and target branch must differ".to_string());
    }

    errors
}

/// Parses `vMAJOR.MINOR.PATCH` (the `v` prefix is optional).
pub fn parse_version_string(version: &str) -> Result<(u64, u64, u64), ReleaseError> {
    let stripped = version.strip_prefix('v').unwrap_or(version);
    let parts: Vec<&str> = stripped.split('.').collect();
    if parts.len() != 3 {
        return Err(ReleaseError::InvalidVersion(
            version.to_string(),
            "expected exactly 3 dot-separated components".to_string(),
        ));
    }
    let mut numbers = [0u64; 3];
    for (i, part) in parts.iter().enumerate() {
        numbers[i] = part
            .parse()
            .map_err(|_| ReleaseError::InvalidVersion(version.to_string(), format!("'{part}' is not an integer")))?;
    }
    Ok((numbers[0], numbers[1], numbers[2]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionBump {
    Major,
    Minor,
    Patch,
}

/// Bumps `current` by `bump`, resetting every component below it to zero.
pub fn suggest_next_version(current: &str, bump: VersionBump) -> Result<String, ReleaseError> {
    let (major, minor, patch) = parse_version_string(current)?;
    let (major, minor, patch) = match bump {
        VersionBump::Major => (major + 1, 0, 0),
        VersionBump::Minor => (major, minor + 1, 0),
        VersionBump::Patch => (major, minor, patch + 1),
    };
    Ok(format!("v{major}.{minor}.{patch}"))
}

/// Builds and, on request, executes the dispatch plan for a release.
pub struct ReleaseCoordinator<'a> {
    config: &'a OverlordConfig,
    graph: &'a DependencyGraph<'a>,
}

impl<'a> ReleaseCoordinator<'a> {
    pub fn new(config: &'a OverlordConfig, graph: &'a DependencyGraph<'a>) -> Self {
        Self { config, graph }
    }

    pub fn plan_release(&self, spec: &ReleaseSpec) -> Result<DispatchPlan, ReleaseError> {
        if !self.config.projects.contains_key(&spec.project) {
            return Err(ReleaseError::UnknownProject(spec.project.clone()));
        }
        if spec.source_branch.is_empty() {
            return Err(ReleaseError::EmptySourceBranch);
        }
        if spec.target_branch.is_empty() {
            return Err(ReleaseError::EmptyTargetBranch);
        }
        if spec.source_branch == spec.target_branch {
            return Err(ReleaseError::SameBranch);
        }
        parse_version_string(&spec.version)?;

        let mut next_id = 0u32;
        let mut id = || {
            next_id += 1;
            format!("step-{next_id}")
        };

        let mut steps = Vec::new();

        let validate_id = id();
        steps.push(DispatchStep {
            id: validate_id.clone(),
            action: "validate tests".to_string(),
            project: spec.project.clone(),
            dependencies: vec![],
            model_tier: None,
            timeout_secs: 300,
        });

        let merge_id = id();
        steps.push(DispatchStep {
            id: merge_id.clone(),
            action: format!("merge {} to {}", spec.source_branch, spec.target_branch),
            project: spec.project.clone(),
            dependencies: vec![validate_id],
            model_tier: None,
            timeout_secs: 60,
        });

        let tag_id = id();
        steps.push(DispatchStep {
            id: tag_id.clone(),
            action: format!("tag {}", spec.version),
            project: spec.project.clone(),
            dependencies: vec![merge_id],
            model_tier: None,
            timeout_secs: 30,
        });

        let mut dependent_test_ids = Vec::new();
        if spec.update_dependents {
            for dependent in self.graph.downstream(&spec.project)? {
                let update_id = id();
                steps.push(DispatchStep {
                    id: update_id.clone(),
                    action: format!("update {} to {}", dependent, spec.version),
                    project: dependent.clone(),
                    dependencies: vec![tag_id.clone()],
                    model_tier: None,
                    timeout_secs: 180,
                });

                let test_id = id();
                steps.push(DispatchStep {
                    id: test_id.clone(),
                    action: "validate tests".to_string(),
                    project: dependent.clone(),
                    dependencies: vec![update_id],
                    model_tier: None,
                    timeout_secs: 300,
                });
                dependent_test_ids.push(test_id);
            }
        }

        if spec.push_to_remote {
            let mut push_deps = vec![tag_id.clone()];
            push_deps.extend(dependent_test_ids.clone());
            let push_id = id();
            steps.push(DispatchStep {
                id: push_id.clone(),
                action: "push to remote".to_string(),
                project: spec.project.clone(),
                dependencies: push_deps,
                model_tier: None,
                timeout_secs: 60,
            });

            for dependent in self.graph.downstream(&spec.project)? {
                steps.push(DispatchStep {
                    id: id(),
                    action: "push to remote".to_string(),
                    project: dependent,
                    dependencies: vec![push_id.clone()],
                    model_tier: None,
                    timeout_secs: 60,
                });
            }
        }

        let projects = self.graph.affected_by(&spec.project)?;
        let scope = ActionScope {
            projects,
            branches: vec![spec.source_branch.clone(), spec.target_branch.clone()],
            destructive: false,
            reversible: !spec.push_to_remote,
            affects_remote: spec.push_to_remote,
            estimated_impact: ScopeImpact::High,
        };

        let estimated_duration_secs = steps.iter().map(|s| s.timeout_secs).sum();

        Ok(DispatchPlan {
            task: format!("release {} {}", spec.project, spec.version),
            steps,
            scope,
            estimated_duration_secs,
            requires_approval: true,
        })
    }

    pub async fn execute_release(
        &self,
        spec: &ReleaseSpec,
        engine: &DispatchEngine<'_>,
        auto_approve: bool,
    ) -> Result<DispatchResult, ReleaseError> {
        let plan = self.plan_release(spec)?;
        let result = engine.execute(&plan, auto_approve).await;

        let downstream_updated = self.graph.downstream(&spec.project).map(|d| d.len()).unwrap_or(0);
        let detail = format!("version={} downstream_updated={downstream_updated} pushed={}", spec.version, spec.push_to_remote);
        overlord_observability::emit_event(
            if result.success { tracing::Level::INFO } else { tracing::Level::WARN },
            overlord_observability::ProcessKind::Dispatch,
            overlord_observability::ObservabilityEvent::new("release", "release")
                .project(&spec.project)
                .status(if result.success { "success" } else { "failed" })
                .detail(&detail),
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlord_config::{AutonomyConfig, CostControlConfig, NotificationConfig, ProjectConfig, ScheduleConfig};
    use overlord_types::{BranchModel, ProjectRole};
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn config() -> OverlordConfig {
        let mut projects = HashMap::new();
        projects.insert(
            "core".to_string(),
            ProjectConfig {
                path: PathBuf::from("/tmp/core"),
                remote: "org/core".to_string(),
                role: ProjectRole::SharedLibrary,
                branch_model: BranchModel::DevelopMain,
                depends_on: vec![],
            },
        );
        projects.insert(
            "api".to_string(),
            ProjectConfig {
                path: PathBuf::from("/tmp/api"),
                remote: "org/api".to_string(),
                role: ProjectRole::PlatformDeployment,
                branch_model: BranchModel::DevelopMain,
                depends_on: vec!["core".to_string()],
            },
        );
        OverlordConfig {
            workspace_root: None,
            projects,
            autonomy: AutonomyConfig::default(),
            models: HashMap::new(),
            schedule: ScheduleConfig::default(),
            workers: HashMap::new(),
            notifications: NotificationConfig::default(),
            cost_controls: CostControlConfig::default(),
            llm_fallback: overlord_config::LlmFallbackConfig::default(),
        }
    }

    #[test]
    fn parse_version_string_strips_v_prefix() {
        assert_eq!(parse_version_string("v1.2.3").unwrap(), (1, 2, 3));
        assert_eq!(parse_version_string("1.2.3").unwrap(), (1, 2, 3));
    }

    #[test]
    fn parse_version_string_rejects_wrong_arity() {
        assert!(parse_version_string("1.2").is_err());
        assert!(parse_version_string("1.2.3.4").is_err());
    }

    #[test]
    fn suggest_next_version_resets_lower_components() {
        assert_eq!(suggest_next_version("v1.2.3", VersionBump::Minor).unwrap(), "v1.3.0");
        assert_eq!(suggest_next_version("v1.2.3", VersionBump::Major).unwrap(), "v2.0.0");
        assert_eq!(suggest_next_version("v1.2.3", VersionBump::Patch).unwrap(), "v1.2.4");
    }

    #[test]
    fn validate_release_spec_collects_all_errors() {
        let config = config();
        let mut spec = ReleaseSpec::new("core", "not-a-version");
        spec.source_branch = "same".to_string();
        spec.target_branch = "same".to_string();
        let errors = validate_release_spec(&spec, &config);
        assert!(errors.len() >= 2);
    }

    #[test]
    fn plan_release_cascades_to_downstream_dependents() {
        let config = config();
        let graph = DependencyGraph::new(&config);
        let coordinator = ReleaseCoordinator::new(&config, &graph);
        let spec = ReleaseSpec::new("core", "v1.0.0");
        let plan = coordinator.plan_release(&spec).unwrap();
        assert!(plan.steps.iter().any(|s| s.project == "api" && s.action.starts_with("update")));
        assert!(plan.requires_approval);
        assert_eq!(plan.scope.estimated_impact, ScopeImpact::High);
    }

    #[test]
    fn plan_release_rejects_same_source_and_target_branch() {
        let config = config();
        let graph = DependencyGraph::new(&config);
        let coordinator = ReleaseCoordinator::new(&config, &graph);
        let mut spec = ReleaseSpec::new("core", "v1.0.0");
        spec.target_branch = spec.source_branch.clone();
        assert!(matches!(coordinator.plan_release(&spec), Err(ReleaseError::SameBranch)));
    }
}
