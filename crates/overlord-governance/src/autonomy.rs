//! Autonomy levels and blast-radius evaluation — the pre-execution gate
//! that decides whether a proposed [`ActionScope`] may proceed, must
//! escalate for approval, or is denied outright.

use overlord_config::AutonomyConfig;
use overlord_types::{ActionScope, AutonomyLevel, ScopeImpact, ScopeVerdict};

/// Evaluates `scope` against `level` per the autonomy-level decision table
/// (spec §4.4). Independent of any per-project pre-approved-action list —
/// that refinement lives in [`AutonomyEngine::can_auto_execute`].
pub fn evaluate_scope(scope: &ActionScope, level: AutonomyLevel) -> ScopeVerdict {
    if scope.destructive && scope.affects_remote {
        return ScopeVerdict {
            approved: false,
            reason: "destructive remote action requires explicit approval".to_string(),
            escalation_required: true,
        };
    }

    match level {
        AutonomyLevel::Cautious => {
            if scope.estimated_impact == ScopeImpact::Low && !scope.affects_remote {
                ScopeVerdict {
                    approved: true,
                    reason: "low-impact local action auto-approved under cautious mode".to_string(),
                    escalation_required: false,
                }
            } else {
                ScopeVerdict {
                    approved: false,
                    reason: "cautious mode requires approval for non-trivial actions".to_string(),
                    escalation_required: scope.estimated_impact >= ScopeImpact::Medium,
                }
            }
        }
        AutonomyLevel::Proactive => {
            if scope.estimated_impact == ScopeImpact::Low {
                ScopeVerdict {
                    approved: true,
                    reason: "low-impact action auto-approved under proactive mode".to_string(),
                    escalation_required: false,
                }
            } else {
                ScopeVerdict {
                    approved: false,
                    reason: format!(
                        "{}-impact action requires approval under proactive mode",
                        scope.estimated_impact
                    ),
                    escalation_required: scope.estimated_impact == ScopeImpact::High,
                }
            }
        }
        AutonomyLevel::Scheduled => {
            if scope.estimated_impact == ScopeImpact::Low {
                ScopeVerdict {
                    approved: true,
                    reason: "low-impact action auto-approved under scheduled mode".to_string(),
                    escalation_required: false,
                }
            } else if scope.estimated_impact == ScopeImpact::Medium && !scope.affects_remote {
                ScopeVerdict {
                    approved: true,
                    reason: "medium-impact local action auto-approved under scheduled mode".to_string(),
                    escalation_required: false,
                }
            } else {
                ScopeVerdict {
                    approved: false,
                    reason: format!(
                        "{}-impact action escalated under scheduled mode",
                        scope.estimated_impact
                    ),
                    escalation_required: true,
                }
            }
        }
    }
}

/// Independent of autonomy level: certain scopes always require escalation.
pub fn should_escalate(scope: &ActionScope) -> bool {
    (scope.destructive && scope.affects_remote)
        || (scope.estimated_impact == ScopeImpact::High && scope.projects.len() > 1)
}

/// Wraps an [`AutonomyConfig`] with the decision methods the dispatcher and
/// proposal manager call against: effective level, auto-execute eligibility,
/// and whether an action should be proactively proposed.
pub struct AutonomyEngine<'a> {
    config: &'a AutonomyConfig,
}

impl<'a> AutonomyEngine<'a> {
    pub fn new(config: &'a AutonomyConfig) -> Self {
        Self { config }
    }

    pub fn level(&self, project: Option<&str>) -> AutonomyLevel {
        match project {
            Some(p) => self.config.effective_level(p),
            None => self.config.global,
        }
    }

    /// `cautious` never auto-executes; `proactive` only for safe-local
    /// scopes; `scheduled` only when the action is pre-approved for every
    /// project in scope.
    pub fn can_auto_execute(&self, action: &str, scope: &ActionScope, project: Option<&str>) -> bool {
        match self.level(project) {
            AutonomyLevel::Cautious => false,
            AutonomyLevel::Proactive => is_safe_local(scope),
            AutonomyLevel::Scheduled => self.is_pre_approved(action, scope),
        }
    }

    pub fn should_propose(&self, action: &str, scope: &ActionScope, project: Option<&str>) -> bool {
        match self.level(project) {
            AutonomyLevel::Cautious => false,
            AutonomyLevel::Proactive => {
                matches!(scope.estimated_impact, ScopeImpact::Low | ScopeImpact::Medium)
            }
            AutonomyLevel::Scheduled => !self.is_pre_approved(action, scope),
        }
    }

    /// An action must be pre-approved for *every* project the scope touches.
    fn is_pre_approved(&self, action: &str, scope: &ActionScope) -> bool {
        if scope.projects.is_empty() {
            return false;
        }
        scope
            .projects
            .iter()
            .all(|project| self.config.is_pre_approved(project, action))
    }
}

/// Scope for merging one local branch into another within a single project.
pub fn scope_for_merge(project: &str, source: &str, target: &str) -> ActionScope {
    ActionScope {
        projects: vec![project.to_string()],
        branches: vec![source.to_string(), target.to_string()],
        destructive: false,
        reversible: true,
        affects_remote: false,
        estimated_impact: ScopeImpact::Medium,
    }
}

/// Scope for pushing to a remote; impact escalates to high across more than
/// one project.
pub fn scope_for_push(projects: Vec<String>) -> ActionScope {
    let impact = if projects.len() > 1 {
        ScopeImpact::High
    } else {
        ScopeImpact::Medium
    };
    ActionScope {
        projects,
        branches: vec![],
        destructive: false,
        reversible: false,
        affects_remote: true,
        estimated_impact: impact,
    }
}

fn is_safe_local(scope: &ActionScope) -> bool {
    !scope.destructive
        && scope.reversible
        && !scope.affects_remote
        && matches!(scope.estimated_impact, ScopeImpact::Low | ScopeImpact::Medium)
}

/// Generic read-only scope: always safe to auto-approve, used by status/scan
/// style actions that touch no working tree.
pub fn scope_read_only() -> ActionScope {
    ActionScope {
        projects: vec![],
        branches: vec![],
        destructive: false,
        reversible: true,
        affects_remote: false,
        estimated_impact: ScopeImpact::Low,
    }
}

/// Generic template for a local-only merge, before the concrete
/// project/source/target are known (see [`scope_for_merge`] for that).
pub fn scope_local_merge() -> ActionScope {
    ActionScope {
        projects: vec![],
        branches: vec![],
        destructive: false,
        reversible: true,
        affects_remote: false,
        estimated_impact: ScopeImpact::Medium,
    }
}

/// Generic template for a remote push, before the concrete project list is
/// known (see [`scope_for_push`] for that).
pub fn scope_push() -> ActionScope {
    ActionScope {
        projects: vec![],
        branches: vec![],
        destructive: false,
        reversible: false,
        affects_remote: true,
        estimated_impact: ScopeImpact::Medium,
    }
}

/// Generic template for a coordinated release, before the concrete project
/// and downstream set are known (see [`scope_for_release`] for that).
pub fn scope_release() -> ActionScope {
    ActionScope {
        projects: vec![],
        branches: vec![],
        destructive: false,
        reversible: true,
        affects_remote: false,
        estimated_impact: ScopeImpact::High,
    }
}

/// Scope for a coordinated release of `project`: every project the graph
/// says is affected (self + downstream), high impact, reversible until a
/// push is actually requested.
pub fn scope_for_release(project: &str, graph: &overlord_graph::DependencyGraph<'_>) -> ActionScope {
    let projects = graph.affected_by(project).unwrap_or_else(|_| vec![project.to_string()]);
    ActionScope {
        projects,
        branches: vec!["develop".to_string(), "main".to_string()],
        destructive: false,
        reversible: true,
        affects_remote: false,
        estimated_impact: ScopeImpact::High,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn scope(destructive: bool, affects_remote: bool, impact: ScopeImpact) -> ActionScope {
        ActionScope {
            projects: vec!["core".to_string()],
            branches: vec![],
            destructive,
            reversible: !destructive,
            affects_remote,
            estimated_impact: impact,
        }
    }

    #[test]
    fn destructive_remote_always_denies_and_escalates() {
        let verdict = evaluate_scope(&scope(true, true, ScopeImpact::Low), AutonomyLevel::Scheduled);
        assert!(!verdict.approved);
        assert!(verdict.escalation_required);
    }

    #[test]
    fn cautious_approves_only_low_local() {
        let verdict = evaluate_scope(&scope(false, false, ScopeImpact::Low), AutonomyLevel::Cautious);
        assert!(verdict.approved);
        let verdict = evaluate_scope(&scope(false, false, ScopeImpact::Medium), AutonomyLevel::Cautious);
        assert!(!verdict.approved);
        assert!(verdict.escalation_required);
    }

    #[test]
    fn scheduled_approves_medium_local_but_not_remote() {
        let local = evaluate_scope(&scope(false, false, ScopeImpact::Medium), AutonomyLevel::Scheduled);
        assert!(local.approved);
        let remote = evaluate_scope(&scope(false, true, ScopeImpact::Medium), AutonomyLevel::Scheduled);
        assert!(!remote.approved);
        assert!(remote.escalation_required);
    }

    #[test]
    fn should_escalate_flags_high_impact_multi_project() {
        let mut s = scope(false, false, ScopeImpact::High);
        s.projects = vec!["a".to_string(), "b".to_string()];
        assert!(should_escalate(&s));
    }

    #[test]
    fn proactive_auto_executes_only_safe_local() {
        let mut pre_approved = HashMap::new();
        pre_approved.insert("core".to_string(), vec!["run tests".to_string()]);
        let config = AutonomyConfig {
            global: AutonomyLevel::Proactive,
            overrides: HashMap::new(),
            pre_approved,
        };
        let engine = AutonomyEngine::new(&config);
        let safe = scope(false, false, ScopeImpact::Medium);
        assert!(engine.can_auto_execute("run tests", &safe, Some("core")));
        let remote = scope(false, true, ScopeImpact::Medium);
        assert!(!engine.can_auto_execute("run tests", &remote, Some("core")));
    }

    #[test]
    fn scope_release_template_is_high_impact_and_reversible() {
        let scope = scope_release();
        assert_eq!(scope.estimated_impact, ScopeImpact::High);
        assert!(scope.reversible);
        assert!(!scope.affects_remote);
    }

    #[test]
    fn scope_for_release_includes_downstream_projects() {
        use overlord_config::{
            AutonomyConfig, CostControlConfig, NotificationConfig, OverlordConfig, ProjectConfig,
            ScheduleConfig,
        };
        use overlord_graph::DependencyGraph;
        use overlord_types::{BranchModel, ProjectRole};
        use std::path::PathBuf;

        let mut projects = HashMap::new();
        projects.insert(
            "core".to_string(),
            ProjectConfig {
                path: PathBuf::from("."),
                remote: "org/core".into(),
                role: ProjectRole::SharedLibrary,
                branch_model: BranchModel::DevelopMain,
                depends_on: vec![],
            },
        );
        projects.insert(
            "api".to_string(),
            ProjectConfig {
                path: PathBuf::from("."),
                remote: "org/api".into(),
                role: ProjectRole::PlatformDeployment,
                branch_model: BranchModel::DevelopMain,
                depends_on: vec!["core".to_string()],
            },
        );
        let config = OverlordConfig {
            workspace_root: None,
            projects,
            autonomy: AutonomyConfig::default(),
            models: HashMap::new(),
            schedule: ScheduleConfig::default(),
            workers: HashMap::new(),
            notifications: NotificationConfig::default(),
            cost_controls: CostControlConfig::default(),
            llm_fallback: overlord_config::LlmFallbackConfig::default(),
        };
        let graph = DependencyGraph::new(&config);
        let scope = scope_for_release("core", &graph);
        assert!(scope.projects.contains(&"core".to_string()));
        assert!(scope.projects.contains(&"api".to_string()));
    }

    #[test]
    fn scheduled_requires_pre_approval_for_every_project_in_scope() {
        let mut pre_approved = HashMap::new();
        pre_approved.insert("core".to_string(), vec!["clean branches".to_string()]);
        let config = AutonomyConfig {
            global: AutonomyLevel::Scheduled,
            overrides: HashMap::new(),
            pre_approved,
        };
        let engine = AutonomyEngine::new(&config);
        let mut s = scope(true, false, ScopeImpact::Low);
        s.projects = vec!["core".to_string(), "api".to_string()];
        assert!(!engine.can_auto_execute("clean branches", &s, None));
    }
}
