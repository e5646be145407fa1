//! Parses short natural-language task descriptions into [`DispatchPlan`]s
//! for the handful of shapes this recognizes (merge, test, clean branches,
//! multi-project update), falling back to a single generic step.

use once_cell::sync::Lazy;
use overlord_config::OverlordConfig;
use overlord_types::{ActionScope, DispatchPlan, DispatchStep, ScopeImpact};
use regex::Regex;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unknown project: {0}")]
    UnknownProject(String),
    #[error("no projects configured")]
    NoProjects,
}

static MERGE_IN_PROJECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)merge\s+(?P<project>\S+)\s+(?P<source>\S+)\s+(?:to|into)\s+(?P<target>\S+)").unwrap());
static MERGE_WITH_IN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)merge\s+(?P<source>\S+)\s+(?:to|into)\s+(?P<target>\S+)\s+in\s+(?P<project>\S+)").unwrap());
static TEST_SINGLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)tests?\s+in\s+(?P<project>\S+)").unwrap());
static TEST_ALL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)tests?\s+across\s+all").unwrap());
static CLEAN_BRANCHES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)clean\s+(?:stale\s+)?branch(?:es)?\s+in\s+(?P<projects>.+)").unwrap());
static MULTI_PROJECT_UPDATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)update\s+(?P<dependency>\S+)\s+in\s+(?P<projects>.+)").unwrap());

fn split_project_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("and"))
        .map(|s| s.to_string())
        .collect()
}

fn read_only_scope(projects: Vec<String>) -> ActionScope {
    ActionScope { projects, branches: vec![], destructive: false, reversible: true, affects_remote: false, estimated_impact: ScopeImpact::Low }
}

/// Parses natural language task descriptions into dispatch plans, grounded
/// in the set of projects known to `config`.
pub struct TaskParser<'a> {
    config: &'a OverlordConfig,
}

impl<'a> TaskParser<'a> {
    pub fn new(config: &'a OverlordConfig) -> Self {
        Self { config }
    }

    pub fn parse(&self, task: &str) -> Result<DispatchPlan, ParseError> {
        if let Some(plan) = self.parse_merge(task)? {
            return Ok(plan);
        }
        if let Some(plan) = self.parse_test(task)? {
            return Ok(plan);
        }
        if let Some(plan) = self.parse_clean_branches(task)? {
            return Ok(plan);
        }
        if let Some(plan) = self.parse_multi_project(task)? {
            return Ok(plan);
        }
        self.parse_generic(task)
    }

    fn require_project(&self, name: &str) -> Result<String, ParseError> {
        if self.config.projects.contains_key(name) {
            Ok(name.to_string())
        } else {
            Err(ParseError::UnknownProject(name.to_string()))
        }
    }

    fn parse_merge(&self, task: &str) -> Result<Option<DispatchPlan>, ParseError> {
        let captures = MERGE_IN_PROJECT.captures(task).or_else(|| MERGE_WITH_IN.captures(task));
        let Some(captures) = captures else { return Ok(None) };

        let project = self.require_project(&captures["project"])?;
        let source = captures["source"].to_string();
        let target = captures["target"].to_string();

        Ok(Some(DispatchPlan {
            task: task.to_string(),
            steps: vec![DispatchStep {
                id: "merge".to_string(),
                action: format!("merge {source} into {target}"),
                project: project.clone(),
                dependencies: vec![],
                model_tier: None,
                timeout_secs: 60,
            }],
            scope: ActionScope {
                projects: vec![project],
                branches: vec![source, target],
                destructive: false,
                reversible: true,
                affects_remote: false,
                estimated_impact: ScopeImpact::Medium,
            },
            estimated_duration_secs: 60,
            requires_approval: true,
        }))
    }

    fn parse_test(&self, task: &str) -> Result<Option<DispatchPlan>, ParseError> {
        if TEST_ALL.is_match(task) {
            if self.config.projects.is_empty() {
                return Err(ParseError::NoProjects);
            }
            let projects: Vec<String> = self.config.projects.keys().cloned().collect();
            let mut sorted = projects.clone();
            sorted.sort();
            let steps = sorted
                .iter()
                .enumerate()
                .map(|(i, project)| DispatchStep {
                    id: format!("test-{i}"),
                    action: "run tests".to_string(),
                    project: project.clone(),
                    dependencies: vec![],
                    model_tier: None,
                    timeout_secs: 300,
                })
                .collect();
            return Ok(Some(DispatchPlan {
                task: task.to_string(),
                steps,
                scope: read_only_scope_medium(sorted),
                estimated_duration_secs: 300,
                requires_approval: false,
            }));
        }

        let Some(captures) = TEST_SINGLE.captures(task) else { return Ok(None) };
        let project = self.require_project(&captures["project"])?;
        Ok(Some(DispatchPlan {
            task: task.to_string(),
            steps: vec![DispatchStep {
                id: "test".to_string(),
                action: "run tests".to_string(),
                project: project.clone(),
                dependencies: vec![],
                model_tier: None,
                timeout_secs: 300,
            }],
            scope: read_only_scope(vec![project]),
            estimated_duration_secs: 300,
            requires_approval: false,
        }))
    }

    fn parse_clean_branches(&self, task: &str) -> Result<Option<DispatchPlan>, ParseError> {
        let Some(captures) = CLEAN_BRANCHES.captures(task) else { return Ok(None) };
        let projects = split_project_list(&captures["projects"]);
        if projects.is_empty() {
            return Err(ParseError::NoProjects);
        }
        for p in &projects {
            self.require_project(p)?;
        }

        let steps = projects
            .iter()
            .enumerate()
            .map(|(i, project)| DispatchStep {
                id: format!("clean-{i}"),
                action: "clean stale branches".to_string(),
                project: project.clone(),
                dependencies: vec![],
                model_tier: None,
                timeout_secs: 120,
            })
            .collect();

        Ok(Some(DispatchPlan {
            task: task.to_string(),
            steps,
            scope: ActionScope {
                projects: projects.clone(),
                branches: vec![],
                destructive: true,
                reversible: false,
                affects_remote: false,
                estimated_impact: ScopeImpact::Low,
            },
            estimated_duration_secs: 120 * projects.len() as u64,
            requires_approval: true,
        }))
    }

    fn parse_multi_project(&self, task: &str) -> Result<Option<DispatchPlan>, ParseError> {
        let Some(captures) = MULTI_PROJECT_UPDATE.captures(task) else { return Ok(None) };
        let dependency = captures["dependency"].to_string();
        let projects = split_project_list(&captures["projects"]);
        if projects.is_empty() {
            return Err(ParseError::NoProjects);
        }
        for p in &projects {
            self.require_project(p)?;
        }

        let steps = projects
            .iter()
            .enumerate()
            .map(|(i, project)| DispatchStep {
                id: format!("update-{i}"),
                action: format!("update {dependency}"),
                project: project.clone(),
                dependencies: vec![],
                model_tier: None,
                timeout_secs: 180,
            })
            .collect();

        Ok(Some(DispatchPlan {
            task: task.to_string(),
            steps,
            scope: ActionScope {
                projects: projects.clone(),
                branches: vec![],
                destructive: false,
                reversible: true,
                affects_remote: false,
                estimated_impact: ScopeImpact::Medium,
            },
            estimated_duration_secs: 180 * projects.len() as u64,
            requires_approval: true,
        }))
    }

    fn parse_generic(&self, task: &str) -> Result<DispatchPlan, ParseError> {
        let mut names: Vec<&String> = self.config.projects.keys().collect();
        names.sort();
        let Some(project) = names.into_iter().next() else { return Err(ParseError::NoProjects) };

        Ok(DispatchPlan {
            task: task.to_string(),
            steps: vec![DispatchStep {
                id: "step-1".to_string(),
                action: task.to_string(),
                project: project.clone(),
                dependencies: vec![],
                model_tier: Some(overlord_types::Tier::CloudFast),
                timeout_secs: 300,
            }],
            scope: ActionScope {
                projects: vec![project.clone()],
                branches: vec![],
                destructive: false,
                reversible: true,
                affects_remote: false,
                estimated_impact: ScopeImpact::Medium,
            },
            estimated_duration_secs: 300,
            requires_approval: true,
        })
    }
}

fn read_only_scope_medium(projects: Vec<String>) -> ActionScope {
    ActionScope { projects, branches: vec![], destructive: false, reversible: true, affects_remote: false, estimated_impact: ScopeImpact::Medium }
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
                role: ProjectRole::Service,
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
    fn parses_merge_with_project_first() {
        let parser = TaskParser::new(&config());
        let plan = parser.parse("merge core feat/x into develop").unwrap();
        assert_eq!(plan.steps[0].project, "core");
        assert!(plan.requires_approval);
    }

    #[test]
    fn parses_merge_with_trailing_project() {
        let parser = TaskParser::new(&config());
        let plan = parser.parse("merge feat/x into develop in api").unwrap();
        assert_eq!(plan.steps[0].project, "api");
    }

    #[test]
    fn parses_single_project_tests() {
        let parser = TaskParser::new(&config());
        let plan = parser.parse("run tests in core").unwrap();
        assert!(!plan.requires_approval);
        assert_eq!(plan.steps.len(), 1);
    }

    #[test]
    fn parses_tests_across_all_projects() {
        let parser = TaskParser::new(&config());
        let plan = parser.parse("run tests across all projects").unwrap();
        assert_eq!(plan.steps.len(), 2);
    }

    #[test]
    fn parses_clean_branches_with_project_list() {
        let parser = TaskParser::new(&config());
        let plan = parser.parse("clean stale branches in core, api").unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(plan.scope.destructive);
        assert!(!plan.scope.reversible);
    }

    #[test]
    fn parses_multi_project_update() {
        let parser = TaskParser::new(&config());
        let plan = parser.parse("update protobuf in core and api").unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(plan.steps.iter().all(|s| s.action == "update protobuf"));
    }

    #[test]
    fn unknown_project_in_merge_is_an_error() {
        let parser = TaskParser::new(&config());
        let err = parser.parse("merge ghost feat/x into develop").unwrap_err();
        assert!(matches!(err, ParseError::UnknownProject(_)));
    }

    #[test]
    fn generic_fallback_picks_first_project_alphabetically() {
        let parser = TaskParser::new(&config());
        let plan = parser.parse("investigate the weird flakiness").unwrap();
        assert_eq!(plan.steps[0].project, "api");
        assert!(plan.requires_approval);
    }
}
