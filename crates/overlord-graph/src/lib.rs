//! Dependency graph queries over the project registry: upstream/downstream
//! traversal, the affected-by set, release ordering, and subgraph
//! projection. All O(V+E).

use std::collections::{HashMap, HashSet, VecDeque};

use overlord_config::{get_dependency_order, OverlordConfig};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("unknown project '{0}'; available: {1:?}")]
    UnknownProject(String, Vec<String>),
    #[error("circular dependency among projects")]
    Cycle,
}

pub struct DependencyGraph<'a> {
    config: &'a OverlordConfig,
    adjacency: HashMap<&'a str, Vec<&'a str>>,
    reverse: HashMap<&'a str, Vec<&'a str>>,
}

impl<'a> DependencyGraph<'a> {
    pub fn new(config: &'a OverlordConfig) -> Self {
        let mut adjacency: HashMap<&str, Vec<&str>> =
            config.projects.keys().map(|k| (k.as_str(), Vec::new())).collect();
        let mut reverse: HashMap<&str, Vec<&str>> =
            config.projects.keys().map(|k| (k.as_str(), Vec::new())).collect();

        for (name, project) in &config.projects {
            for dep in &project.depends_on {
                adjacency.entry(name.as_str()).or_default().push(dep.as_str());
                reverse.entry(dep.as_str()).or_default().push(name.as_str());
            }
        }

        Self { config, adjacency, reverse }
    }

    fn validate_project(&self, project: &str) -> Result<(), GraphError> {
        if self.config.projects.contains_key(project) {
            Ok(())
        } else {
            let mut available: Vec<String> = self.config.projects.keys().cloned().collect();
            available.sort();
            Err(GraphError::UnknownProject(project.to_string(), available))
        }
    }

    fn bfs(&self, start: &str, adj: &HashMap<&str, Vec<&str>>) -> Vec<String> {
        let mut visited: HashSet<&str> = HashSet::new();
        visited.insert(start);
        let mut queue: VecDeque<&str> = VecDeque::new();
        if let Some(neighbors) = adj.get(start) {
            for n in neighbors {
                if visited.insert(n) {
                    queue.push_back(n);
                }
            }
        }
        let mut result = Vec::new();
        while let Some(node) = queue.pop_front() {
            result.push(node.to_string());
            if let Some(neighbors) = adj.get(node) {
                for n in neighbors {
                    if visited.insert(n) {
                        queue.push_back(n);
                    }
                }
            }
        }
        result
    }

    pub fn upstream(&self, project: &str) -> Result<Vec<String>, GraphError> {
        self.validate_project(project)?;
        Ok(self.bfs(project, &self.adjacency))
    }

    pub fn downstream(&self, project: &str) -> Result<Vec<String>, GraphError> {
        self.validate_project(project)?;
        Ok(self.bfs(project, &self.reverse))
    }

    pub fn affected_by(&self, project: &str) -> Result<Vec<String>, GraphError> {
        let mut affected = vec![project.to_string()];
        affected.extend(self.downstream(project)?);
        Ok(affected)
    }

    pub fn release_order(&self) -> Result<Vec<String>, GraphError> {
        get_dependency_order(self.config).map_err(|_| GraphError::Cycle)
    }

    pub fn subgraph(&self, projects: &[&str]) -> HashMap<String, Vec<String>> {
        let set: HashSet<&str> = projects.iter().copied().collect();
        let mut result = HashMap::new();
        for project in projects {
            let deps: Vec<String> = self
                .adjacency
                .get(project)
                .into_iter()
                .flatten()
                .filter(|d| set.contains(*d))
                .map(|d| d.to_string())
                .collect();
            result.insert(project.to_string(), deps);
        }
        result
    }

    /// `"  name <- [deps]"` / `"  name (root)"` lines in release order, each
    /// followed by `"    -> dependent"` lines.
    pub fn render_ascii(&self) -> Result<String, GraphError> {
        let order = self.release_order()?;
        let mut out = String::new();
        for name in &order {
            let deps = self.adjacency.get(name.as_str()).cloned().unwrap_or_default();
            if deps.is_empty() {
                out.push_str(&format!("  {name} (root)\n"));
            } else {
                out.push_str(&format!("  {name} <- {deps:?}\n"));
            }
            if let Some(dependents) = self.reverse.get(name.as_str()) {
                for dependent in dependents {
                    out.push_str(&format!("    -> {dependent}\n"));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlord_config::{
        AutonomyConfig, CostControlConfig, NotificationConfig, ProjectConfig, ScheduleConfig,
    };
    use overlord_types::{BranchModel, ProjectRole};
    use std::collections::HashMap as Map;
    use std::path::PathBuf;

    fn config() -> OverlordConfig {
        let mut projects = Map::new();
        projects.insert(
            "core".to_string(),
            ProjectConfig {
                path: PathBuf::from("."),
                remote: "git@example.com:org/core.git".into(),
                role: ProjectRole::SharedLibrary,
                branch_model: BranchModel::DevelopMain,
                depends_on: vec![],
            },
        );
        projects.insert(
            "api".to_string(),
            ProjectConfig {
                path: PathBuf::from("."),
                remote: "git@example.com:org/api.git".into(),
                role: ProjectRole::PlatformDeployment,
                branch_model: BranchModel::DevelopMain,
                depends_on: vec!["core".to_string()],
            },
        );
        projects.insert(
            "web".to_string(),
            ProjectConfig {
                path: PathBuf::from("."),
                remote: "git@example.com:org/web.git".into(),
                role: ProjectRole::Frontend,
                branch_model: BranchModel::DevelopMain,
                depends_on: vec!["api".to_string()],
            },
        );
        OverlordConfig {
            workspace_root: None,
            projects,
            autonomy: AutonomyConfig::default(),
            models: Map::new(),
            schedule: ScheduleConfig::default(),
            workers: Map::new(),
            notifications: NotificationConfig::default(),
            cost_controls: CostControlConfig::default(),
            llm_fallback: overlord_config::LlmFallbackConfig::default(),
        }
    }

    #[test]
    fn downstream_of_core_includes_api_and_web() {
        let config = config();
        let graph = DependencyGraph::new(&config);
        let mut downstream = graph.downstream("core").unwrap();
        downstream.sort();
        assert_eq!(downstream, vec!["api".to_string(), "web".to_string()]);
    }

    #[test]
    fn affected_by_includes_self() {
        let config = config();
        let graph = DependencyGraph::new(&config);
        let affected = graph.affected_by("api").unwrap();
        assert!(affected.contains(&"api".to_string()));
        assert!(affected.contains(&"web".to_string()));
        assert!(!affected.contains(&"core".to_string()));
    }

    #[test]
    fn unknown_project_lists_available() {
        let config = config();
        let graph = DependencyGraph::new(&config);
        let err = graph.upstream("ghost").unwrap_err();
        match err {
            GraphError::UnknownProject(name, available) => {
                assert_eq!(name, "ghost");
                assert_eq!(available, vec!["api", "core", "web"]);
            }
            _ => panic!("expected UnknownProject"),
        }
    }

    #[test]
    fn release_order_respects_dependencies() {
        let config = config();
        let graph = DependencyGraph::new(&config);
        let order = graph.release_order().unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("core") < pos("api"));
        assert!(pos("api") < pos("web"));
    }
}
