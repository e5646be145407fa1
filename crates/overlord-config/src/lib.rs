//! Single-YAML-file configuration: typed config structs, a loader, and a
//! validator that collects every problem instead of failing on the first.
//!
//! Deliberately simpler than a layered config store: Overlord reads one
//! YAML document at startup and never merges it against other layers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use overlord_types::{AutonomyLevel, BranchModel, ProjectRole, Tier, WorkerKind};

pub const DEFAULT_CONFIG_FILENAME: &str = "overlord.yml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub path: PathBuf,
    pub remote: String,
    pub role: ProjectRole,
    #[serde(default = "default_branch_model")]
    pub branch_model: BranchModel,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_branch_model() -> BranchModel {
    BranchModel::DevelopMain
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTaskConfig {
    pub cron: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Accepts both the long form `{cron, enabled}` and the short form
/// `task_name: "cron_expr"` seen in hand-written config files.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum ScheduledTaskEntry {
    Short(String),
    Long(ScheduledTaskConfig),
}

impl From<ScheduledTaskEntry> for ScheduledTaskConfig {
    fn from(entry: ScheduledTaskEntry) -> Self {
        match entry {
            ScheduledTaskEntry::Short(cron) => ScheduledTaskConfig { cron, enabled: true },
            ScheduledTaskEntry::Long(cfg) => cfg,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub tasks: HashMap<String, ScheduledTaskConfig>,
}

impl ScheduleConfig {
    pub fn default_tasks() -> HashMap<String, ScheduledTaskConfig> {
        let mut tasks = HashMap::new();
        tasks.insert(
            "scan".to_string(),
            ScheduledTaskConfig { cron: "0 * * * *".into(), enabled: true },
        );
        tasks.insert(
            "test-all".to_string(),
            ScheduledTaskConfig { cron: "0 2 * * *".into(), enabled: true },
        );
        tasks.insert(
            "clean-stale-branches".to_string(),
            ScheduledTaskConfig { cron: "0 3 * * 0".into(), enabled: true },
        );
        tasks
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self { tasks: Self::default_tasks() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_true")]
    pub urgent_enabled: bool,
    #[serde(default = "default_true")]
    pub digest_enabled: bool,
    #[serde(default = "default_digest_cron")]
    pub digest_cron: String,
}

fn default_digest_cron() -> String {
    "0 8 * * *".to_string()
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            urgent_enabled: true,
            digest_enabled: true,
            digest_cron: default_digest_cron(),
        }
    }
}

/// Routing knobs for the chat command router's free-text LLM fallback
/// (§4.12) and the optional richer structured command parser (§4.13).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmFallbackConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_confidence")]
    pub confidence_threshold: f64,
    #[serde(default = "default_llm_context_entries")]
    pub context_max_entries: usize,
    #[serde(default = "default_llm_context_ttl")]
    pub context_ttl_minutes: i64,
    #[serde(default = "default_llm_scan_cache_ttl")]
    pub scan_cache_ttl_secs: u64,
}

fn default_llm_base_url() -> String {
    "http://localhost:11434/v1".to_string()
}
fn default_llm_model() -> String {
    "default".to_string()
}
fn default_llm_timeout() -> u64 {
    20
}
fn default_llm_confidence() -> f64 {
    0.7
}
fn default_llm_context_entries() -> usize {
    10
}
fn default_llm_context_ttl() -> i64 {
    30
}
fn default_llm_scan_cache_ttl() -> u64 {
    60
}

impl Default for LlmFallbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key_env: None,
            timeout_secs: default_llm_timeout(),
            confidence_threshold: default_llm_confidence(),
            context_max_entries: default_llm_context_entries(),
            context_ttl_minutes: default_llm_context_ttl(),
            scan_cache_ttl_secs: default_llm_scan_cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostControlConfig {
    #[serde(default = "default_daily_ceiling")]
    pub daily_ceiling_usd: f64,
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold_pct: f64,
    #[serde(default = "default_task_budget")]
    pub default_task_budget_tokens: i64,
}

fn default_daily_ceiling() -> f64 {
    10.0
}
fn default_warning_threshold() -> f64 {
    80.0
}
fn default_task_budget() -> i64 {
    100_000
}

impl Default for CostControlConfig {
    fn default() -> Self {
        Self {
            daily_ceiling_usd: default_daily_ceiling(),
            warning_threshold_pct: default_warning_threshold(),
            default_task_budget_tokens: default_task_budget(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_path: Option<PathBuf>,
    pub default_model: String,
    #[serde(default)]
    pub model_overrides: HashMap<String, String>,
    #[serde(default = "default_worker_timeout")]
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

fn default_worker_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEndpointConfig {
    pub endpoint: String,
    pub model: String,
    pub tier: Tier,
    #[serde(default = "default_concurrent")]
    pub concurrent: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_url: Option<String>,
}

fn default_concurrent() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutonomyConfig {
    pub global: AutonomyLevel,
    #[serde(default)]
    pub overrides: HashMap<String, AutonomyLevel>,
    #[serde(default)]
    pub pre_approved: HashMap<String, Vec<String>>,
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            global: AutonomyLevel::Cautious,
            overrides: HashMap::new(),
            pre_approved: HashMap::new(),
        }
    }
}

impl AutonomyConfig {
    pub fn effective_level(&self, project: &str) -> AutonomyLevel {
        self.overrides.get(project).copied().unwrap_or(self.global)
    }

    pub fn is_pre_approved(&self, project: &str, action: &str) -> bool {
        self.pre_approved
            .get(project)
            .map(|actions| actions.iter().any(|a| a == action))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlordConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,
    pub projects: HashMap<String, ProjectConfig>,
    #[serde(default)]
    pub autonomy: AutonomyConfig,
    #[serde(default)]
    pub models: HashMap<String, ModelEndpointConfig>,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub workers: HashMap<WorkerKind, WorkerConfig>,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub cost_controls: CostControlConfig,
    #[serde(default)]
    pub llm_fallback: LlmFallbackConfig,
}

/// Loose shape of the YAML file on disk, used only to accept the schedule's
/// short/long form ambiguity before converting into [`OverlordConfig`].
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    workspace_root: Option<PathBuf>,
    #[serde(default)]
    projects: HashMap<String, ProjectConfig>,
    #[serde(default)]
    autonomy: AutonomyConfig,
    #[serde(default)]
    models: HashMap<String, ModelEndpointConfig>,
    #[serde(default)]
    schedule: HashMap<String, ScheduledTaskEntry>,
    #[serde(default)]
    workers: HashMap<WorkerKind, WorkerConfig>,
    #[serde(default)]
    notifications: NotificationConfig,
    #[serde(default)]
    cost_controls: CostControlConfig,
    #[serde(default)]
    llm_fallback: LlmFallbackConfig,
}

pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".atom")
        .join(DEFAULT_CONFIG_FILENAME)
}

pub fn load_config(path: Option<&Path>) -> Result<OverlordConfig, ConfigError> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    let raw_text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let raw: RawConfig = serde_yaml::from_str(&raw_text)
        .map_err(|source| ConfigError::Parse { path: path.clone(), source })?;

    let mut projects = HashMap::with_capacity(raw.projects.len());
    for (name, mut project) in raw.projects {
        project.path = expand_user(&project.path);
        projects.insert(name, project);
    }

    let schedule_tasks: HashMap<String, ScheduledTaskConfig> = if raw.schedule.is_empty() {
        ScheduleConfig::default_tasks()
    } else {
        raw.schedule.into_iter().map(|(k, v)| (k, v.into())).collect()
    };

    let workspace_root = raw
        .workspace_root
        .map(|p| expand_user(&p))
        .or_else(|| detect_workspace_root(&projects));

    Ok(OverlordConfig {
        workspace_root,
        projects,
        autonomy: raw.autonomy,
        models: raw.models,
        schedule: ScheduleConfig { tasks: schedule_tasks },
        workers: raw.workers,
        notifications: raw.notifications,
        cost_controls: raw.cost_controls,
        llm_fallback: raw.llm_fallback,
    })
}

fn expand_user(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

/// When `workspace_root` is omitted, it is the common parent of every
/// registered project path -- but only when they in fact share one.
fn detect_workspace_root(projects: &HashMap<String, ProjectConfig>) -> Option<PathBuf> {
    let mut paths = projects.values().map(|p| p.path.as_path());
    let first = paths.next()?;
    let mut common: Vec<std::ffi::OsString> =
        first.components().map(|c| c.as_os_str().to_owned()).collect();

    for path in paths {
        let components: Vec<_> = path.components().map(|c| c.as_os_str().to_owned()).collect();
        let shared = common.iter().zip(components.iter()).take_while(|(a, b)| a == b).count();
        common.truncate(shared);
        if common.is_empty() {
            return None;
        }
    }

    if common.is_empty() {
        None
    } else {
        Some(common.into_iter().collect())
    }
}

/// Validates semantic constraints that require the whole config in hand:
/// project path existence, dependency references, worker prerequisites, and
/// the dependency graph's acyclicity. Returns every problem found rather
/// than stopping at the first.
pub fn validate_config(config: &OverlordConfig) -> Vec<String> {
    let mut errors = Vec::new();
    let known_projects: std::collections::HashSet<&str> =
        config.projects.keys().map(String::as_str).collect();

    for (name, override_level) in &config.autonomy.overrides {
        if !known_projects.contains(name.as_str()) {
            errors.push(format!(
                "autonomy override references unknown project '{name}' (level {override_level})"
            ));
        }
    }
    for name in config.autonomy.pre_approved.keys() {
        if !known_projects.contains(name.as_str()) {
            errors.push(format!("pre_approved entry references unknown project '{name}'"));
        }
    }

    for (name, project) in &config.projects {
        if !project.path.exists() {
            errors.push(format!(
                "project '{name}' path does not exist: {}",
                project.path.display()
            ));
        }
        if project.remote.trim().is_empty() {
            errors.push(format!("project '{name}' is missing a remote"));
        }
        for dep in &project.depends_on {
            if dep == name {
                errors.push(format!("project '{name}' cannot depend on itself"));
            } else if !known_projects.contains(dep.as_str()) {
                errors.push(format!(
                    "project '{name}' depends_on unknown project '{dep}'"
                ));
            }
        }
    }

    if let Some(claude) = config.workers.get(&WorkerKind::Claude) {
        if claude.enabled && claude.binary_path.is_none() {
            errors.push("worker 'claude' is enabled but has no binary_path".to_string());
        }
    }

    if let Err(cycle) = find_cycle(config) {
        errors.push(format!("circular dependency detected: {}", cycle.join(" -> ")));
    }

    errors
}

/// Kahn's algorithm. `Ok` gives a release-ordered list of project names;
/// `Err` means the graph has a cycle.
pub fn get_dependency_order(config: &OverlordConfig) -> Result<Vec<String>, String> {
    let mut in_degree: HashMap<&str, usize> =
        config.projects.keys().map(|k| (k.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> =
        config.projects.keys().map(|k| (k.as_str(), Vec::new())).collect();

    for (name, project) in &config.projects {
        for dep in &project.depends_on {
            if let Some(count) = in_degree.get_mut(name.as_str()) {
                *count += 1;
            }
            dependents.entry(dep.as_str()).or_default().push(name.as_str());
        }
    }

    let mut queue: std::collections::VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut queue_vec: Vec<&str> = queue.drain(..).collect();
    queue_vec.sort_unstable();
    let mut queue: std::collections::VecDeque<&str> = queue_vec.into();

    let mut order = Vec::with_capacity(config.projects.len());
    while let Some(name) = queue.pop_front() {
        order.push(name.to_string());
        if let Some(deps) = dependents.get(name) {
            let mut next_ready = Vec::new();
            for dependent in deps {
                if let Some(count) = in_degree.get_mut(*dependent) {
                    *count -= 1;
                    if *count == 0 {
                        next_ready.push(*dependent);
                    }
                }
            }
            next_ready.sort_unstable();
            queue.extend(next_ready);
        }
    }

    if order.len() != config.projects.len() {
        return Err("circular dependency among projects".to_string());
    }
    Ok(order)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// DFS cycle finder used only to build a human-readable cycle path for
/// [`validate_config`]'s error message; [`get_dependency_order`] is the
/// source of truth for whether a cycle exists at all.
fn find_cycle(config: &OverlordConfig) -> Result<(), Vec<String>> {
    let mut color: HashMap<&str, Color> =
        config.projects.keys().map(|k| (k.as_str(), Color::White)).collect();
    let mut parent: HashMap<&str, &str> = HashMap::new();

    for start in config.projects.keys() {
        if color[start.as_str()] != Color::White {
            continue;
        }
        let mut stack = vec![start.as_str()];
        while let Some(node) = stack.pop() {
            match color[node] {
                Color::White => {
                    color.insert(node, Color::Gray);
                    stack.push(node);
                    if let Some(project) = config.projects.get(node) {
                        for dep in &project.depends_on {
                            match color.get(dep.as_str()) {
                                Some(Color::White) => {
                                    parent.insert(dep.as_str(), node);
                                    stack.push(dep.as_str());
                                }
                                Some(Color::Gray) => {
                                    return Err(reconstruct_cycle(&parent, node, dep));
                                }
                                _ => {}
                            }
                        }
                    }
                }
                Color::Gray => {
                    color.insert(node, Color::Black);
                }
                Color::Black => {}
            }
        }
    }
    Ok(())
}

fn reconstruct_cycle<'a>(
    parent: &HashMap<&'a str, &'a str>,
    from: &'a str,
    to: &'a str,
) -> Vec<String> {
    let mut path = vec![from.to_string()];
    let mut current = from;
    while let Some(p) = parent.get(current) {
        path.push(p.to_string());
        if *p == to {
            break;
        }
        current = p;
    }
    path.push(to.to_string());
    path.reverse();
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn project(depends_on: Vec<&str>) -> ProjectConfig {
        ProjectConfig {
            path: PathBuf::from("."),
            remote: "git@example.com:org/repo.git".into(),
            role: ProjectRole::Tooling,
            branch_model: BranchModel::DevelopMain,
            depends_on: depends_on.into_iter().map(String::from).collect(),
        }
    }

    fn config_with(projects: Vec<(&str, ProjectConfig)>) -> OverlordConfig {
        OverlordConfig {
            workspace_root: None,
            projects: projects.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            autonomy: AutonomyConfig::default(),
            models: HashMap::new(),
            schedule: ScheduleConfig::default(),
            workers: HashMap::new(),
            notifications: NotificationConfig::default(),
            cost_controls: CostControlConfig::default(),
            llm_fallback: LlmFallbackConfig::default(),
        }
    }

    #[test]
    fn dependency_order_respects_edges() {
        let config = config_with(vec![
            ("a", project(vec!["b"])),
            ("b", project(vec!["c"])),
            ("c", project(vec![])),
        ]);
        let order = get_dependency_order(&config).unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("c") < pos("b"));
        assert!(pos("b") < pos("a"));
    }

    #[test]
    fn dependency_order_detects_cycle() {
        let config = config_with(vec![("a", project(vec!["b"])), ("b", project(vec!["a"]))]);
        assert!(get_dependency_order(&config).is_err());
    }

    #[test]
    fn validate_reports_circular_dependency() {
        let config = config_with(vec![("a", project(vec!["b"])), ("b", project(vec!["a"]))]);
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.contains("circular dependency")));
    }

    #[test]
    fn validate_reports_unknown_dependency() {
        let config = config_with(vec![("a", project(vec!["ghost"]))]);
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.contains("unknown project 'ghost'")));
    }

    #[test]
    fn load_config_applies_default_schedule_when_absent() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "projects: {{}}\nautonomy:\n  global: cautious\n").unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.schedule.tasks.len(), 3);
        assert!(config.schedule.tasks.contains_key("scan"));
    }

    #[test]
    fn short_form_schedule_entries_default_to_enabled() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "projects: {{}}\nautonomy:\n  global: cautious\nschedule:\n  scan: \"0 * * * *\"\n"
        )
        .unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert!(config.schedule.tasks["scan"].enabled);
        assert_eq!(config.schedule.tasks["scan"].cron, "0 * * * *");
    }
}
