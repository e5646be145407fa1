//! Ecosystem scanner — git state and test-infrastructure inspection. Pure
//! data gathering: never modifies a project, only reports on it. Feeds both
//! the `overlord status`/`scan` CLI surface and the chat `status`/`scan`
//! commands, as well as `overlord-daemon`'s scheduled sweeps.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use overlord_config::{BranchModel, OverlordConfig, ProjectConfig};
use tokio::process::Command;

#[derive(Debug, Clone, Default)]
pub struct GitState {
    pub branch: String,
    pub clean: bool,
    pub ahead: u32,
    pub behind: u32,
    pub last_commit: String,
    pub last_commit_date: String,
    pub stale_branches: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TestHealth {
    pub has_tests: bool,
    pub test_command: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProjectStatus {
    pub name: String,
    pub git: GitState,
    pub tests: TestHealth,
    pub issues: Vec<String>,
}

async fn run_git(args: &[&str], cwd: &Path) -> String {
    let run = Command::new("git").args(args).current_dir(cwd).output();
    match tokio::time::timeout(Duration::from_secs(10), run).await {
        Ok(Ok(output)) if output.status.success() => String::from_utf8_lossy(&output.stdout).trim().to_string(),
        _ => String::new(),
    }
}

async fn get_git_state(project_path: &Path) -> GitState {
    let branch = run_git(&["rev-parse", "--abbrev-ref", "HEAD"], project_path).await;

    let status_output = run_git(&["status", "--porcelain"], project_path).await;
    let clean = status_output.is_empty();

    let (mut ahead, mut behind) = (0u32, 0u32);
    let range = format!("{branch}...origin/{branch}");
    let rev_list = run_git(&["rev-list", "--left-right", "--count", &range], project_path).await;
    if let Some((a, b)) = rev_list.split_once('\t') {
        ahead = a.trim().parse().unwrap_or(0);
        behind = b.trim().parse().unwrap_or(0);
    }

    let last_commit = run_git(&["log", "-1", "--format=%h %s"], project_path).await;
    let last_commit_date = run_git(&["log", "-1", "--format=%ci"], project_path).await;
    let stale_branches = detect_stale_branches(project_path, 30).await;

    let tags_output = run_git(&["tag", "--sort=-creatordate", "--list"], project_path).await;
    let tags = tags_output.lines().take(3).map(str::to_string).collect();

    GitState { branch, clean, ahead, behind, last_commit, last_commit_date, stale_branches, tags }
}

/// Local branches whose last commit predates `cutoff_days` days ago.
async fn detect_stale_branches(project_path: &Path, cutoff_days: i64) -> Vec<String> {
    let output = run_git(
        &["for-each-ref", "--format=%(refname:short) %(committerdate:iso8601)", "refs/heads/"],
        project_path,
    )
    .await;
    if output.is_empty() {
        return Vec::new();
    }

    let cutoff = Utc::now() - chrono::Duration::days(cutoff_days);
    let mut stale = Vec::new();
    for line in output.lines() {
        let Some((name, date_str)) = line.split_once(' ') else { continue };
        let Ok(commit_date) = DateTime::parse_from_str(date_str.trim(), "%Y-%m-%d %H:%M:%S %z") else { continue };
        if commit_date.with_timezone(&Utc) < cutoff {
            stale.push(name.to_string());
        }
    }
    stale
}

/// Detects a project's test command via heuristics: pytest in
/// `pyproject.toml`, a `bin/gantry` wrapper script, a `Makefile` with a
/// `test` target, or a bare `tests/` directory (assumed pytest).
pub async fn detect_test_command(project_path: &Path) -> Option<String> {
    let pyproject = project_path.join("pyproject.toml");
    if let Ok(content) = tokio::fs::read_to_string(&pyproject).await {
        if content.contains("pytest") {
            return Some("python -m pytest tests/".to_string());
        }
    }

    if project_path.join("bin").join("gantry").exists() {
        return Some("bin/gantry test".to_string());
    }

    if let Ok(content) = tokio::fs::read_to_string(project_path.join("Makefile")).await {
        if content.contains("test:") || content.contains("test :") {
            return Some("make test".to_string());
        }
    }

    if project_path.join("tests").is_dir() {
        return Some("python -m pytest tests/".to_string());
    }

    None
}

pub async fn scan_project(name: &str, config: &ProjectConfig) -> ProjectStatus {
    if !config.path.exists() {
        return ProjectStatus {
            name: name.to_string(),
            git: GitState::default(),
            tests: TestHealth::default(),
            issues: vec![format!("project path does not exist: {}", config.path.display())],
        };
    }

    let git = get_git_state(&config.path).await;
    let mut issues = Vec::new();

    if !git.clean {
        issues.push("dirty working tree".to_string());
    }
    if git.behind > 0 {
        issues.push(format!("behind remote by {} commit(s)", git.behind));
    }
    if !git.stale_branches.is_empty() {
        issues.push(format!("{} stale branch(es): {}", git.stale_branches.len(), git.stale_branches[..git.stale_branches.len().min(3)].join(", ")));
    }
    if config.branch_model == BranchModel::DevelopMain && git.branch != "develop" && git.branch != "main" {
        issues.push(format!("on branch '{}' (expected develop or main)", git.branch));
    }

    let test_command = detect_test_command(&config.path).await;
    let tests = TestHealth { has_tests: test_command.is_some(), test_command };

    ProjectStatus { name: name.to_string(), git, tests, issues }
}

/// Scans every registered project in dependency order, falling back to
/// alphabetical order if the graph has a cycle.
pub async fn scan_ecosystem(config: &OverlordConfig) -> Vec<ProjectStatus> {
    let order = overlord_config::get_dependency_order(config).unwrap_or_else(|_| {
        let mut names: Vec<String> = config.projects.keys().cloned().collect();
        names.sort();
        names
    });

    let mut results = Vec::with_capacity(order.len());
    for name in order {
        if let Some(project_config) = config.projects.get(&name) {
            results.push(scan_project(&name, project_config).await);
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scan_project_reports_missing_path() {
        let config = ProjectConfig {
            path: std::path::PathBuf::from("/nonexistent/overlord-scanner-test"),
            remote: "org/ghost".to_string(),
            role: overlord_types::ProjectRole::Tooling,
            branch_model: BranchModel::DevelopMain,
            depends_on: vec![],
        };
        let status = scan_project("ghost", &config).await;
        assert!(status.issues[0].contains("does not exist"));
    }

    #[tokio::test]
    async fn detect_test_command_finds_tests_directory() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("tests")).unwrap();
        let command = detect_test_command(tmp.path()).await;
        assert_eq!(command, Some("python -m pytest tests/".to_string()));
    }

    #[tokio::test]
    async fn detect_test_command_none_without_markers() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(detect_test_command(tmp.path()).await, None);
    }
}
