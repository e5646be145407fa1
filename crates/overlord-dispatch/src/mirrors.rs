//! Worktree provisioning against bare mirror clones. Each task gets an
//! isolated `git worktree` under `<worktree_root>/<project>/<short-task-id>`,
//! carved out of `<mirror_root>/<project>.git`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use overlord_config::OverlordConfig;
use tokio::process::Command;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("unknown project: {0}")]
    UnknownProject(String),
    #[error("mirror not initialized for project '{0}' at {1}")]
    NotInitialized(String, PathBuf),
    #[error("git worktree command failed: {0}")]
    GitFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type MirrorResult<T> = Result<T, MirrorError>;

fn default_mirror_root() -> PathBuf {
    PathBuf::from(".overlord/mirrors")
}

fn default_worktree_root() -> PathBuf {
    PathBuf::from(".overlord/worktrees")
}

/// Provisions and tears down git worktrees for task execution.
pub struct MirrorManager<'a> {
    config: &'a OverlordConfig,
    mirror_root: PathBuf,
    worktree_root: PathBuf,
}

impl<'a> MirrorManager<'a> {
    pub fn new(config: &'a OverlordConfig) -> Self {
        Self { config, mirror_root: default_mirror_root(), worktree_root: default_worktree_root() }
    }

    pub fn with_roots(config: &'a OverlordConfig, mirror_root: PathBuf, worktree_root: PathBuf) -> Self {
        Self { config, mirror_root, worktree_root }
    }

    fn mirror_path(&self, project: &str) -> PathBuf {
        self.mirror_root.join(format!("{project}.git"))
    }

    /// Carves out `<worktree_root>/<project>/<short-task-id>` on an
    /// `atom/<short-task-id>` branch from `branch` (default `develop`).
    pub async fn provision_worktree(
        &self,
        project: &str,
        task_id: Uuid,
        branch: Option<&str>,
    ) -> MirrorResult<PathBuf> {
        if !self.config.projects.contains_key(project) {
            return Err(MirrorError::UnknownProject(project.to_string()));
        }

        let mirror_path = self.mirror_path(project);
        if !mirror_path.exists() {
            return Err(MirrorError::NotInitialized(project.to_string(), mirror_path));
        }

        let short_id = &task_id.simple().to_string()[..8];
        let worktree_path = self.worktree_root.join(project).join(short_id);
        if let Some(parent) = worktree_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let branch_name = format!("atom/{short_id}");
        let source_branch = branch.unwrap_or("develop");

        let output = Command::new("git")
            .args(["worktree", "add", "-b", &branch_name])
            .arg(&worktree_path)
            .arg(source_branch)
            .current_dir(&mirror_path)
            .output()
            .await?;

        if !output.status.success() {
            return Err(MirrorError::GitFailed(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }

        Ok(worktree_path)
    }

    /// Removes the worktree and, if it emptied out, its project parent
    /// directory. Returns `false` if the worktree path never existed.
    pub async fn cleanup_worktree(&self, project: &str, worktree_path: &Path) -> MirrorResult<bool> {
        if !worktree_path.exists() {
            return Ok(false);
        }

        let mirror_path = self.mirror_path(project);
        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(worktree_path)
            .current_dir(&mirror_path)
            .output()
            .await?;

        if !output.status.success() {
            return Err(MirrorError::GitFailed(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }

        if let Some(parent) = worktree_path.parent() {
            if parent.exists() && tokio::fs::read_dir(parent).await?.next_entry().await?.is_none() {
                tokio::fs::remove_dir(parent).await.ok();
            }
        }

        Ok(true)
    }

    /// Worktree directories grouped by project, optionally filtered to one.
    pub async fn list_worktrees(&self, project: Option<&str>) -> MirrorResult<HashMap<String, Vec<PathBuf>>> {
        let mut result = HashMap::new();
        let mut root_entries = match tokio::fs::read_dir(&self.worktree_root).await {
            Ok(entries) => entries,
            Err(_) => return Ok(result),
        };

        while let Some(project_entry) = root_entries.next_entry().await? {
            if !project_entry.file_type().await?.is_dir() {
                continue;
            }
            let name = project_entry.file_name().to_string_lossy().to_string();
            if let Some(filter) = project {
                if name != filter {
                    continue;
                }
            }

            let mut worktrees = Vec::new();
            let mut task_entries = tokio::fs::read_dir(project_entry.path()).await?;
            while let Some(task_entry) = task_entries.next_entry().await? {
                if task_entry.file_type().await?.is_dir() {
                    worktrees.push(task_entry.path());
                }
            }
            if !worktrees.is_empty() {
                result.insert(name, worktrees);
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlord_config::ProjectConfig;
    use overlord_types::{BranchModel, ProjectRole};
    use std::collections::HashMap;

    fn config(root: &Path) -> OverlordConfig {
        let mut projects = HashMap::new();
        projects.insert(
            "core".to_string(),
            ProjectConfig {
                path: root.join("core"),
                remote: "org/core".to_string(),
                role: ProjectRole::SharedLibrary,
                branch_model: BranchModel::DevelopMain,
                depends_on: vec![],
            },
        );
        OverlordConfig {
            workspace_root: None,
            projects,
            autonomy: Default::default(),
            models: HashMap::new(),
            schedule: Default::default(),
            workers: HashMap::new(),
            notifications: Default::default(),
            cost_controls: Default::default(),
            llm_fallback: Default::default(),
        }
    }

    #[tokio::test]
    async fn provision_fails_when_mirror_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let mgr = MirrorManager::with_roots(
            &config,
            tmp.path().join("mirrors"),
            tmp.path().join("worktrees"),
        );
        let err = mgr.provision_worktree("core", Uuid::nil(), None).await.unwrap_err();
        assert!(matches!(err, MirrorError::NotInitialized(..)));
    }

    #[tokio::test]
    async fn provision_rejects_unknown_project() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let mgr = MirrorManager::new(&config);
        let err = mgr.provision_worktree("ghost", Uuid::nil(), None).await.unwrap_err();
        assert!(matches!(err, MirrorError::UnknownProject(_)));
    }

    #[tokio::test]
    async fn list_worktrees_empty_when_root_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let mgr = MirrorManager::with_roots(
            &config,
            tmp.path().join("mirrors"),
            tmp.path().join("nonexistent"),
        );
        let result = mgr.list_worktrees(None).await.unwrap();
        assert!(result.is_empty());
    }
}
