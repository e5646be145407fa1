//! `MISSION_BRIEF.md` generation and the worker/reviewer prompt wrappers
//! built on top of it.

use std::path::{Path, PathBuf};

use overlord_config::ProjectConfig;
use overlord_types::Task;

pub const BRIEF_FILENAME: &str = "MISSION_BRIEF.md";

/// Prepended ahead of the Objective section when dispatched with `--role pm`:
/// the worker coordinates rather than implements directly.
const PM_DIRECTIVE: &str = "## Project Manager\n\
     You are acting as project manager for this task, not the implementer. \
     Break the objective into concrete sub-steps, delegate or sequence the \
     work, and verify the result against the constraints below rather than \
     writing all the code yourself.\n\n";

fn render(
    task: &Task,
    project_config: &ProjectConfig,
    worktree_path: &Path,
    role: &str,
    ecosystem_context: Option<&str>,
) -> String {
    let dependencies = if project_config.depends_on.is_empty() {
        "none".to_string()
    } else {
        project_config.depends_on.join(", ")
    };

    let pm_section = if role == "pm" { PM_DIRECTIVE } else { "" };
    let ecosystem_section = match ecosystem_context {
        Some(context) => format!("## Ecosystem Context\n{context}\n\n"),
        None => String::new(),
    };

    format!(
        "# MISSION BRIEF — {title}\n\n\
         {pm_section}\
         ## Objective\n{objective}\n\n\
         ## Task Metadata\n\
         - **Task ID**: {task_id}\n\
         - **Project**: {project}\n\
         - **Priority**: {priority}\n\
         - **Complexity**: {complexity}\n\n\
         ## Project Context\n\
         - **Repository**: {remote}\n\
         - **Role**: {project_role}\n\
         - **Dependencies**: {dependencies}\n\n\
         {ecosystem_section}\
         ## Constraints\n\
         - Do NOT merge any branch into `develop` or `main`\n\
         - Do NOT run `git push` to any remote\n\
         - Work ONLY within this worktree: {worktree_path}\n\
         - Run all tests before marking complete\n\
         - Do NOT modify files outside the project scope\n\n\
         ## Verification\n\
         - [ ] All existing tests pass\n\
         - [ ] New code has test coverage\n\
         - [ ] No lint errors\n\
         - [ ] Changes are committed to a feature branch\n",
        title = task.title,
        objective = if task.description.is_empty() { &task.title } else { &task.description },
        task_id = task.short_id(),
        project = task.project,
        priority = task.priority,
        complexity = task.complexity,
        remote = project_config.remote,
        project_role = project_config.role,
        worktree_path = worktree_path.display(),
    )
}

/// Writes `MISSION_BRIEF.md` to the worktree root and returns its path.
/// `role` is `"pm"` or `"default"`; `ecosystem_context`, when present, is
/// interpolated verbatim under its own section.
pub async fn generate_mission_brief(
    task: &Task,
    project_config: &ProjectConfig,
    worktree_path: &Path,
    role: &str,
    ecosystem_context: Option<&str>,
) -> std::io::Result<PathBuf> {
    let content = render(task, project_config, worktree_path, role, ecosystem_context);
    let brief_path = worktree_path.join(BRIEF_FILENAME);
    tokio::fs::write(&brief_path, content).await?;
    tracing::info!(path = %brief_path.display(), "wrote mission brief");
    Ok(brief_path)
}

/// Wraps the brief as a worker prompt: point the worker at the file and
/// inline its content so workers without filesystem tool access still see it.
pub async fn build_worker_prompt(brief_path: &Path) -> std::io::Result<String> {
    let content = tokio::fs::read_to_string(brief_path).await?;
    Ok(format!(
        "Read MISSION_BRIEF.md in this directory and execute the task described within. \
         The brief is located at: {}\n\n{content}",
        brief_path.display()
    ))
}

/// Wraps the brief and the execution output as a review prompt.
pub async fn build_review_prompt(brief_path: &Path, exec_output: &str) -> std::io::Result<String> {
    let content = tokio::fs::read_to_string(brief_path).await?;
    Ok(format!(
        "Review the following work against the mission brief.\n\n\
         ## Mission Brief\n{content}\n\n\
         ## Execution Output\n{exec_output}\n\n\
         ## Review Instructions\n\
         1. Verify the objective was met\n\
         2. Check that all constraints were respected\n\
         3. Confirm verification criteria are satisfied\n\
         4. Report any issues found\n"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlord_types::{Priority, TaskStatus};
    use uuid::Uuid;

    fn task() -> Task {
        Task {
            id: Uuid::nil(),
            title: "Add retry logic".to_string(),
            project: "core".to_string(),
            description: "Add exponential backoff to the HTTP client".to_string(),
            status: TaskStatus::Active,
            priority: Priority::High,
            complexity: "medium".to_string(),
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

    fn project() -> ProjectConfig {
        ProjectConfig {
            path: PathBuf::from("/tmp/core"),
            remote: "org/core".to_string(),
            role: overlord_types::ProjectRole::SharedLibrary,
            branch_model: overlord_types::BranchModel::DevelopMain,
            depends_on: vec!["shared-proto".to_string()],
        }
    }

    #[test]
    fn brief_includes_objective_and_constraints() {
        let content = render(&task(), &project(), Path::new("/tmp/wt/core/00000000"), "default", None);
        assert!(content.contains("Add exponential backoff"));
        assert!(content.contains("Do NOT run `git push`"));
        assert!(content.contains("shared-proto"));
        assert!(!content.contains("Project Manager"));
    }

    #[test]
    fn brief_falls_back_to_title_when_description_empty() {
        let mut t = task();
        t.description = String::new();
        let content = render(&t, &project(), Path::new("/tmp/wt"), "default", None);
        assert!(content.contains("## Objective\nAdd retry logic"));
    }

    #[test]
    fn pm_role_prepends_directive_section() {
        let content = render(&task(), &project(), Path::new("/tmp/wt"), "pm", None);
        assert!(content.contains("## Project Manager"));
        assert!(content.find("Project Manager").unwrap() < content.find("## Objective").unwrap());
    }

    #[test]
    fn ecosystem_context_is_interpolated_verbatim() {
        let content = render(&task(), &project(), Path::new("/tmp/wt"), "default", Some("api is 2 commits behind develop"));
        assert!(content.contains("## Ecosystem Context\napi is 2 commits behind develop"));
    }

    #[tokio::test]
    async fn generate_writes_file_and_round_trips_prompt() {
        let tmp = tempfile::tempdir().unwrap();
        let brief_path = generate_mission_brief(&task(), &project(), tmp.path(), "default", None)
            .await
            .unwrap();
        assert!(brief_path.exists());
        let prompt = build_worker_prompt(&brief_path).await.unwrap();
        assert!(prompt.contains("MISSION BRIEF"));
    }
}
