//! SQLite-backed work queue with state-machine enforcement: task lifecycle,
//! dependency tracking, locking, audit logging, dispatch results, and a
//! per-day cost ledger. One writer connection behind an async mutex, the
//! same shape as the reference workspace's memory store.

use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use overlord_types::{
    is_transition_allowed, transition_increments_retry, CostLedgerRow, DispatchResultRecord,
    Priority, ReviewStatus, Task, TaskLogEntry, TaskStatus,
};

#[derive(Debug, Error)]
pub enum WorkQueueError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
    #[error("a task cannot depend on itself")]
    SelfDependency,
    #[error("task {0} already locked by {1}")]
    LockContention(Uuid, String),
}

pub type WorkQueueResult<T> = Result<T, WorkQueueError>;

/// Tasks eligible for dispatch, as returned by [`WorkQueue::eligible_for_dispatch`].
pub struct WorkQueue {
    conn: Mutex<Connection>,
}

impl WorkQueue {
    pub async fn open(path: &Path) -> WorkQueueResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let queue = Self { conn: Mutex::new(conn) };
        queue.init_schema().await?;
        Ok(queue)
    }

    pub async fn open_in_memory() -> WorkQueueResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let queue = Self { conn: Mutex::new(conn) };
        queue.init_schema().await?;
        Ok(queue)
    }

    async fn init_schema(&self) -> WorkQueueResult<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                external_id TEXT,
                external_source TEXT,
                project TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL DEFAULT 'backlog'
                    CHECK(status IN (
                        'backlog', 'active', 'dispatched',
                        'in_review', 'completed', 'failed'
                    )),
                priority TEXT NOT NULL DEFAULT 'medium'
                    CHECK(priority IN ('low', 'medium', 'high', 'critical')),
                complexity TEXT NOT NULL DEFAULT 'medium',
                locked_by TEXT,
                locked_at TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                mirror_path TEXT,
                token_budget INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(external_id, external_source)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS task_dependencies (
                task_id TEXT NOT NULL,
                depends_on_task_id TEXT NOT NULL,
                PRIMARY KEY (task_id, depends_on_task_id),
                CHECK(task_id != depends_on_task_id),
                FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE,
                FOREIGN KEY (depends_on_task_id) REFERENCES tasks(id) ON DELETE CASCADE
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS task_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                old_status TEXT NOT NULL,
                new_status TEXT NOT NULL,
                changed_by TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                reason TEXT,
                FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS dispatch_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                worker_id TEXT NOT NULL,
                model_id TEXT NOT NULL DEFAULT '',
                branch_name TEXT NOT NULL DEFAULT '',
                mission_brief_path TEXT NOT NULL DEFAULT '',
                review_status TEXT NOT NULL DEFAULT '',
                usage_stats TEXT DEFAULT '{}',
                output_log TEXT DEFAULT '',
                tokens_used INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS cost_ledger (
                date TEXT PRIMARY KEY,
                tokens_input INTEGER NOT NULL DEFAULT 0,
                tokens_output INTEGER NOT NULL DEFAULT 0,
                estimated_cost_usd REAL NOT NULL DEFAULT 0.0,
                ceiling_usd REAL NOT NULL DEFAULT 10.0,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_external ON tasks(external_id, external_source)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_task_log_task_id ON task_log(task_id)",
            [],
        )?;

        Ok(())
    }

    pub async fn add_task(&self, input: NewTask) -> WorkQueueResult<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tasks (
                id, title, project, description, status, priority, complexity,
                external_id, external_source, mirror_path, token_budget,
                retry_count, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, 'backlog', ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?11)",
            params![
                id.to_string(),
                input.title,
                input.project,
                input.description,
                input.priority.to_string(),
                input.complexity,
                input.external_id,
                input.external_source,
                input.mirror_path,
                input.token_budget,
                now.to_rfc3339(),
            ],
        )?;
        tracing::info!(task_id = %id, title = %input.title, project = %input.project, "task created");
        Ok(id)
    }

    pub async fn get_task(&self, id: Uuid) -> WorkQueueResult<Option<Task>> {
        let conn = self.conn.lock().await;
        let task = conn
            .query_row("SELECT * FROM tasks WHERE id = ?1", params![id.to_string()], row_to_task)
            .optional()?;
        Ok(task)
    }

    pub async fn update_task(&self, id: Uuid, token_budget: Option<i64>) -> WorkQueueResult<()> {
        if token_budget.is_none() {
            return Ok(());
        }
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE tasks SET token_budget = ?1, updated_at = ?2 WHERE id = ?3",
            params![token_budget, Utc::now().to_rfc3339(), id.to_string()],
        )?;
        if rows == 0 {
            return Err(WorkQueueError::TaskNotFound(id));
        }
        Ok(())
    }

    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        project: Option<&str>,
        limit: i64,
    ) -> WorkQueueResult<Vec<Task>> {
        let mut sql = String::from("SELECT * FROM tasks WHERE 1=1");
        let mut bind: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(status) = status {
            sql.push_str(" AND status = ?");
            bind.push(Box::new(status.to_string()));
        }
        if let Some(project) = project {
            sql.push_str(" AND project = ?");
            bind.push(Box::new(project.to_string()));
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?");
        bind.push(Box::new(limit));

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params.as_slice(), row_to_task)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub async fn transition(
        &self,
        id: Uuid,
        new_status: TaskStatus,
        changed_by: &str,
        reason: Option<&str>,
    ) -> WorkQueueResult<Task> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let old_status: String =
            tx.query_row("SELECT status FROM tasks WHERE id = ?1", params![id.to_string()], |r| {
                r.get(0)
            })
            .optional()?
            .ok_or(WorkQueueError::TaskNotFound(id))?;
        let old_status = parse_status(&old_status)?;

        if !is_transition_allowed(old_status, new_status) {
            return Err(WorkQueueError::InvalidTransition { from: old_status, to: new_status });
        }

        let now = Utc::now().to_rfc3339();
        let retry_bump = transition_increments_retry(old_status, new_status);
        if retry_bump {
            tx.execute(
                "UPDATE tasks SET status = ?1, retry_count = retry_count + 1, updated_at = ?2 WHERE id = ?3",
                params![new_status.to_string(), now, id.to_string()],
            )?;
        } else {
            tx.execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![new_status.to_string(), now, id.to_string()],
            )?;
        }

        tx.execute(
            "INSERT INTO task_log (task_id, old_status, new_status, changed_by, timestamp, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.to_string(),
                old_status.to_string(),
                new_status.to_string(),
                changed_by,
                now,
                reason,
            ],
        )?;

        let updated = tx.query_row("SELECT * FROM tasks WHERE id = ?1", params![id.to_string()], row_to_task)?;
        tx.commit()?;
        tracing::info!(task_id = %id, from = %old_status, to = %new_status, "task transitioned");
        Ok(updated)
    }

    pub async fn lock_task(&self, id: Uuid, worker_id: &str) -> WorkQueueResult<Task> {
        let conn = self.conn.lock().await;
        let locked_by: Option<String> = conn
            .query_row("SELECT locked_by FROM tasks WHERE id = ?1", params![id.to_string()], |r| {
                r.get(0)
            })
            .optional()?
            .ok_or(WorkQueueError::TaskNotFound(id))?;
        if let Some(locked_by) = locked_by {
            return Err(WorkQueueError::LockContention(id, locked_by));
        }

        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE tasks SET locked_by = ?1, locked_at = ?2, updated_at = ?2 WHERE id = ?3",
            params![worker_id, now, id.to_string()],
        )?;
        let task = conn.query_row("SELECT * FROM tasks WHERE id = ?1", params![id.to_string()], row_to_task)?;
        Ok(task)
    }

    pub async fn unlock_task(&self, id: Uuid) -> WorkQueueResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET locked_by = NULL, locked_at = NULL, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id.to_string()],
        )?;
        Ok(())
    }

    pub async fn reclaim_stale_locks(&self, timeout_minutes: i64) -> WorkQueueResult<Vec<Uuid>> {
        let cutoff = (Utc::now() - chrono::Duration::minutes(timeout_minutes)).to_rfc3339();
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare(
            "SELECT id FROM tasks WHERE locked_by IS NOT NULL AND locked_at < ?1",
        )?;
        let ids: Vec<String> =
            stmt.query_map(params![cutoff], |r| r.get(0))?.collect::<Result<_, _>>()?;
        drop(stmt);

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "UPDATE tasks SET locked_by = NULL, locked_at = NULL, updated_at = ? WHERE id IN ({placeholders})"
        );
        let now = Utc::now().to_rfc3339();
        let mut bind: Vec<&dyn rusqlite::ToSql> = vec![&now];
        bind.extend(ids.iter().map(|id| id as &dyn rusqlite::ToSql));
        conn.execute(&sql, bind.as_slice())?;

        ids.iter().map(|id| Uuid::parse_str(id).map_err(|_| WorkQueueError::TaskNotFound(Uuid::nil()))).collect()
    }

    pub async fn eligible_for_dispatch(&self, project: Option<&str>) -> WorkQueueResult<Vec<Task>> {
        let mut sql = String::from(
            "SELECT t.* FROM tasks t
             WHERE t.status = 'active'
               AND t.locked_by IS NULL
               AND NOT EXISTS (
                   SELECT 1 FROM task_dependencies td
                   JOIN tasks dep ON dep.id = td.depends_on_task_id
                   WHERE td.task_id = t.id AND dep.status != 'completed'
               )",
        );
        let mut bind: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(project) = project {
            sql.push_str(" AND t.project = ?");
            bind.push(Box::new(project.to_string()));
        }
        sql.push_str(" ORDER BY t.created_at ASC");

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params.as_slice(), row_to_task)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub async fn add_dependency(&self, task_id: Uuid, depends_on: Uuid) -> WorkQueueResult<()> {
        if task_id == depends_on {
            return Err(WorkQueueError::SelfDependency);
        }
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO task_dependencies (task_id, depends_on_task_id) VALUES (?1, ?2)",
            params![task_id.to_string(), depends_on.to_string()],
        )?;
        Ok(())
    }

    pub async fn get_dependencies(&self, task_id: Uuid) -> WorkQueueResult<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT t.* FROM tasks t
             JOIN task_dependencies td ON t.id = td.depends_on_task_id
             WHERE td.task_id = ?1",
        )?;
        let rows = stmt.query_map(params![task_id.to_string()], row_to_task)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub async fn get_task_log(&self, task_id: Uuid) -> WorkQueueResult<Vec<TaskLogEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM task_log WHERE task_id = ?1 ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![task_id.to_string()], row_to_log_entry)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub async fn record_dispatch_result(
        &self,
        result: NewDispatchResult,
    ) -> WorkQueueResult<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO dispatch_results (
                task_id, worker_id, model_id, branch_name, mission_brief_path,
                review_status, usage_stats, output_log, tokens_used, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                result.task_id.to_string(),
                result.worker_id,
                result.model_id,
                result.branch_name,
                result.mission_brief_path,
                result.review_status.map(|s| s.to_string()).unwrap_or_default(),
                serde_json::to_string(&result.usage_stats)?,
                result.output_log,
                result.tokens_used,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_dispatch_results(
        &self,
        task_id: Uuid,
    ) -> WorkQueueResult<Vec<DispatchResultRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM dispatch_results WHERE task_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![task_id.to_string()], row_to_dispatch_result)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub async fn record_token_usage(
        &self,
        tokens_input: i64,
        tokens_output: i64,
        estimated_cost_usd: f64,
        ceiling_usd: f64,
    ) -> WorkQueueResult<()> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;

        let existing: Option<i64> = conn
            .query_row("SELECT 1 FROM cost_ledger WHERE date = ?1", params![today], |r| r.get(0))
            .optional()?;

        if existing.is_some() {
            conn.execute(
                "UPDATE cost_ledger
                 SET tokens_input = tokens_input + ?1,
                     tokens_output = tokens_output + ?2,
                     estimated_cost_usd = estimated_cost_usd + ?3,
                     ceiling_usd = ?4,
                     updated_at = ?5
                 WHERE date = ?6",
                params![tokens_input, tokens_output, estimated_cost_usd, ceiling_usd, now, today],
            )?;
        } else {
            conn.execute(
                "INSERT INTO cost_ledger (date, tokens_input, tokens_output, estimated_cost_usd, ceiling_usd, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![today, tokens_input, tokens_output, estimated_cost_usd, ceiling_usd, now],
            )?;
        }
        Ok(())
    }

    pub async fn get_daily_usage(&self, date: Option<NaiveDate>) -> WorkQueueResult<Option<CostLedgerRow>> {
        let date = date.unwrap_or_else(|| Utc::now().date_naive()).format("%Y-%m-%d").to_string();
        let conn = self.conn.lock().await;
        let usage = conn
            .query_row("SELECT * FROM cost_ledger WHERE date = ?1", params![date], row_to_daily_usage)
            .optional()?;
        Ok(usage)
    }

    pub async fn check_budget_available(&self, ceiling_usd: f64) -> WorkQueueResult<(bool, f64)> {
        let usage = self.get_daily_usage(None).await?;
        let Some(usage) = usage else {
            return Ok((true, 0.0));
        };
        let pct = if ceiling_usd > 0.0 { usage.estimated_cost_usd / ceiling_usd * 100.0 } else { 100.0 };
        Ok((usage.estimated_cost_usd < ceiling_usd, pct))
    }

    /// Never overwrites `status` on conflict, so an external sync can't
    /// resurrect a task the queue has already moved past backlog.
    pub async fn upsert_from_github(&self, input: GithubUpsert) -> WorkQueueResult<(Uuid, bool)> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;

        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM tasks WHERE external_id = ?1 AND external_source = ?2",
                params![input.external_id, input.external_source],
                |r| r.get(0),
            )
            .optional()?;

        if let Some(existing_id) = existing {
            conn.execute(
                "UPDATE tasks SET title = ?1, description = ?2, priority = ?3, updated_at = ?4
                 WHERE external_id = ?5 AND external_source = ?6",
                params![
                    input.title,
                    input.description,
                    input.priority.to_string(),
                    now,
                    input.external_id,
                    input.external_source,
                ],
            )?;
            let id = Uuid::parse_str(&existing_id).map_err(|_| WorkQueueError::TaskNotFound(Uuid::nil()))?;
            Ok((id, false))
        } else {
            let id = Uuid::new_v4();
            conn.execute(
                "INSERT INTO tasks (
                    id, external_id, external_source, project, title, description,
                    status, priority, complexity, retry_count, token_budget, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'backlog', ?7, 'medium', 0, ?8, ?9, ?9)",
                params![
                    id.to_string(),
                    input.external_id,
                    input.external_source,
                    input.project,
                    input.title,
                    input.description,
                    input.priority.to_string(),
                    input.token_budget,
                    now,
                ],
            )?;
            Ok((id, true))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub project: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub complexity: String,
    pub external_id: Option<String>,
    pub external_source: Option<String>,
    pub mirror_path: Option<String>,
    pub token_budget: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewDispatchResult {
    pub task_id: Uuid,
    pub worker_id: String,
    pub model_id: String,
    pub branch_name: String,
    pub mission_brief_path: String,
    pub review_status: Option<ReviewStatus>,
    pub usage_stats: serde_json::Value,
    pub output_log: String,
    pub tokens_used: i64,
}

#[derive(Debug, Clone)]
pub struct GithubUpsert {
    pub external_id: String,
    pub external_source: String,
    pub title: String,
    pub project: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub token_budget: Option<i64>,
}

fn parse_status(s: &str) -> WorkQueueResult<TaskStatus> {
    Ok(match s {
        "backlog" => TaskStatus::Backlog,
        "active" => TaskStatus::Active,
        "dispatched" => TaskStatus::Dispatched,
        "in_review" => TaskStatus::InReview,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        other => {
            return Err(WorkQueueError::Database(rusqlite::Error::InvalidColumnType(
                0,
                format!("unknown task status '{other}'"),
                rusqlite::types::Type::Text,
            )))
        }
    })
}

fn parse_priority_str(s: &str) -> Result<Priority, String> {
    Ok(match s {
        "low" => Priority::Low,
        "medium" => Priority::Medium,
        "high" => Priority::High,
        "critical" => Priority::Critical,
        other => return Err(format!("unknown priority '{other}'")),
    })
}

fn parse_priority(s: &str) -> rusqlite::Result<Priority> {
    parse_priority_str(s).map_err(|e| rusqlite::Error::InvalidColumnType(0, e, rusqlite::types::Type::Text))
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let id: String = row.get("id")?;
    let status: String = row.get("status")?;
    let priority: String = row.get("priority")?;
    Ok(Task {
        id: Uuid::parse_str(&id)
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        title: row.get("title")?,
        project: row.get("project")?,
        description: row.get::<_, Option<String>>("description")?.unwrap_or_default(),
        status: parse_status(&status)
            .map_err(|_| rusqlite::Error::InvalidColumnType(0, status.clone(), rusqlite::types::Type::Text))?,
        priority: parse_priority(&priority)?,
        complexity: row.get("complexity")?,
        external_id: row.get("external_id")?,
        external_source: row.get("external_source")?,
        locked_by: row.get("locked_by")?,
        locked_at: parse_optional_rfc3339(row, "locked_at")?,
        retry_count: row.get("retry_count")?,
        mirror_path: row.get("mirror_path")?,
        token_budget: row.get("token_budget")?,
        created_at: parse_rfc3339(row, "created_at")?,
        updated_at: parse_rfc3339(row, "updated_at")?,
    })
}

fn row_to_log_entry(row: &Row<'_>) -> rusqlite::Result<TaskLogEntry> {
    let task_id: String = row.get("task_id")?;
    let old_status: Option<String> = row.get("old_status")?;
    let new_status: String = row.get("new_status")?;
    Ok(TaskLogEntry {
        id: row.get("id")?,
        task_id: Uuid::parse_str(&task_id)
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        old_status: old_status.map(|s| parse_status(&s)).transpose().map_err(|_| {
            rusqlite::Error::InvalidColumnType(0, "old_status".into(), rusqlite::types::Type::Text)
        })?,
        new_status: parse_status(&new_status)
            .map_err(|_| rusqlite::Error::InvalidColumnType(0, new_status.clone(), rusqlite::types::Type::Text))?,
        changed_by: row.get("changed_by")?,
        timestamp: parse_rfc3339(row, "timestamp")?,
        reason: row.get("reason")?,
    })
}

fn row_to_dispatch_result(row: &Row<'_>) -> rusqlite::Result<DispatchResultRecord> {
    let task_id: String = row.get("task_id")?;
    let review_status: String = row.get("review_status")?;
    let usage_stats: String = row.get("usage_stats")?;
    Ok(DispatchResultRecord {
        id: row.get("id")?,
        task_id: Uuid::parse_str(&task_id)
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        worker_id: row.get("worker_id")?,
        model_id: row.get("model_id")?,
        branch_name: row.get("branch_name")?,
        mission_brief_path: row.get("mission_brief_path")?,
        review_status: match review_status.as_str() {
            "passed" => Some(ReviewStatus::Passed),
            "failed" => Some(ReviewStatus::Failed),
            "skipped" => Some(ReviewStatus::Skipped),
            _ => None,
        },
        tokens_used: row.get("tokens_used")?,
        usage_stats: serde_json::from_str(&usage_stats).unwrap_or(serde_json::Value::Null),
        output_log: row.get("output_log")?,
        created_at: parse_rfc3339(row, "created_at")?,
    })
}

fn row_to_daily_usage(row: &Row<'_>) -> rusqlite::Result<CostLedgerRow> {
    let date: String = row.get("date")?;
    Ok(CostLedgerRow {
        date: NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        tokens_input: row.get("tokens_input")?,
        tokens_output: row.get("tokens_output")?,
        estimated_cost_usd: row.get("estimated_cost_usd")?,
        ceiling_usd: row.get("ceiling_usd")?,
        updated_at: parse_rfc3339(row, "updated_at")?,
    })
}

fn parse_rfc3339(row: &Row<'_>, col: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(col)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))
}

fn parse_optional_rfc3339(row: &Row<'_>, col: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(col)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn queue() -> WorkQueue {
        WorkQueue::open_in_memory().await.unwrap()
    }

    fn task_input(project: &str) -> NewTask {
        NewTask {
            title: "Add auth".into(),
            project: project.into(),
            description: Some("desc".into()),
            priority: Priority::Medium,
            complexity: "medium".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let q = queue().await;
        let id = q.add_task(task_input("core")).await.unwrap();
        let task = q.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.title, "Add auth");
        assert_eq!(task.status, TaskStatus::Backlog);
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn transition_rejects_disallowed_target() {
        let q = queue().await;
        let id = q.add_task(task_input("core")).await.unwrap();
        let err = q.transition(id, TaskStatus::Completed, "test", None).await.unwrap_err();
        assert!(matches!(err, WorkQueueError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn failed_to_backlog_increments_retry_count() {
        let q = queue().await;
        let id = q.add_task(task_input("core")).await.unwrap();
        q.transition(id, TaskStatus::Active, "test", None).await.unwrap();
        q.transition(id, TaskStatus::Failed, "test", Some("boom")).await.unwrap();
        let task = q.transition(id, TaskStatus::Backlog, "test", None).await.unwrap();
        assert_eq!(task.retry_count, 1);

        let log = q.get_task_log(id).await.unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[2].old_status, Some(TaskStatus::Failed));
        assert_eq!(log[2].new_status, TaskStatus::Backlog);
    }

    #[tokio::test]
    async fn locking_a_locked_task_fails() {
        let q = queue().await;
        let id = q.add_task(task_input("core")).await.unwrap();
        q.lock_task(id, "claude").await.unwrap();
        let err = q.lock_task(id, "gemini").await.unwrap_err();
        assert!(matches!(err, WorkQueueError::LockContention(_, _)));
    }

    #[tokio::test]
    async fn eligible_for_dispatch_excludes_locked_and_blocked() {
        let q = queue().await;
        let blocker = q.add_task(task_input("core")).await.unwrap();
        let dependent = q.add_task(task_input("core")).await.unwrap();
        q.add_dependency(dependent, blocker).await.unwrap();

        q.transition(blocker, TaskStatus::Active, "test", None).await.unwrap();
        q.transition(dependent, TaskStatus::Active, "test", None).await.unwrap();

        let eligible = q.eligible_for_dispatch(None).await.unwrap();
        let ids: Vec<Uuid> = eligible.iter().map(|t| t.id).collect();
        assert!(ids.contains(&blocker));
        assert!(!ids.contains(&dependent));

        q.transition(blocker, TaskStatus::Dispatched, "test", None).await.unwrap();
        q.transition(blocker, TaskStatus::InReview, "test", None).await.unwrap();
        q.transition(blocker, TaskStatus::Completed, "test", None).await.unwrap();

        let eligible = q.eligible_for_dispatch(None).await.unwrap();
        let ids: Vec<Uuid> = eligible.iter().map(|t| t.id).collect();
        assert!(ids.contains(&dependent));
    }

    #[tokio::test]
    async fn self_dependency_is_rejected() {
        let q = queue().await;
        let id = q.add_task(task_input("core")).await.unwrap();
        let err = q.add_dependency(id, id).await.unwrap_err();
        assert!(matches!(err, WorkQueueError::SelfDependency));
    }

    #[tokio::test]
    async fn upsert_from_github_never_overwrites_status() {
        let q = queue().await;
        let (id1, is_new1) = q
            .upsert_from_github(GithubUpsert {
                external_id: "42".into(),
                external_source: "github:acme/core".into(),
                title: "Fix bug".into(),
                project: "core".into(),
                description: None,
                priority: Priority::High,
                token_budget: None,
            })
            .await
            .unwrap();
        assert!(is_new1);

        q.transition(id1, TaskStatus::Active, "test", None).await.unwrap();

        let (id2, is_new2) = q
            .upsert_from_github(GithubUpsert {
                external_id: "42".into(),
                external_source: "github:acme/core".into(),
                title: "Fix bug (updated)".into(),
                project: "core".into(),
                description: None,
                priority: Priority::Critical,
                token_budget: None,
            })
            .await
            .unwrap();
        assert_eq!(id1, id2);
        assert!(!is_new2);

        let task = q.get_task(id1).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Active);
        assert_eq!(task.title, "Fix bug (updated)");
    }

    #[tokio::test]
    async fn budget_available_until_ceiling_reached() {
        let q = queue().await;
        let (ok, pct) = q.check_budget_available(10.0).await.unwrap();
        assert!(ok);
        assert_eq!(pct, 0.0);

        q.record_token_usage(1000, 500, 10.0, 10.0).await.unwrap();
        let (ok, pct) = q.check_budget_available(10.0).await.unwrap();
        assert!(!ok);
        assert!(pct >= 100.0);
    }

    #[tokio::test]
    async fn zero_ceiling_disables_budget() {
        let q = queue().await;
        q.record_token_usage(10, 10, 0.01, 0.0).await.unwrap();
        let (ok, pct) = q.check_budget_available(0.0).await.unwrap();
        assert!(!ok);
        assert_eq!(pct, 100.0);
    }

    #[tokio::test]
    async fn reclaim_stale_locks_unlocks_old_entries() {
        let q = queue().await;
        let id = q.add_task(task_input("core")).await.unwrap();
        q.lock_task(id, "claude").await.unwrap();
        let reclaimed = q.reclaim_stale_locks(30).await.unwrap();
        assert!(reclaimed.is_empty());
        let task = q.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.locked_by.as_deref(), Some("claude"));
    }
}
