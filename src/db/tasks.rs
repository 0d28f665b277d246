//! Task CRUD, the task state machine, and scheduler queries.

use super::{now_ms, Database};
use crate::error::{AppError, AppResult};
use crate::types::{CreateTaskRequest, Task, TaskMode, TaskPatch, TaskPriority, TaskStatus};
use anyhow::Result;
use rusqlite::{params, Connection, Row, ToSql};

/// Ranking used by the scheduler: priority first, then oldest, then lowest id.
const NEXT_PENDING_SQL: &str = "
    SELECT * FROM tasks
    WHERE status = 'pending'
    ORDER BY
        CASE priority
            WHEN 'urgent' THEN 4
            WHEN 'high'   THEN 3
            WHEN 'medium' THEN 2
            WHEN 'low'    THEN 1
            ELSE 0
        END DESC,
        created_at ASC,
        id ASC";

pub fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    let status: String = row.get("status")?;
    let mode: String = row.get("mode")?;
    let priority: String = row.get("priority")?;
    let depends_on_json: String = row.get("depends_on")?;
    let tags_json: String = row.get("tags")?;

    Ok(Task {
        id: row.get("id")?,
        title: row.get("title")?,
        prompt: row.get("prompt")?,
        status: TaskStatus::from_str(&status).unwrap_or(TaskStatus::Pending),
        mode: TaskMode::from_str(&mode).unwrap_or(TaskMode::Execute),
        priority: TaskPriority::from_str(&priority).unwrap_or(TaskPriority::Medium),
        branch: row.get("branch")?,
        working_directory: row.get("working_directory")?,
        output: row.get("output")?,
        plan: row.get("plan")?,
        error: row.get("error")?,
        exit_code: row.get("exit_code")?,
        input_tokens: row.get("input_tokens")?,
        output_tokens: row.get("output_tokens")?,
        cost_usd: row.get("cost_usd")?,
        depends_on: serde_json::from_str(&depends_on_json).unwrap_or_default(),
        repo_path: row.get("repo_path")?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
    })
}

/// The task state machine. Everything not listed here is rejected.
pub fn transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, InProgress)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, Cancelled)
            | (Failed, Pending)
            | (Review, Pending)
            | (Pending, Cancelled)
    )
}

/// Internal helper to get a task using an existing connection.
fn get_task_internal(conn: &Connection, task_id: i64) -> Result<Option<Task>> {
    let mut stmt = conn.prepare("SELECT * FROM tasks WHERE id = ?1")?;

    let result = stmt.query_row(params![task_id], parse_task_row);

    match result {
        Ok(task) => Ok(Some(task)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn validate_request(conn: &Connection, req: &CreateTaskRequest) -> Result<()> {
    if req.title.is_empty() {
        return Err(AppError::validation("title must not be empty").into());
    }
    if req.title.chars().count() > 200 {
        return Err(AppError::validation("title must be at most 200 characters").into());
    }
    if req.prompt.trim().is_empty() {
        return Err(AppError::validation("prompt must not be empty").into());
    }
    for dep_id in &req.depends_on {
        if get_task_internal(conn, *dep_id)?.is_none() {
            return Err(AppError::validation(format!(
                "depends_on references unknown task {}",
                dep_id
            ))
            .into());
        }
    }
    Ok(())
}

fn insert_task(conn: &Connection, req: &CreateTaskRequest, now: i64) -> Result<i64> {
    validate_request(conn, req)?;
    conn.execute(
        "INSERT INTO tasks (title, prompt, status, mode, priority, depends_on, repo_path, tags, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            req.title,
            req.prompt,
            TaskStatus::Pending.as_str(),
            req.mode.as_str(),
            req.priority.as_str(),
            serde_json::to_string(&req.depends_on)?,
            req.repo_path,
            serde_json::to_string(&req.tags)?,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl Database {
    /// Create a new pending task. Dependencies must reference existing tasks
    /// (they need not be completed yet).
    pub fn create_task(&self, req: &CreateTaskRequest) -> AppResult<Task> {
        self.write(|conn| {
            let tx = conn.transaction()?;
            let id = insert_task(&tx, req, now_ms())?;
            let task = get_task_internal(&tx, id)?
                .ok_or_else(|| AppError::internal("created task vanished"))?;
            tx.commit()?;
            Ok(task)
        })
        .map_err(AppError::from)
    }

    /// Create several tasks in one transaction: all persist or none do.
    /// Later entries may depend on ids created earlier in the same batch.
    pub fn create_tasks_batch(&self, reqs: &[CreateTaskRequest]) -> AppResult<Vec<Task>> {
        self.write(|conn| {
            let tx = conn.transaction()?;
            let now = now_ms();
            let mut tasks = Vec::with_capacity(reqs.len());
            for req in reqs {
                let id = insert_task(&tx, req, now)?;
                let task = get_task_internal(&tx, id)?
                    .ok_or_else(|| AppError::internal("created task vanished"))?;
                tasks.push(task);
            }
            tx.commit()?;
            Ok(tasks)
        })
        .map_err(AppError::from)
    }

    pub fn get_task(&self, task_id: i64) -> AppResult<Option<Task>> {
        self.read(|conn| get_task_internal(conn, task_id))
            .map_err(AppError::from)
    }

    /// List tasks, oldest first. A `pending` filter uses the scheduler's
    /// ranking order instead.
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> AppResult<Vec<Task>> {
        self.read(|conn| {
            let collect = |sql: &str, task_params: &[&dyn ToSql]| -> Result<Vec<Task>> {
                let mut stmt = conn.prepare(sql)?;
                let tasks = stmt
                    .query_map(task_params, parse_task_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(tasks)
            };

            match status {
                Some(TaskStatus::Pending) => collect(NEXT_PENDING_SQL, &[]),
                Some(s) => collect(
                    "SELECT * FROM tasks WHERE status = ?1 ORDER BY created_at ASC, id ASC",
                    &[&s.as_str()],
                ),
                None => collect("SELECT * FROM tasks ORDER BY created_at ASC, id ASC", &[]),
            }
        })
        .map_err(AppError::from)
    }

    pub fn count_tasks(&self, status: TaskStatus) -> AppResult<i64> {
        self.read(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM tasks WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .map_err(AppError::from)
    }

    /// The single best-ranked pending task, if any. Pure function of store state.
    pub fn get_next_pending_task(&self) -> AppResult<Option<Task>> {
        self.read(|conn| {
            let sql = format!("{} LIMIT 1", NEXT_PENDING_SQL);
            let mut stmt = conn.prepare(&sql)?;
            let result = stmt.query_row([], parse_task_row);
            match result {
                Ok(task) => Ok(Some(task)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .map_err(AppError::from)
    }

    /// Apply a partial update. Status changes are validated against the state
    /// machine; terminal tasks reject every patch (retry is the only way out).
    /// Entering `in_progress` stamps `started_at`; entering a terminal state
    /// stamps `completed_at`.
    pub fn update_task(&self, task_id: i64, patch: TaskPatch) -> AppResult<Task> {
        self.write(|conn| {
            let tx = conn.transaction()?;
            let current = get_task_internal(&tx, task_id)?
                .ok_or_else(|| AppError::task_not_found(task_id))?;

            match patch.status {
                Some(new) if new != current.status => {
                    if !transition_allowed(current.status, new) {
                        return Err(AppError::state_conflict(current.status, new).into());
                    }
                }
                _ => {
                    if current.status.is_terminal() {
                        return Err(
                            AppError::terminal_task(task_id, current.status).into()
                        );
                    }
                }
            }

            let mut sets: Vec<String> = Vec::new();
            let mut values: Vec<Box<dyn ToSql>> = Vec::new();

            if let Some(new) = patch.status {
                sets.push("status = ?".to_string());
                values.push(Box::new(new.as_str()));
                if new == TaskStatus::InProgress && current.status != TaskStatus::InProgress {
                    sets.push("started_at = ?".to_string());
                    values.push(Box::new(now_ms()));
                }
                if new.is_terminal() && !current.status.is_terminal() {
                    sets.push("completed_at = ?".to_string());
                    values.push(Box::new(now_ms()));
                }
            }
            if let Some(branch) = &patch.branch {
                sets.push("branch = ?".to_string());
                values.push(Box::new(branch.clone()));
            }
            if let Some(dir) = &patch.working_directory {
                sets.push("working_directory = ?".to_string());
                values.push(Box::new(dir.clone()));
            }
            if let Some(output) = &patch.output {
                sets.push("output = ?".to_string());
                values.push(Box::new(output.clone()));
            }
            if let Some(plan) = &patch.plan {
                sets.push("plan = ?".to_string());
                values.push(Box::new(plan.clone()));
            }
            if let Some(error) = &patch.error {
                sets.push("error = ?".to_string());
                values.push(Box::new(error.clone()));
            }
            if let Some(exit_code) = patch.exit_code {
                sets.push("exit_code = ?".to_string());
                values.push(Box::new(exit_code));
            }
            if let Some(tokens) = patch.input_tokens {
                sets.push("input_tokens = ?".to_string());
                values.push(Box::new(tokens));
            }
            if let Some(tokens) = patch.output_tokens {
                sets.push("output_tokens = ?".to_string());
                values.push(Box::new(tokens));
            }
            if let Some(cost) = patch.cost_usd {
                sets.push("cost_usd = ?".to_string());
                values.push(Box::new(cost));
            }

            if !sets.is_empty() {
                let sql = format!("UPDATE tasks SET {} WHERE id = ?", sets.join(", "));
                values.push(Box::new(task_id));
                let value_refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
                tx.execute(&sql, value_refs.as_slice())?;
            }

            let task = get_task_internal(&tx, task_id)?
                .ok_or_else(|| AppError::task_not_found(task_id))?;
            tx.commit()?;
            Ok(task)
        })
        .map_err(AppError::from)
    }

    /// Send a failed task back to the queue, clearing its failure record.
    /// Idempotent: retrying a task that is already pending is a no-op.
    pub fn retry_task(&self, task_id: i64) -> AppResult<Task> {
        self.write(|conn| {
            let tx = conn.transaction()?;
            let current = get_task_internal(&tx, task_id)?
                .ok_or_else(|| AppError::task_not_found(task_id))?;

            match current.status {
                TaskStatus::Failed => {
                    tx.execute(
                        "UPDATE tasks SET status = 'pending', error = NULL, exit_code = NULL,
                         input_tokens = NULL, output_tokens = NULL, cost_usd = NULL,
                         completed_at = NULL
                         WHERE id = ?1",
                        params![task_id],
                    )?;
                }
                TaskStatus::Pending => {}
                other => {
                    return Err(AppError::state_conflict(other, TaskStatus::Pending).into());
                }
            }

            let task = get_task_internal(&tx, task_id)?
                .ok_or_else(|| AppError::task_not_found(task_id))?;
            tx.commit()?;
            Ok(task)
        })
        .map_err(AppError::from)
    }

    /// Approve a plan under review: the task re-enters the queue in execute mode.
    pub fn approve_plan(&self, task_id: i64) -> AppResult<Task> {
        self.write(|conn| {
            let tx = conn.transaction()?;
            let current = get_task_internal(&tx, task_id)?
                .ok_or_else(|| AppError::task_not_found(task_id))?;

            if current.status != TaskStatus::Review {
                return Err(
                    AppError::state_conflict(current.status, TaskStatus::Pending).into()
                );
            }

            tx.execute(
                "UPDATE tasks SET status = 'pending', mode = 'execute' WHERE id = ?1",
                params![task_id],
            )?;

            let task = get_task_internal(&tx, task_id)?
                .ok_or_else(|| AppError::task_not_found(task_id))?;
            tx.commit()?;
            Ok(task)
        })
        .map_err(AppError::from)
    }

    /// Delete a task and (via cascade) its log entries.
    pub fn delete_task(&self, task_id: i64) -> AppResult<()> {
        self.read(|conn| {
            let affected = conn.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])?;
            if affected == 0 {
                return Err(AppError::task_not_found(task_id).into());
            }
            Ok(())
        })
        .map_err(AppError::from)
    }

    /// Boot recovery: any task left `in_progress` by a previous process is
    /// returned to the queue with its start time cleared. Returns the number
    /// of repaired tasks.
    pub fn recover(&self) -> AppResult<usize> {
        self.read(|conn| {
            let affected = conn.execute(
                "UPDATE tasks SET status = 'pending', started_at = NULL
                 WHERE status = 'in_progress'",
                [],
            )?;
            Ok(affected)
        })
        .map_err(AppError::from)
    }
}
