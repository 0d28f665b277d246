//! Append-only per-task log entries.

use super::{now_ms, Database};
use crate::error::{AppError, AppResult};
use crate::types::{LogLevel, TaskLog};
use rusqlite::{params, Row};

fn parse_log_row(row: &Row) -> rusqlite::Result<TaskLog> {
    let level: String = row.get("level")?;
    Ok(TaskLog {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        timestamp: row.get("timestamp")?,
        level: LogLevel::from_str(&level).unwrap_or(LogLevel::Info),
        message: row.get("message")?,
        raw_output: row.get("raw_output")?,
    })
}

impl Database {
    /// Append a log entry for a task.
    pub fn add_log(
        &self,
        task_id: i64,
        level: LogLevel,
        message: &str,
        raw_output: Option<&str>,
    ) -> AppResult<()> {
        self.read(|conn| {
            conn.execute(
                "INSERT INTO task_logs (task_id, timestamp, level, message, raw_output)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![task_id, now_ms(), level.as_str(), message, raw_output],
            )?;
            Ok(())
        })
        .map_err(AppError::from)
    }

    /// Log entries for a task, oldest first. Insertion id breaks timestamp ties.
    pub fn get_task_logs(&self, task_id: i64) -> AppResult<Vec<TaskLog>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM task_logs WHERE task_id = ?1
                 ORDER BY timestamp ASC, id ASC",
            )?;
            let logs = stmt
                .query_map(params![task_id], parse_log_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(logs)
        })
        .map_err(AppError::from)
    }
}
