//! Core types for the agent dispatch server.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Review,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Review => "review",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "review" => Some(TaskStatus::Review),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions (retry excepted).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// How the agent is prompted: plain execution, or plan-first with an
/// explicit plan/implementation split in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    Execute,
    Plan,
}

impl TaskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskMode::Execute => "execute",
            TaskMode::Plan => "plan",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "execute" => Some(TaskMode::Execute),
            "plan" => Some(TaskMode::Plan),
            _ => None,
        }
    }
}

impl Default for TaskMode {
    fn default() -> Self {
        TaskMode::Execute
    }
}

/// Scheduling priority, ordered low to urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Urgent => "urgent",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "low" => Some(TaskPriority::Low),
            "medium" => Some(TaskPriority::Medium),
            "high" => Some(TaskPriority::High),
            "urgent" => Some(TaskPriority::Urgent),
            _ => None,
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Medium
    }
}

/// Severity of a task log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// A task as stored and served. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub mode: TaskMode,
    pub priority: TaskPriority,

    pub branch: Option<String>,
    pub working_directory: Option<String>,

    pub output: Option<String>,
    pub plan: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,

    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cost_usd: Option<f64>,

    pub depends_on: Vec<i64>,
    pub repo_path: Option<String>,
    pub tags: Vec<String>,

    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

/// A single append-only log entry for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    pub id: i64,
    pub task_id: i64,
    pub timestamp: i64,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
}

/// Input for creating a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    pub prompt: String,
    #[serde(default)]
    pub mode: TaskMode,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub depends_on: Vec<i64>,
    pub repo_path: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Partial update applied through the store's state-machine check.
/// `None` fields are left untouched.
#[derive(Debug, Default, Clone)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub branch: Option<String>,
    pub working_directory: Option<String>,
    pub output: Option<String>,
    pub plan: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cost_usd: Option<f64>,
}

/// Outcome of one executor run, handed to the completion callback.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub plan: Option<String>,
    pub error: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cost_usd: Option<f64>,
}

impl TaskResult {
    /// Failure recorded before the agent ever started (workspace or spawn error).
    pub fn failed_before_start(error: String) -> Self {
        Self {
            status: TaskStatus::Failed,
            exit_code: Some(1),
            output: None,
            plan: None,
            error: Some(error),
            input_tokens: None,
            output_tokens: None,
            cost_usd: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Review,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(TaskStatus::from_str("bogus"), None);
    }

    #[test]
    fn priority_ordering_is_low_to_urgent() {
        assert!(TaskPriority::Low < TaskPriority::Medium);
        assert!(TaskPriority::Medium < TaskPriority::High);
        assert!(TaskPriority::High < TaskPriority::Urgent);
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(!TaskStatus::Review.is_terminal());
    }

    #[test]
    fn create_request_defaults() {
        let req: CreateTaskRequest =
            serde_json::from_str(r#"{"title":"t","prompt":"p"}"#).unwrap();
        assert_eq!(req.mode, TaskMode::Execute);
        assert_eq!(req.priority, TaskPriority::Medium);
        assert!(req.depends_on.is_empty());
        assert!(req.tags.is_empty());
    }
}
