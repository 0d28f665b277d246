//! Structured error types surfaced by the control API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::fmt;

use crate::types::TaskStatus;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    NotFound,
    StateConflict,
    Unauthenticated,
    WorkspaceError,
    ExecutorError,
    Internal,
}

/// Structured error carried through store, scheduler and API layers.
#[derive(Debug, Serialize)]
pub struct AppError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    // Convenience constructors

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn task_not_found(task_id: i64) -> Self {
        Self::new(ErrorCode::NotFound, format!("Task not found: {}", task_id))
    }

    pub fn state_conflict(from: TaskStatus, to: TaskStatus) -> Self {
        Self::new(
            ErrorCode::StateConflict,
            format!(
                "Transition {} -> {} is not allowed",
                from.as_str(),
                to.as_str()
            ),
        )
    }

    pub fn terminal_task(task_id: i64, status: TaskStatus) -> Self {
        Self::new(
            ErrorCode::StateConflict,
            format!(
                "Task {} is {} and can no longer be modified",
                task_id,
                status.as_str()
            ),
        )
    }

    pub fn unauthenticated() -> Self {
        Self::new(ErrorCode::Unauthenticated, "Invalid or missing API credential")
    }

    pub fn workspace(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::WorkspaceError, message)
    }

    pub fn executor(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExecutorError, message)
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Internal, err.to_string())
    }

    fn status_code(&self) -> StatusCode {
        match self.code {
            ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::StateConflict => StatusCode::CONFLICT,
            ErrorCode::WorkspaceError | ErrorCode::ExecutorError | ErrorCode::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

// Allow using ? with anyhow errors by converting them
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<AppError>() {
            Ok(app_err) => app_err,
            Err(err) => AppError::internal(err),
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::internal(err)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::internal(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self)).into_response()
    }
}

/// Result type for store and API operations.
pub type AppResult<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_mapping() {
        assert_eq!(
            AppError::validation("x").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::unauthenticated().status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::task_not_found(1).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::state_conflict(TaskStatus::Completed, TaskStatus::Pending).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::internal("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn anyhow_downcast_preserves_code() {
        let err: anyhow::Error = AppError::task_not_found(7).into();
        let back: AppError = err.into();
        assert_eq!(back.code, ErrorCode::NotFound);
    }
}
