//! HTTP control surface: REST commands plus the observer websocket.

pub mod tasks;
pub mod ws;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db::Database;
use crate::error::AppError;
use crate::executor::TaskExecutor;
use crate::hub::EventHub;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub executor: Arc<TaskExecutor>,
    pub hub: EventHub,
    pub config: Arc<Config>,
}

/// When a credential is configured, mutating requests must present it in the
/// `x-api-key` header. Reads and the observer stream stay open.
async fn require_credential(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let mutating = matches!(
        *request.method(),
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    );
    if mutating && !state.config.api_credential.is_empty() {
        let provided = request
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != state.config.api_credential {
            return AppError::unauthenticated().into_response();
        }
    }
    next.run(request).await
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(tasks::health))
        .route("/api/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route("/api/tasks/batch", post(tasks::create_tasks_batch))
        .route(
            "/api/tasks/:id",
            get(tasks::get_task).delete(tasks::delete_task),
        )
        .route("/api/tasks/:id/logs", get(tasks::get_task_logs))
        .route("/api/tasks/:id/cancel", post(tasks::cancel_task))
        .route("/api/tasks/:id/retry", post(tasks::retry_task))
        .route("/api/tasks/:id/approve-plan", post(tasks::approve_plan))
        .route("/ws", get(ws::observe))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_credential,
        ))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
