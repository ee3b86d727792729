//! Manager HTTP API
//!
//! Mirrors the worker's `/tasks` surface for the cluster view: clients POST
//! task events for scheduling, GET the manager's view of every task, and
//! DELETE a task to request a stop.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use shared::api::{endpoints, ErrResponse};
use shared::task::{Event, State as TaskState, Task};

use crate::manager::Manager;

/// Application state shared across all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
}

/// Creates the manager's API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(endpoints::TASKS, post(handle_add_task).get(handle_get_tasks))
        .route("/tasks/{id}", delete(handle_stop_task))
        .with_state(state)
}

/// `POST /tasks`: accept a task event onto the pending queue.
async fn handle_add_task(
    State(state): State<AppState>,
    body: Result<Json<Event>, axum::extract::rejection::JsonRejection>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let Json(event) = body.map_err(|e| {
        warn!(error = %e, "Rejected malformed task event");
        ApiError::BadRequest(format!("Error unmarshalling body: {}", e))
    })?;

    info!(
        event_id = %event.id,
        task_id = %event.task.id,
        desired_state = ?event.state,
        "Received task event"
    );

    let task = event.task.clone();
    state.manager.add_task(event).await;
    Ok((StatusCode::CREATED, Json(task)))
}

/// `GET /tasks`: the manager's view of the cluster.
async fn handle_get_tasks(State(state): State<AppState>) -> Result<Json<Vec<Task>>, ApiError> {
    let tasks = state
        .manager
        .get_tasks()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(tasks))
}

/// `DELETE /tasks/{id}`: request a stop for a known task by queueing a
/// Completed-desired event; the process loop validates and dispatches it.
async fn handle_stop_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let tasks = state
        .manager
        .get_tasks()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let Some(task) = tasks.into_iter().find(|t| t.id == id) else {
        warn!(task_id = %id, "Stop requested for unknown task");
        return Err(ApiError::NotFound(format!("No task with ID {} found", id)));
    };

    info!(task_id = %id, "Task stop requested");
    state
        .manager
        .add_task(Event::new(TaskState::Completed, task))
        .await;
    Ok(StatusCode::NO_CONTENT)
}

/// API error responses, rendered as the shared `{HTTPStatusCode, Message}`
/// body.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        let body = Json(ErrResponse::new(status.as_u16(), message));
        (status, body).into_response()
    }
}
