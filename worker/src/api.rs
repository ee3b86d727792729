//! Worker HTTP API
//!
//! JSON over HTTP/1.1. The manager POSTs task events here, pulls the task
//! list for reconciliation, DELETEs tasks to stop them, and reads host
//! stats for scheduling.

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
use shared::Stats;

use crate::worker::Worker;

/// Application state shared across all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub worker: Arc<Worker>,
}

/// Creates the worker's API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(endpoints::TASKS, post(handle_add_task).get(handle_get_tasks))
        .route("/tasks/{id}", delete(handle_stop_task))
        .route(endpoints::STATS, get(handle_get_stats))
        .with_state(state)
}

/// `POST /tasks`: accept a task event and enqueue its task for execution.
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
    state.worker.add_task(event.task).await;
    Ok((StatusCode::CREATED, Json(task)))
}

/// `GET /tasks`: the worker's current store contents.
async fn handle_get_tasks(State(state): State<AppState>) -> Result<Json<Vec<Task>>, ApiError> {
    let tasks = state
        .worker
        .get_tasks()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(tasks))
}

/// `DELETE /tasks/{id}`: enqueue a stop for a known task.
async fn handle_stop_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let tasks = state
        .worker
        .get_tasks()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let Some(task) = tasks.into_iter().find(|t| t.id == id) else {
        warn!(task_id = %id, "Stop requested for unknown task");
        return Err(ApiError::NotFound(format!("No task with ID {} found", id)));
    };

    // A copy with the desired terminal state; the run loop validates the
    // transition against the persisted copy.
    let mut to_stop = task;
    to_stop.state = TaskState::Completed;
    info!(task_id = %id, container_id = %to_stop.container_id, "Added task for stopping");
    state.worker.add_task(to_stop).await;

    Ok(StatusCode::NO_CONTENT)
}

/// `GET /stats`: latest host snapshot.
async fn handle_get_stats(State(state): State<AppState>) -> Json<Stats> {
    Json(state.worker.stats().await)
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

#[cfg(test)]
mod tests {
    use super::*;
    use shared::MemoryStore;

    fn test_state() -> AppState {
        AppState {
            worker: Arc::new(Worker::new("worker-test", Box::new(MemoryStore::new()))),
        }
    }

    #[tokio::test]
    async fn test_add_task_returns_created() {
        let state = test_state();
        let mut task = Task::new("t", "nginx", 0.1, 64);
        task.state = TaskState::Scheduled;
        let event = Event::new(TaskState::Running, task.clone());

        let result = handle_add_task(State(state.clone()), Ok(Json(event)))
            .await
            .unwrap();
        assert_eq!(result.0, StatusCode::CREATED);
        assert_eq!(result.1 .0.id, task.id);
    }

    #[tokio::test]
    async fn test_stop_unknown_task_is_404() {
        let state = test_state();
        let err = handle_stop_task(State(state), Path(Uuid::new_v4()))
            .await
            .unwrap_err();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_tasks_empty() {
        let state = test_state();
        let Json(tasks) = handle_get_tasks(State(state)).await.unwrap();
        assert!(tasks.is_empty());
    }
}
