//! The HTTP API surface: task submission, inspection, kill, and wait.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use foreman_core::ManagerError;
use foreman_core::config::Config;
use foreman_core::handler::HandlerRegistry;
use foreman_core::handler::provision::{CreateDatabaseHandler, DropDatabaseHandler};
use foreman_core::manager::TaskManager;
use foreman_db::models::TaskType;
use foreman_db::queries::tasks as task_db;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: msg.into(),
        }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::GATEWAY_TIMEOUT,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

fn default_args() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub task_type: TaskType,
    pub developer_id: i64,
    pub account_id: i64,
    #[serde(default = "default_args")]
    pub args: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct WaitParams {
    pub timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub manager: Arc<TaskManager>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{id}", get(get_task_detail))
        .route("/api/tasks/{id}/kill", post(kill_task))
        .route("/api/tasks/{id}/wait", post(wait_task))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(pool: PgPool, core_config: Config, bind: &str, port: u16) -> Result<()> {
    let mut manager = TaskManager::new(
        Arc::new(core_config),
        pool.clone(),
        HandlerRegistry::new(),
    );
    manager.register(CreateDatabaseHandler);
    manager.register(DropDatabaseHandler);
    let manager = Arc::new(manager);
    manager.start()?;

    let app = build_router(AppState {
        pool,
        manager: Arc::clone(&manager),
    });
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("foreman serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.stop().await;
    tracing::info!("foreman serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    let tasks = task_db::list_tasks(&state.pool, 50)
        .await
        .map_err(|e| AppError::internal(e.into()))?;

    let rows = if tasks.is_empty() {
        "<tr><td colspan=\"4\">No tasks found.</td></tr>".to_string()
    } else {
        tasks
            .iter()
            .map(|t| {
                format!(
                    "<tr><td><a href=\"/api/tasks/{id}\">{id}</a></td><td>{ty}</td><td>{state}</td><td>{created}</td></tr>",
                    id = t.id,
                    ty = t.task_type,
                    state = t.state,
                    created = t.created_at.to_rfc3339(),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let html = format!(
        "<!DOCTYPE html>\
<html><head><title>foreman</title></head><body>\
<h1>foreman</h1>\
<p><a href=\"/api/tasks\">/api/tasks</a></p>\
<table><tr><th>Task</th><th>Type</th><th>State</th><th>Created</th></tr>{rows}</table>\
</body></html>"
    );

    Ok(Html(html).into_response())
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<axum::response::Response, AppError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let tasks = task_db::list_tasks(&state.pool, limit)
        .await
        .map_err(|e| AppError::internal(e.into()))?;

    Ok(Json(tasks).into_response())
}

async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<axum::response::Response, AppError> {
    let id = state
        .manager
        .submit(req.task_type, req.developer_id, req.account_id, req.args)
        .await
        .map_err(|e| AppError::internal(e.into()))?;

    let body = serde_json::json!({ "id": id });
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

async fn get_task_detail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<axum::response::Response, AppError> {
    let task = task_db::get_task(&state.pool, id)
        .await
        .map_err(|e| AppError::internal(e.into()))?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;

    Ok(Json(task).into_response())
}

async fn kill_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<axum::response::Response, AppError> {
    let task = task_db::get_task(&state.pool, id)
        .await
        .map_err(|e| AppError::internal(e.into()))?;
    if task.is_none() {
        return Err(AppError::not_found(format!("task {id} not found")));
    }

    state.manager.kill(id).await;

    let body = serde_json::json!({ "id": id });
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

async fn wait_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<WaitParams>,
) -> Result<axum::response::Response, AppError> {
    let existing = task_db::get_task(&state.pool, id)
        .await
        .map_err(|e| AppError::internal(e.into()))?;
    if existing.is_none() {
        return Err(AppError::not_found(format!("task {id} not found")));
    }

    let timeout = Duration::from_secs(params.timeout_secs.unwrap_or(30).clamp(1, 300));
    let caller = CancellationToken::new();
    let wait = state.manager.wait(caller.clone(), id);
    tokio::pin!(wait);

    let outcome = tokio::select! {
        res = &mut wait => res,
        _ = tokio::time::sleep(timeout) => {
            // The wait future must stay alive to observe the token; it
            // resolves as Cancelled instead of being dropped mid-flight.
            caller.cancel();
            wait.await
        }
    };

    match outcome {
        Ok(()) => {
            let task = task_db::get_task(&state.pool, id)
                .await
                .map_err(|e| AppError::internal(e.into()))?
                .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;
            Ok(Json(task).into_response())
        }
        Err(ManagerError::Cancelled) => Err(AppError::timeout(format!(
            "task {id} did not finish within {}s",
            timeout.as_secs()
        ))),
        Err(ManagerError::NotRunning | ManagerError::ShuttingDown) => {
            Err(AppError::unavailable("task manager is shutting down"))
        }
        Err(err) => Err(AppError::internal(err.into())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
