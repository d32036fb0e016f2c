//! Database query functions for the `tasks` table.
//!
//! The task manager consumes [`insert_task`], [`update_task`], and
//! [`list_incomplete_tasks`]; the API layer reads results back with
//! [`get_task`] and [`list_tasks`].

use sqlx::PgPool;

use crate::error::StoreError;
use crate::models::{Task, TaskState, TaskType};

/// Insert a new task row in the initial `waiting` state. Returns the
/// inserted task with server-generated defaults (id, state, timestamps).
pub async fn insert_task(
    pool: &PgPool,
    task_type: TaskType,
    developer_id: i64,
    account_id: i64,
    args: &serde_json::Value,
) -> Result<Task, StoreError> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (task_type, developer_id, account_id, args) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(task_type)
    .bind(developer_id)
    .bind(account_id)
    .bind(args)
    .fetch_one(pool)
    .await
    .map_err(|e| StoreError::new("insert task", e))?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: i64) -> Result<Option<Task>, StoreError> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| StoreError::new("fetch task", e))?;

    Ok(task)
}

/// Overwrite the mutable fields of a task by id.
///
/// `args`, the owner pair, and `created_at` are immutable after insert and
/// are not written here.
pub async fn update_task(pool: &PgPool, task: &Task) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET state = $1, result = $2, updated_at = $3, finished_at = $4 \
         WHERE id = $5",
    )
    .bind(task.state)
    .bind(&task.result)
    .bind(task.updated_at)
    .bind(task.finished_at)
    .bind(task.id)
    .execute(pool)
    .await
    .map_err(|e| StoreError::new("update task", e))?;

    if result.rows_affected() == 0 {
        return Err(StoreError::new("update task", sqlx::Error::RowNotFound));
    }

    Ok(())
}

/// List up to `limit` tasks whose state is not terminal, oldest first.
///
/// This is the reconciliation scan: it returns `waiting` tasks that were
/// never picked up and `running` tasks that may have been orphaned by a
/// previous process.
pub async fn list_incomplete_tasks(pool: &PgPool, limit: i64) -> Result<Vec<Task>, StoreError> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE state IN ('waiting', 'running') \
         ORDER BY created_at ASC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(|e| StoreError::new("list incomplete tasks", e))?;

    Ok(tasks)
}

/// List the most recent tasks, newest first.
pub async fn list_tasks(pool: &PgPool, limit: i64) -> Result<Vec<Task>, StoreError> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks ORDER BY created_at DESC, id DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(|e| StoreError::new("list tasks", e))?;

    Ok(tasks)
}

/// Count tasks grouped by state.
#[derive(Debug, Clone, Default)]
pub struct TaskCounts {
    pub waiting: i64,
    pub running: i64,
    pub success: i64,
    pub failed: i64,
    pub total: i64,
}

/// Get a summary of task counts by state.
pub async fn count_tasks_by_state(pool: &PgPool) -> Result<TaskCounts, StoreError> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT state::text, COUNT(*) as cnt \
         FROM tasks \
         GROUP BY state",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| StoreError::new("count tasks", e))?;

    let mut counts = TaskCounts::default();
    for (state, count) in &rows {
        match state.as_str() {
            "waiting" => counts.waiting = *count,
            "running" => counts.running = *count,
            "success" => counts.success = *count,
            "failed" => counts.failed = *count,
            _ => {}
        }
        counts.total += count;
    }
    Ok(counts)
}

/// Force a task into a given state, bypassing the manager.
///
/// Test and operator tooling only: the manager always goes through
/// [`update_task`] with a full record.
pub async fn set_task_state(pool: &PgPool, id: i64, state: TaskState) -> Result<(), StoreError> {
    sqlx::query("UPDATE tasks SET state = $1, updated_at = NOW() WHERE id = $2")
        .bind(state)
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| StoreError::new("set task state", e))?;

    Ok(())
}
