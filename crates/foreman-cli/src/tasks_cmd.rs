//! Read-only task inspection commands.

use anyhow::{Context, Result};
use sqlx::PgPool;

use foreman_db::queries::tasks as task_db;

/// Execute `foreman tasks`: print a table of recent tasks.
pub async fn run_tasks(pool: &PgPool, limit: i64) -> Result<()> {
    let tasks = task_db::list_tasks(pool, limit).await?;

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    let counts = task_db::count_tasks_by_state(pool).await?;
    println!(
        "{} tasks total ({} waiting, {} running, {} success, {} failed)",
        counts.total, counts.waiting, counts.running, counts.success, counts.failed
    );
    println!();
    println!(
        "{:>8}  {:<16}  {:<8}  {:>10}  {:>10}  {}",
        "ID", "TYPE", "STATE", "DEVELOPER", "ACCOUNT", "CREATED"
    );
    for task in &tasks {
        println!(
            "{:>8}  {:<16}  {:<8}  {:>10}  {:>10}  {}",
            task.id,
            task.task_type.to_string(),
            task.state.to_string(),
            task.developer_id,
            task.account_id,
            task.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }

    Ok(())
}

/// Execute `foreman task <id>`: print one task record as JSON.
pub async fn run_task_show(pool: &PgPool, task_id: &str) -> Result<()> {
    let id: i64 = task_id
        .parse()
        .with_context(|| format!("invalid task ID: {task_id}"))?;

    let task = task_db::get_task(pool, id)
        .await?
        .with_context(|| format!("task {id} not found"))?;

    let rendered =
        serde_json::to_string_pretty(&task).context("failed to render task as JSON")?;
    println!("{rendered}");

    Ok(())
}
