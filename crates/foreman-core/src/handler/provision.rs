//! Built-in handlers for database provisioning task types.
//!
//! Both handlers connect to the backend cluster's maintenance database
//! (`provision.admin_url`) with a single short-lived connection and issue
//! the DDL there. Account operation types (`top_up`, `withdraw`) have no
//! built-in handler; the embedding proxy registers its own.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tokio_util::sync::CancellationToken;

use foreman_db::models::{Task, TaskType};
use foreman_db::pool::validate_database_name;

use crate::config::{Config, ProvisionConfig};
use crate::handler::trait_def::TaskHandler;

/// Extract the `name` argument shared by both handlers and validate it as
/// a DDL-safe identifier.
fn database_name(task: &Task) -> Result<&str> {
    let name = task
        .args
        .get("name")
        .and_then(|v| v.as_str())
        .context("missing \"name\" argument")?;

    validate_database_name(name)?;

    Ok(name)
}

/// Connect to the backend cluster's maintenance database.
async fn connect_admin(config: &ProvisionConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.admin_url)
        .await
        .with_context(|| {
            format!(
                "failed to connect to provisioning cluster at {}",
                config.admin_url
            )
        })
}

/// Handler for `create_database`: creates the requested database on the
/// backend cluster if it does not already exist.
///
/// Result: `{"name": <name>, "created": <bool>}`.
pub struct CreateDatabaseHandler;

#[async_trait]
impl TaskHandler for CreateDatabaseHandler {
    fn task_type(&self) -> TaskType {
        TaskType::CreateDatabase
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        config: &Config,
        _pool: &PgPool,
        task: &Task,
    ) -> Result<serde_json::Value> {
        let name = database_name(task)?;

        if cancel.is_cancelled() {
            bail!("cancelled before execution");
        }

        let admin = connect_admin(&config.provision).await?;

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(name)
                .fetch_one(&admin)
                .await
                .context("failed to query pg_database")?;

        if !exists {
            let stmt = format!("CREATE DATABASE {name}");
            admin
                .execute(stmt.as_str())
                .await
                .with_context(|| format!("failed to create database {name}"))?;
            tracing::info!(task_id = task.id, db = name, "database created");
        }

        admin.close().await;
        Ok(json!({ "name": name, "created": !exists }))
    }
}

/// Handler for `drop_database`: drops the requested database on the backend
/// cluster, terminating its connections first.
///
/// Result: `{"name": <name>, "dropped": <bool>}`.
pub struct DropDatabaseHandler;

#[async_trait]
impl TaskHandler for DropDatabaseHandler {
    fn task_type(&self) -> TaskType {
        TaskType::DropDatabase
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        config: &Config,
        _pool: &PgPool,
        task: &Task,
    ) -> Result<serde_json::Value> {
        let name = database_name(task)?;

        if cancel.is_cancelled() {
            bail!("cancelled before execution");
        }

        let admin = connect_admin(&config.provision).await?;

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(name)
                .fetch_one(&admin)
                .await
                .context("failed to query pg_database")?;

        if exists {
            let terminate = format!(
                "SELECT pg_terminate_backend(pid) \
                 FROM pg_stat_activity \
                 WHERE datname = '{name}' AND pid <> pg_backend_pid()"
            );
            let _ = admin.execute(terminate.as_str()).await;

            let stmt = format!("DROP DATABASE IF EXISTS {name}");
            admin
                .execute(stmt.as_str())
                .await
                .with_context(|| format!("failed to drop database {name}"))?;
            tracing::info!(task_id = task.id, db = name, "database dropped");
        }

        admin.close().await;
        Ok(json!({ "name": name, "dropped": exists }))
    }
}
