//! The `TaskHandler` trait -- the interface one task type's executor
//! implements.
//!
//! The trait is intentionally object-safe so handlers can be stored as
//! `Arc<dyn TaskHandler>` in the [`super::HandlerRegistry`].

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use foreman_db::models::{Task, TaskType};

use crate::config::Config;

/// Executor for a single task type.
///
/// A handler is invoked once per dispatched task, concurrently with other
/// handlers. It receives the task's cancellation token and is expected to
/// observe it and abort promptly; a returned error is a permanent failure
/// for that task (the manager never retries).
///
/// Handlers may read and write the store through `pool` for their own
/// purposes, but must never touch the manager's in-memory tables.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The task type this handler executes.
    fn task_type(&self) -> TaskType;

    /// Execute the task, producing a structured result.
    async fn run(
        &self,
        cancel: CancellationToken,
        config: &Config,
        pool: &PgPool,
        task: &Task,
    ) -> Result<serde_json::Value>;
}

// Compile-time assertion: TaskHandler must be object-safe.
// If this line compiles, the trait can be used as `dyn TaskHandler`.
const _: () = {
    fn _assert_object_safe(_: &dyn TaskHandler) {}
};
