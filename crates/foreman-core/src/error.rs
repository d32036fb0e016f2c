use thiserror::Error;

use foreman_db::StoreError;

/// Errors surfaced by [`crate::TaskManager`]'s caller-facing operations.
///
/// Handler failures never appear here: they are reported through the task
/// record's `result`, not through `submit`'s return value.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("task manager is already running")]
    AlreadyRunning,

    #[error("task manager is not running")]
    NotRunning,

    #[error("task manager is shutting down")]
    ShuttingDown,

    #[error("wait cancelled by caller")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}
