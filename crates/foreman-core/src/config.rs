//! Core configuration.
//!
//! [`Config`] is handed through to every handler invocation as-is, so
//! handler-specific sections live here next to the manager's own knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Scheduling knobs for the task manager loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Cap on the number of records one reconciliation round scans.
    pub max_tasks_per_round: i64,
    /// Period of the reconciliation tick, in seconds.
    pub reconcile_interval_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_round: 10,
            reconcile_interval_secs: 10,
        }
    }
}

impl ManagerConfig {
    /// The reconciliation tick period as a [`Duration`].
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

/// Configuration for the built-in database provisioning handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Maintenance URL of the backend cluster that user databases are
    /// created on (points at its `postgres` database).
    pub admin_url: String,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            admin_url: "postgresql://localhost:5432/postgres".to_owned(),
        }
    }
}

/// Top-level core configuration, passed opaquely to handlers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub manager: ManagerConfig,
    pub provision: ProvisionConfig,
}
