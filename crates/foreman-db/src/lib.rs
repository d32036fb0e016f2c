//! Store layer for foreman: connection pooling, migrations, task records,
//! and the query functions the task manager consumes.

pub mod error;
pub mod models;
pub mod pool;
pub mod queries;

pub use error::StoreError;
pub use pool::DbConfig;
