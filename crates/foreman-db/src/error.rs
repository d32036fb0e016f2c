use thiserror::Error;

/// Error returned by the task store.
///
/// Every query function names the operation that failed so callers can log
/// a useful message without unwrapping the sqlx error chain themselves.
#[derive(Debug, Error)]
#[error("task store failed to {op}")]
pub struct StoreError {
    /// Short description of the failed operation, e.g. "insert task".
    pub op: &'static str,
    #[source]
    pub source: sqlx::Error,
}

impl StoreError {
    pub(crate) fn new(op: &'static str, source: sqlx::Error) -> Self {
        Self { op, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_names_the_operation() {
        let err = StoreError::new("insert task", sqlx::Error::PoolClosed);
        assert_eq!(err.to_string(), "task store failed to insert task");
    }
}
