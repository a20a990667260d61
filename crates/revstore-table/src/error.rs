/// Errors from table store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    /// The table has not been created.
    #[error("no such table: {0}")]
    NoSuchTable(String),

    /// No row matched the filter.
    #[error("no rows matched in {table}")]
    NotFound { table: String },

    /// A row did not conform to the table schema.
    #[error("schema violation in {table}: {reason}")]
    SchemaViolation { table: String, reason: String },

    /// The query or filter cannot be served (missing hash key, bad page token).
    #[error("invalid query on {table}: {reason}")]
    InvalidQuery { table: String, reason: String },

    /// The backend could not serve the request.
    #[error("table store unavailable: {0}")]
    Unavailable(String),
}

impl TableError {
    /// Returns `true` for the "no matching rows" outcome of a read.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TableError::NotFound { .. })
    }
}

/// Result alias for table store operations.
pub type TableResult<T> = Result<T, TableError>;
