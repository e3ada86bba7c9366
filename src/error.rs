use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ShortstackError {
    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Index already exists: {0}")]
    IndexAlreadyExists(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Table already exists: {0}")]
    TableAlreadyExists(String),

    #[error("Conditional write rejected for key {0}")]
    ConditionFailed(String),

    #[error("Throughput exceeded: {0}")]
    Throttled(String),

    #[error("Request rejected by backend: {0}")]
    Validation(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Client is shut down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(String),

    #[error("Tantivy error: {0}")]
    Tantivy(String),

    #[error("Query parse error: {0}")]
    QueryParse(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("SQLite error: {0}")]
    Sqlite(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ShortstackError>;

impl From<std::io::Error> for ShortstackError {
    fn from(e: std::io::Error) -> Self {
        ShortstackError::Io(e.to_string())
    }
}

impl From<tantivy::TantivyError> for ShortstackError {
    fn from(e: tantivy::TantivyError) -> Self {
        ShortstackError::Tantivy(e.to_string())
    }
}

impl From<tantivy::query::QueryParserError> for ShortstackError {
    fn from(e: tantivy::query::QueryParserError) -> Self {
        ShortstackError::QueryParse(e.to_string())
    }
}

impl From<tantivy::directory::error::OpenDirectoryError> for ShortstackError {
    fn from(e: tantivy::directory::error::OpenDirectoryError) -> Self {
        ShortstackError::Tantivy(e.to_string())
    }
}

impl From<serde_json::Error> for ShortstackError {
    fn from(e: serde_json::Error) -> Self {
        ShortstackError::Json(e.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for ShortstackError {
    fn from(e: rusqlite::Error) -> Self {
        ShortstackError::Sqlite(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ShortstackError {
    fn from(e: tokio::task::JoinError) -> Self {
        ShortstackError::Backend(format!("background task failed: {}", e))
    }
}

impl From<crate::store::table_client::TableError> for ShortstackError {
    fn from(e: crate::store::table_client::TableError) -> Self {
        use crate::store::table_client::TableError;
        match e {
            TableError::TableNotFound(name) => ShortstackError::TableNotFound(name),
            TableError::TableExists(name) => ShortstackError::TableAlreadyExists(name),
            TableError::ConditionFailed(key) => ShortstackError::ConditionFailed(key),
            TableError::Throttled(msg) => ShortstackError::Throttled(msg),
            TableError::Validation(msg) => ShortstackError::Validation(msg),
            TableError::Service(msg) => ShortstackError::Backend(msg),
        }
    }
}

impl ShortstackError {
    /// Backend signalled that the request rate is too high. The batch
    /// executor retries these indefinitely.
    pub fn is_throttling(&self) -> bool {
        matches!(self, ShortstackError::Throttled(_))
    }

    /// Errors worth retrying at the caller's discretion.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ShortstackError::Throttled(_) | ShortstackError::Timeout(_) | ShortstackError::Backend(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ShortstackError::ConditionFailed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::table_client::TableError;

    #[test]
    fn test_table_error_mapping() {
        let e: ShortstackError = TableError::Throttled("slow down".into()).into();
        assert!(e.is_throttling());
        assert!(e.is_transient());

        let e: ShortstackError = TableError::ConditionFailed("k1".into()).into();
        assert!(e.is_conflict());
        assert!(!e.is_transient());

        let e: ShortstackError = TableError::Validation("too many items".into()).into();
        assert!(matches!(e, ShortstackError::Validation(_)));
    }

    #[test]
    fn test_timeout_is_transient_not_throttling() {
        let e = ShortstackError::Timeout(10_000);
        assert!(e.is_transient());
        assert!(!e.is_throttling());
        assert_eq!(e.to_string(), "Request timed out after 10000 ms");
    }
}
