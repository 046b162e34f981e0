//! Error types for the repository layer.
//!
//! This module defines all error types using `thiserror`. Store failures keep
//! the underlying `sqlx::Error` as their source together with the operation,
//! entity and database code that produced them.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Configuration { message: String, suggestion: String },

    #[error("Unsupported database type '{db_type}' for database code '{code}'")]
    UnsupportedDialect { code: String, db_type: String },

    #[error("Write failed: {operation} on {entity} affected no rows")]
    WriteFailed { operation: String, entity: String },

    #[error("Invalid field selector '{field}' for {entity}")]
    InvalidFieldSelector { field: String, entity: String },

    #[error("No active transaction (unit of work: {unit_of_work_id})")]
    NoActiveTransaction { unit_of_work_id: String },

    #[error("Store failure during {operation} on {entity} (database code '{code}'): {source}")]
    Store {
        operation: String,
        entity: String,
        code: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("No mapping registered from {from} to {to}")]
    MappingNotRegistered { from: String, to: String },

    #[error("Failed to decode row into {entity}: {message}")]
    Decode { entity: String, message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },
}

impl DbError {
    /// Create a configuration error with a helpful suggestion.
    pub fn configuration(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an error for a database code missing from the registry.
    pub fn unknown_code(code: impl Into<String>) -> Self {
        let code = code.into();
        Self::Configuration {
            message: format!("Database code '{}' is not configured", code),
            suggestion: "Add an entry for this code to the connection registry".to_string(),
        }
    }

    pub fn unsupported_dialect(code: impl Into<String>, db_type: impl Into<String>) -> Self {
        Self::UnsupportedDialect {
            code: code.into(),
            db_type: db_type.into(),
        }
    }

    pub fn write_failed(operation: impl Into<String>, entity: impl Into<String>) -> Self {
        Self::WriteFailed {
            operation: operation.into(),
            entity: entity.into(),
        }
    }

    pub fn invalid_field(field: impl Into<String>, entity: impl Into<String>) -> Self {
        Self::InvalidFieldSelector {
            field: field.into(),
            entity: entity.into(),
        }
    }

    pub fn no_active_transaction(unit_of_work_id: impl Into<String>) -> Self {
        Self::NoActiveTransaction {
            unit_of_work_id: unit_of_work_id.into(),
        }
    }

    /// Wrap a backing-client error with the context it occurred in.
    pub fn store(
        operation: impl Into<String>,
        entity: impl Into<String>,
        code: impl Into<String>,
        source: sqlx::Error,
    ) -> Self {
        Self::Store {
            operation: operation.into(),
            entity: entity.into(),
            code: code.into(),
            source,
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn mapping_not_registered(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::MappingNotRegistered {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn decode(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            entity: entity.into(),
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Configuration { suggestion, .. } => Some(suggestion),
            Self::UnsupportedDialect { .. } => {
                Some("Use one of: PostgreSQL, MySql, Sqlite (case-insensitive)")
            }
            Self::Store { source, .. } => Some(store_suggestion(source)),
            Self::Timeout { .. } => Some("Consider increasing query_timeout or optimizing the statement"),
            _ => None,
        }
    }

    /// SQLSTATE reported by the database, if this is a database-side failure.
    pub fn sql_state(&self) -> Option<String> {
        match self {
            Self::Store {
                source: sqlx::Error::Database(db_err),
                ..
            } => db_err.code().map(|c| c.to_string()),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// The repository never retries on its own; this only classifies.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Store { source, .. } => matches!(
                source,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

fn store_suggestion(err: &sqlx::Error) -> &'static str {
    match err {
        sqlx::Error::Configuration(_) => "Check the connection string format and credentials",
        sqlx::Error::Database(_) => "Check the SQL syntax and referenced objects",
        sqlx::Error::RowNotFound => "Verify the query conditions match existing data",
        sqlx::Error::PoolTimedOut => "Increase max_connections or acquire_timeout",
        sqlx::Error::PoolClosed => "The client was closed; request a new repository",
        sqlx::Error::Io(_) => "Check network connectivity and database server status",
        sqlx::Error::Tls(_) => "Verify TLS configuration and certificates",
        sqlx::Error::Protocol(_) => "Check database server compatibility",
        sqlx::Error::ColumnNotFound(_) | sqlx::Error::TypeNotFound { .. } => {
            "Check that entity fields match the table columns"
        }
        _ => "Inspect the underlying database error",
    }
}

/// Convert sqlx errors raised outside an entity operation.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        DbError::store("statement", "-", "-", err)
    }
}

/// Result type alias for repository operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::unknown_code("Missing");
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("Missing"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::configuration("bad url", "Check the URL");
        assert_eq!(err.suggestion(), Some("Check the URL"));
        assert!(DbError::write_failed("insert", "User").suggestion().is_none());
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("query", 30).is_retryable());
        assert!(DbError::store("query", "User", "Default", sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!DbError::store("query", "User", "Default", sqlx::Error::RowNotFound).is_retryable());
        assert!(!DbError::write_failed("insert", "User").is_retryable());
        assert!(!DbError::cancelled("insert").is_retryable());
    }

    #[test]
    fn test_store_error_keeps_context_and_source() {
        let err = DbError::store("update", "User", "Tenant1", sqlx::Error::PoolClosed);
        let text = err.to_string();
        assert!(text.contains("update"));
        assert!(text.contains("User"));
        assert!(text.contains("Tenant1"));
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.sql_state().is_none());
    }

    #[test]
    fn test_cancelled_is_distinguished() {
        assert!(DbError::cancelled("query").is_cancelled());
        assert!(!DbError::timeout("query", 1).is_cancelled());
    }

    #[test]
    fn test_from_sqlx_error() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DbError::Store { .. }));
    }
}
