use thiserror::Error;

/// Failures surfaced by the database layer, mapped to JSON-RPC error codes
/// in `server::db_error_to_response`.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Read-only violation: {0}")]
    ReadOnlyViolation(String),

    #[error("Connection error: {0}")]
    ConnectionError(#[source] sqlx::Error),

    #[error("SQL error: {0}")]
    SqlError(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No database selected")]
    NoDatabaseSelected,
}
