//! Storage error types.
//!
//! Uses miette for diagnostic output and thiserror for derive macros.
//! The error types are storage-backend agnostic.

use miette::Diagnostic;
use thiserror::Error;

/// Local storage errors.
#[derive(Error, Diagnostic, Debug)]
pub enum DbError {
    #[error("Entity not found: {entity_type} with id '{id}'")]
    #[diagnostic(code(maintsync::db::not_found))]
    NotFound { entity_type: String, id: String },

    #[error("Change '{id}' is {status}, expected {expected}")]
    #[diagnostic(
        code(maintsync::db::invalid_state),
        help("Only failed or held changes can be retried or resolved.")
    )]
    InvalidState {
        id: String,
        status: String,
        expected: String,
    },

    #[error("Invalid data: {message}")]
    #[diagnostic(code(maintsync::db::invalid_data))]
    InvalidData { message: String },

    #[error("Database error: {message}")]
    #[diagnostic(code(maintsync::db::database_error))]
    Database { message: String },

    #[error("Migration error: {message}")]
    #[diagnostic(code(maintsync::db::migration_error))]
    Migration { message: String },

    #[error("Connection error: {message}")]
    #[diagnostic(code(maintsync::db::connection_error))]
    Connection { message: String },
}

impl From<sqlx::Error> for DbError {
    fn from(e: sqlx::Error) -> Self {
        DbError::Database {
            message: e.to_string(),
        }
    }
}

/// Result type for storage operations.
pub type DbResult<T> = Result<T, DbError>;
