use miette::Diagnostic;
use thiserror::Error;

use crate::api::ApiError;
use crate::db::DbError;
use crate::sync::SyncError;

#[derive(Error, Diagnostic, Debug)]
pub enum CliError {
    #[error("Failed to reach the maintenance server: {message}")]
    #[diagnostic(
        code(maintsync::cli::connection_failed),
        help(
            "Is the server running? Pass --server-url or set MSYNC_SERVER_URL to point to the correct server."
        )
    )]
    ConnectionFailed { message: String },

    #[error("Server error ({status}): {message}")]
    #[diagnostic(code(maintsync::cli::api_error))]
    ApiError { status: u16, message: String },

    #[error("Invalid {what}: {message}")]
    #[diagnostic(code(maintsync::cli::invalid_input))]
    InvalidInput { what: String, message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] DbError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Sync(SyncError),

    #[error("Failed to prepare data directory: {0}")]
    #[diagnostic(code(maintsync::cli::io))]
    Io(#[from] std::io::Error),

    #[error("Failed to render output: {0}")]
    #[diagnostic(code(maintsync::cli::output))]
    Output(#[from] serde_json::Error),
}

impl CliError {
    pub fn invalid(what: impl Into<String>, message: impl Into<String>) -> Self {
        CliError::InvalidInput {
            what: what.into(),
            message: message.into(),
        }
    }
}

impl From<SyncError> for CliError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Storage(db) => CliError::Storage(db),
            SyncError::TransientNetwork { message } => CliError::ConnectionFailed { message },
            SyncError::ServerRejection4xx { status, message }
            | SyncError::ServerRejection5xx { status, message } => {
                CliError::ApiError { status, message }
            }
            other => CliError::Sync(other),
        }
    }
}

impl From<ApiError> for CliError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Status { status, message } => CliError::ApiError { status, message },
            ApiError::InvalidUrl { url } => CliError::invalid("server URL", url),
            other => CliError::ConnectionFailed {
                message: other.to_string(),
            },
        }
    }
}

pub type CliResult<T> = Result<T, CliError>;
