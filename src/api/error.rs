use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum ApiError {
    #[error("Failed to connect to the maintenance server")]
    #[diagnostic(
        code(maintsync::api::connection_failed),
        help(
            "Is the server reachable? Pass --server-url or set MSYNC_SERVER_URL to point to the correct server."
        )
    )]
    ConnectionFailed {
        #[source]
        source: reqwest::Error,
    },

    #[error("Invalid response from server: {message}")]
    #[diagnostic(
        code(maintsync::api::invalid_response),
        help(
            "The server returned data in an unexpected format. This might indicate a version mismatch."
        )
    )]
    InvalidResponse { message: String },

    #[error("Server error ({status}): {message}")]
    #[diagnostic(code(maintsync::api::status))]
    Status { status: u16, message: String },

    #[error("Invalid server URL: {url}")]
    #[diagnostic(code(maintsync::api::invalid_url))]
    InvalidUrl { url: String },
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_request() {
            ApiError::ConnectionFailed { source: e }
        } else {
            ApiError::InvalidResponse {
                message: e.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::InvalidResponse {
            message: e.to_string(),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
