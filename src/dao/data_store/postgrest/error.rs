//! Error types shared by the PostgREST storage implementation.

use reqwest::StatusCode;
use thiserror::Error;

use crate::dao::storage::StorageError;

/// Convenient result alias returning [`PostgrestError`] failures.
pub type PostgrestResult<T> = Result<T, PostgrestError>;

/// PostgREST code for "no rows returned" on singular requests.
const NO_ROWS_CODE: &str = "PGRST116";
/// Postgres unique violation.
const UNIQUE_VIOLATION_CODE: &str = "23505";

/// Failures that can occur while interacting with PostgREST.
#[derive(Debug, Error)]
pub enum PostgrestError {
    /// Required environment variable is missing.
    #[error("missing PostgREST environment variable `{var}`")]
    MissingEnvVar { var: &'static str },
    /// Building the HTTP client failed (invalid TLS setup, etc).
    #[error("failed to build PostgREST client")]
    ClientBuilder {
        #[source]
        source: reqwest::Error,
    },
    /// A request could not be sent or its response could not be read.
    #[error("failed to send PostgREST request to `{path}`")]
    RequestSend {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    /// PostgREST answered with an error payload.
    #[error("PostgREST returned {status} for `{path}`: {message}")]
    RequestStatus {
        path: String,
        status: StatusCode,
        code: Option<String>,
        message: String,
    },
    /// Response payload could not be parsed into rows.
    #[error("failed to decode PostgREST response for `{path}`")]
    DecodeResponse {
        path: String,
        #[source]
        source: reqwest::Error,
    },
}

impl PostgrestError {
    /// Translate into the backend independent error for `table` and `operation`.
    pub fn into_storage(self, table: &'static str, operation: &'static str) -> StorageError {
        match self {
            PostgrestError::RequestStatus { code, .. } if code.as_deref() == Some(NO_ROWS_CODE) => {
                StorageError::NoRows { table }
            }
            PostgrestError::RequestStatus {
                status, message, code, ..
            } if status == StatusCode::CONFLICT
                || code.as_deref() == Some(UNIQUE_VIOLATION_CODE) =>
            {
                StorageError::Conflict { table, message }
            }
            PostgrestError::RequestStatus {
                status, message, ..
            } if status.is_client_error() => StorageError::Rejected {
                table,
                operation,
                message,
            },
            other => StorageError::unavailable(format!("{operation} on `{table}` failed"), other),
        }
    }
}
