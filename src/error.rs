use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;
use validator::ValidationErrors;

use crate::{dao::storage::StorageError, state::trivia::InvalidTransition};

/// Errors that can occur in service layer operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A row the operation requires does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Duplicate vote or concurrent activation race.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Network failure or timeout; the caller may try again.
    #[error("storage unavailable")]
    Transient(#[source] StorageError),
    /// Store unreachable: real-time disabled, manual refresh only.
    #[error("storage unreachable: {0}")]
    Fatal(String),
    /// Invalid input provided by the client.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Operation cannot be performed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// A multi-step lifecycle operation stopped midway.
    #[error("{operation} failed at `{failed}` after {completed:?}")]
    PartialLifecycle {
        /// Name of the lifecycle operation.
        operation: &'static str,
        /// Steps that reached the store, in order.
        completed: Vec<String>,
        /// Step that failed.
        failed: String,
        /// Failure of that step.
        #[source]
        source: Box<ServiceError>,
    },
    /// The store acknowledged a delete but the row is still there.
    #[error("delete of {0} was not applied by the store")]
    DeleteNotApplied(Uuid),
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NoRows { table } => ServiceError::NotFound(format!("no rows in `{table}`")),
            StorageError::Conflict { .. } => ServiceError::Conflict(err.to_string()),
            StorageError::Malformed { .. } | StorageError::Rejected { .. } => {
                ServiceError::InvalidState(err.to_string())
            }
            StorageError::Unavailable { .. } => ServiceError::Transient(err),
        }
    }
}

impl From<InvalidTransition> for ServiceError {
    fn from(err: InvalidTransition) -> Self {
        ServiceError::InvalidState(err.to_string())
    }
}

impl From<ValidationErrors> for AppError {
    fn from(err: ValidationErrors) -> Self {
        AppError::BadRequest(format!("validation failed: {}", err))
    }
}

/// Application-level errors that are converted to HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad request with invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Requested resource not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Conflict with current state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Service unavailable or degraded.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    /// Lifecycle operation that stopped midway; carries its step journal.
    #[error("{message}")]
    PartialFailure {
        message: String,
        completed: Vec<String>,
        failed: String,
    },
    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotFound(message) => AppError::NotFound(message),
            ServiceError::Conflict(message) => AppError::Conflict(message),
            ServiceError::Transient(source) => AppError::ServiceUnavailable(source.to_string()),
            ServiceError::Fatal(message) => AppError::ServiceUnavailable(message),
            ServiceError::InvalidInput(message) => AppError::BadRequest(message),
            ServiceError::InvalidState(message) => AppError::Conflict(message),
            ServiceError::PartialLifecycle {
                operation,
                completed,
                failed,
                source,
            } => {
                let message = format!("{operation} failed at `{failed}`: {source}");
                AppError::PartialFailure {
                    message,
                    completed,
                    failed,
                }
            }
            err @ ServiceError::DeleteNotApplied(_) => AppError::Internal(err.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failed: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::PartialFailure { .. } => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let payload = match self {
            AppError::PartialFailure {
                message,
                completed,
                failed,
            } => ErrorBody {
                message,
                completed: Some(completed),
                failed: Some(failed),
            },
            other => ErrorBody {
                message: other.to_string(),
                completed: None,
                failed: None,
            },
        };

        (status, Json(payload)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn storage_errors_map_onto_the_taxonomy() {
        let transient = StorageError::unavailable("timeout".into(), io::Error::other("timeout"));
        assert!(matches!(
            ServiceError::from(transient),
            ServiceError::Transient(_)
        ));
        assert!(matches!(
            ServiceError::from(StorageError::NoRows { table: "rooms" }),
            ServiceError::NotFound(_)
        ));
        assert!(matches!(
            ServiceError::from(StorageError::Conflict {
                table: "rooms",
                message: "code taken".into(),
            }),
            ServiceError::Conflict(_)
        ));
    }

    #[test]
    fn partial_lifecycle_keeps_its_journal() {
        let err = ServiceError::PartialLifecycle {
            operation: "start_activity",
            completed: vec!["deactivate_all".into()],
            failed: "activate".into(),
            source: Box::new(ServiceError::Fatal("offline".into())),
        };
        match AppError::from(err) {
            AppError::PartialFailure {
                completed, failed, ..
            } => {
                assert_eq!(completed, vec!["deactivate_all".to_string()]);
                assert_eq!(failed, "activate");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
