//! Centralized error handling for MarginVault
//!
//! `LifecycleError` is the typed domain error returned by every lifecycle
//! operation; callers and tests match on its variants. `ApiError` maps
//! domain errors onto HTTP status codes and JSON error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::external::ExternalError;
use crate::lifecycle::model::FlowType;

/// Domain error for lifecycle operations
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// Requested status change is not in the transition table for this
    /// entity's current status and flow variant
    #[error("invalid status transition from {from} to {to} under {flow} flow")]
    InvalidTransition {
        from: String,
        to: String,
        flow: FlowType,
    },

    /// The line is mid loan-package creation; retry once the state settles
    #[error("loan package creation already in progress")]
    AlreadyCreating,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("offer has expired")]
    OfferExpired,

    #[error("offer interest does not belong to the acting investor")]
    NotOwner,

    #[error("offer interests must belong to a single offer")]
    MixedOffers,

    #[error("derivative requests must be confirmed offline")]
    DerivativeMustBeOffline,

    #[error("invalid loan package ids")]
    InvalidLoanPackageIds,

    #[error("invalid flow type for this operation")]
    InvalidFlowType,

    #[error("submission sheet is not approved")]
    SubmissionNotApproved,

    #[error("a submission sheet is already open for this request")]
    SubmissionAlreadyOpen,

    #[error("upstream service failure: {0}")]
    Upstream(#[from] ExternalError),

    #[error("background task failed: {0}")]
    TaskFailed(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for LifecycleError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => LifecycleError::NotFound("record"),
            other => LifecycleError::Database(other),
        }
    }
}

/// API error type with HTTP status code mapping
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unprocessable entity: {0}")]
    UnprocessableEntity(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),
}

/// JSON error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

/// Error details in the response
#[derive(Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    /// Get the error code string
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::UnprocessableEntity(_) => "UNPROCESSABLE_ENTITY",
            ApiError::InternalError(_) => "INTERNAL_ERROR",
            ApiError::DatabaseError(_) => "DATABASE_ERROR",
            ApiError::ExternalServiceError(_) => "EXTERNAL_SERVICE_ERROR",
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::UnprocessableEntity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        // Log server errors
        match &self {
            ApiError::InternalError(_) | ApiError::DatabaseError(_) => {
                tracing::error!(error = %message, code = %error_code, "Server error occurred");
            }
            _ => {
                tracing::debug!(error = %message, code = %error_code, "Client error occurred");
            }
        }

        let body = ErrorResponse {
            error: ErrorDetails {
                code: error_code.to_string(),
                message,
                details: None,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::NotFound(what) => ApiError::NotFound(what.to_string()),
            LifecycleError::InvalidTransition { .. }
            | LifecycleError::InvalidFlowType
            | LifecycleError::DerivativeMustBeOffline
            | LifecycleError::SubmissionNotApproved => {
                ApiError::UnprocessableEntity(err.to_string())
            }
            LifecycleError::AlreadyCreating
            | LifecycleError::OfferExpired
            | LifecycleError::MixedOffers
            | LifecycleError::SubmissionAlreadyOpen => ApiError::Conflict(err.to_string()),
            LifecycleError::NotOwner => ApiError::Forbidden(err.to_string()),
            LifecycleError::InvalidLoanPackageIds => ApiError::BadRequest(err.to_string()),
            LifecycleError::Upstream(inner) => ApiError::ExternalServiceError(inner.to_string()),
            LifecycleError::Database(inner) => ApiError::DatabaseError(inner.to_string()),
            LifecycleError::TaskFailed(msg) => ApiError::InternalError(msg),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound("Resource not found".to_string()),
            _ => ApiError::DatabaseError(err.to_string()),
        }
    }
}

/// Result type alias using ApiError
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ApiError::NotFound("test".to_string()).error_code(),
            "NOT_FOUND"
        );
        assert_eq!(
            ApiError::Conflict("test".to_string()).error_code(),
            "CONFLICT"
        );
        assert_eq!(
            ApiError::ExternalServiceError("test".to_string()).error_code(),
            "EXTERNAL_SERVICE_ERROR"
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::NotFound("test".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::UnprocessableEntity("test".to_string()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::ExternalServiceError("test".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_lifecycle_error_mapping() {
        assert!(matches!(
            ApiError::from(LifecycleError::AlreadyCreating),
            ApiError::Conflict(_)
        ));
        assert!(matches!(
            ApiError::from(LifecycleError::NotOwner),
            ApiError::Forbidden(_)
        ));
        assert!(matches!(
            ApiError::from(LifecycleError::InvalidLoanPackageIds),
            ApiError::BadRequest(_)
        ));
        assert!(matches!(
            ApiError::from(LifecycleError::DerivativeMustBeOffline),
            ApiError::UnprocessableEntity(_)
        ));
        assert!(matches!(
            ApiError::from(LifecycleError::SubmissionAlreadyOpen),
            ApiError::Conflict(_)
        ));
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        assert!(matches!(
            LifecycleError::from(sqlx::Error::RowNotFound),
            LifecycleError::NotFound(_)
        ));
    }
}
