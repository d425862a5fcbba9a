///! Standardized error handling for API responses
///!
///! Every response body carries an `error_msg` string; it is empty on success.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

/// Standard success envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
    pub error_msg: String,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            data,
            error_msg: String::new(),
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Standard API error response format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status code
    pub status: u16,

    /// Error code for programmatic handling
    pub error: String,

    /// Human-readable error message
    pub error_msg: String,

    /// Optional detailed error information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    /// Timestamp when error occurred
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(status: u16, error: impl Into<String>, error_msg: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            error_msg: error_msg.into(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// API error types with standardized responses
#[derive(Debug)]
pub enum ApiError {
    /// 500 Internal Server Error
    Internal(String),

    /// 404 Not Found
    NotFound(String),

    /// 400 Bad Request
    BadRequest(String),

    /// 409 Conflict
    Conflict(String),

    /// 503 Service Unavailable
    ServiceUnavailable(String),

    /// 504 Gateway Timeout
    Timeout(String),
}

impl ApiError {
    /// Convert error to ErrorResponse
    pub fn to_error_response(&self) -> ErrorResponse {
        match self {
            ApiError::Internal(msg) => {
                error!("Internal API error: {}", msg);
                ErrorResponse::new(500, "INTERNAL_ERROR", "An internal server error occurred")
                    .with_details(msg)
            }
            ApiError::NotFound(msg) => ErrorResponse::new(404, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => ErrorResponse::new(400, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => ErrorResponse::new(409, "CONFLICT", msg),
            ApiError::ServiceUnavailable(msg) => {
                ErrorResponse::new(503, "SERVICE_UNAVAILABLE", msg)
            }
            ApiError::Timeout(msg) => ErrorResponse::new(504, "TIMEOUT", msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_response = self.to_error_response();
        let status_code = StatusCode::from_u16(error_response.status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        (status_code, Json(error_response)).into_response()
    }
}

impl From<shoal_common::Error> for ApiError {
    fn from(err: shoal_common::Error) -> Self {
        use shoal_common::Error;

        let msg = err.to_string();
        match err {
            Error::ClusterNotFound(_)
            | Error::NodeNotFound(_)
            | Error::WorkflowNotFound(_) => ApiError::NotFound(msg),
            // Admission-time dependency failures are the caller's to fix
            Error::HostNotFound(_)
            | Error::AgentNotInstalled(_)
            | Error::HostOffline(_)
            | Error::ClusterNameEmpty
            | Error::Validation(_)
            | Error::InvalidTransition(_) => ApiError::BadRequest(msg),
            Error::ClusterNameDuplicate(_)
            | Error::NodeAlreadyExists { .. }
            | Error::ClusterBusy(..)
            | Error::OperationInProgress(_) => ApiError::Conflict(msg),
            Error::Timeout(_) => ApiError::Timeout(msg),
            Error::Dispatch(_) | Error::Installer(_) => ApiError::ServiceUnavailable(msg),
            Error::Database(_) | Error::System(_) | Error::Io(_) => ApiError::Internal(msg),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        error!("Database error: {}", err);
        ApiError::Internal("Database error occurred".to_string())
    }
}
