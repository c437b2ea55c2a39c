//! Error taxonomy for the session service
//!
//! Every failure a client can observe is one of these variants. The REST layer
//! turns them into status codes, the push channel into `{success: false, reason}`
//! acknowledgements.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use super::protocol::{ApiError, ApiErrorCode, SessionId};

/// Errors produced by session operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("{0}")]
    Validation(String),

    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error("Maximum sessions reached")]
    CapacityExceeded { max: usize },

    #[error("Stale update: timestamp {incoming} is not newer than {stored}")]
    Stale { stored: i64, incoming: i64 },

    #[error("Connection is missing sessionId or userId")]
    MissingIdentity,
}

impl SessionError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Short machine-readable reason used in push-channel acknowledgements
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "notfound",
            Self::CapacityExceeded { .. } => "capacity",
            Self::Stale { .. } => "stale",
            Self::MissingIdentity => "missing_identity",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::CapacityExceeded { .. } | Self::MissingIdentity => {
                StatusCode::BAD_REQUEST
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Stale { .. } => StatusCode::CONFLICT,
        }
    }

    fn api_code(&self) -> ApiErrorCode {
        match self {
            Self::Validation(_) | Self::MissingIdentity => ApiErrorCode::BadRequest,
            Self::NotFound(_) => ApiErrorCode::SessionNotFound,
            Self::CapacityExceeded { .. } => ApiErrorCode::CapacityExceeded,
            Self::Stale { .. } => ApiErrorCode::Stale,
        }
    }
}

impl From<&SessionError> for ApiError {
    fn from(err: &SessionError) -> Self {
        ApiError {
            error: err.to_string(),
            code: err.api_code(),
        }
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(ApiError::from(&self))).into_response()
    }
}
