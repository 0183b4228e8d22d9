//! Error types surfaced by the engine.
//!
//! Domain-rule violations are returned verbatim to callers with their
//! specific reason. Provider failures never reach this type; they are
//! absorbed inside [`crate::providers`].

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Coupon, store or claim does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The user already holds a claim on this coupon.
    #[error("coupon already obtained")]
    AlreadyObtained,

    /// The claim has already been redeemed.
    #[error("coupon already used")]
    AlreadyUsed,

    /// The coupon is past its end time or no longer active.
    #[error("coupon has expired")]
    Expired,

    /// The proximity gate rejected the claim.
    #[error("must be within {radius_m:.0}m of the store (currently {distance_m:.1}m)")]
    TooFar { distance_m: f64, radius_m: f64 },

    /// Malformed coordinates, radius or identifiers.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The caller did not identify themselves.
    #[error("missing user identity")]
    Unauthenticated,

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::AlreadyObtained
            | EngineError::AlreadyUsed
            | EngineError::Expired
            | EngineError::TooFar { .. }
            | EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::Unauthenticated => StatusCode::UNAUTHORIZED,
            EngineError::Storage(_) | EngineError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let message = if status.is_server_error() {
            tracing::error!(error = %self, "Internal server error");
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            EngineError::NotFound("coupon".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            EngineError::AlreadyObtained.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(EngineError::Expired.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            EngineError::Unauthenticated.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            EngineError::Internal("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_too_far_message_includes_distance() {
        let err = EngineError::TooFar {
            distance_m: 21.04,
            radius_m: 20.0,
        };
        let message = err.to_string();
        assert!(message.contains("20m"));
        assert!(message.contains("21.0m"));
    }
}
