use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Malformed payload")]
    MalformedPayload,

    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    InternalError(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// A change log record that does not look like a counter.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Missing field {0}")]
    MissingField(&'static str),

    #[error("Invalid count {0:?}")]
    InvalidCount(String),
}

/// Why a subscriber could not take an event.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Subscriber sink closed")]
    Closed,

    #[error("Subscriber sink full")]
    Full,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::MalformedPayload => StatusCode::BAD_REQUEST,
            AppError::StoreUnavailable(StoreError::Overflow(_)) => StatusCode::CONFLICT,
            AppError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Config(_) | AppError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_message_not_repeated() {
        let error = AppError::from(StoreError::Unavailable("connection refused".to_string()));

        assert_eq!(error.to_string(), "Store unavailable: connection refused");
    }

    #[test]
    fn test_status_codes() {
        let unavailable = AppError::from(StoreError::Unavailable("down".to_string()));
        assert_eq!(
            unavailable.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );

        let overflow = AppError::from(StoreError::Overflow("max".into()));
        assert_eq!(overflow.into_response().status(), StatusCode::CONFLICT);

        assert_eq!(
            AppError::MalformedPayload.into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }
}
