use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::response::unix_timestamp;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after: u64 },

    #[error("Too many failed attempts")]
    Blocked { retry_after: u64 },

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Database connection ceiling of {0} reached")]
    ResourceExhausted(usize),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        Error::Validation(errors.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub message: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    pub timestamp: u64,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            success: false,
            error: error.to_string(),
            message: message.to_string(),
            code,
            retry_after: None,
            timestamp: unix_timestamp(),
        }
    }

    fn retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Map an error to its public shape. Storage and internal failures are
    /// reported generically; their detail only goes to the log.
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::InvalidRequest(msg) => Self::new("bad_request", msg, 400),
            Error::Validation(msg) => Self::new("validation_error", msg, 400),
            Error::RateLimitExceeded { retry_after } => Self::new(
                "rate_limit_exceeded",
                "Rate limit exceeded. Please try again later.",
                429,
            )
            .retry_after(*retry_after),
            Error::Blocked { retry_after } => Self::new(
                "too_many_failures",
                "Too many failed attempts. Please try again later.",
                429,
            )
            .retry_after(*retry_after),
            Error::InvalidCredentials => {
                Self::new("unauthorized", "Invalid email or password", 401)
            }
            Error::NotFound(what) => Self::new("not_found", &format!("{} not found", what), 404),
            Error::Conflict(msg) => Self::new("conflict", msg, 409),
            Error::ResourceExhausted(_) => Self::new(
                "service_unavailable",
                "Service temporarily unavailable",
                503,
            ),
            Error::Transaction(_)
            | Error::Database(_)
            | Error::Configuration(_)
            | Error::Internal(_) => Self::new("internal_error", "Internal server error", 500),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let retry_after = body.retry_after;
        let mut response = (status, Json(body)).into_response();
        if let Some(seconds) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_detail_is_not_exposed() {
        let err = Error::Transaction("disk I/O error at page 12".to_string());
        let body = ErrorResponse::from_error(&err);
        assert_eq!(body.code, 500);
        assert_eq!(body.message, "Internal server error");
    }

    #[test]
    fn test_rate_limit_response_carries_retry_hint() {
        let response = Error::RateLimitExceeded { retry_after: 60 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (Error::Validation("x".into()), 400),
            (Error::InvalidCredentials, 401),
            (Error::NotFound("User".into()), 404),
            (Error::Conflict("Email already exists".into()), 409),
            (Error::ResourceExhausted(10), 503),
        ];
        for (err, code) in cases {
            assert_eq!(ErrorResponse::from_error(&err).code, code);
        }
    }
}
