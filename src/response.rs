use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Success envelope shared by every endpoint
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    #[serde(skip)]
    status: StatusCode,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    pub timestamp: u64,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::OK, Some(data), message)
    }

    pub fn created(data: T, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CREATED, Some(data), message)
    }

    pub fn with_status(status: StatusCode, data: Option<T>, message: impl Into<String>) -> Self {
        Self {
            status,
            success: status.is_success(),
            message: message.into(),
            data,
            timestamp: unix_timestamp(),
        }
    }
}

impl ApiResponse<()> {
    pub fn message(message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::OK, None, message)
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_serialization() {
        let response = ApiResponse::ok(serde_json::json!({ "count": 2 }), "Retrieved 2 users");
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["count"], 2);
        assert!(json.get("status").is_none());
    }

    #[test]
    fn test_message_only_envelope_omits_data() {
        let json = serde_json::to_value(ApiResponse::message("User deleted successfully")).unwrap();
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_unhealthy_status_is_not_success() {
        let response = ApiResponse::with_status(StatusCode::SERVICE_UNAVAILABLE, Some(1), "down");
        assert!(!response.success);
        assert_eq!(response.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
