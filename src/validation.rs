use axum::extract::{FromRequest, Request};
use axum::{async_trait, Json};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use validator::Validate;

use crate::error::Error;

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CreateUserRequest {
    #[validate(length(min = 2, max = 100, message = "Name must be between 2 and 100 characters"))]
    pub name: String,
    #[validate(
        email(message = "Not a valid email address"),
        length(max = 255, message = "Email must be at most 255 characters")
    )]
    pub email: String,
    #[validate(length(min = 6, max = 128, message = "Password must be between 6 and 128 characters"))]
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct UpdateUserRequest {
    #[validate(length(min = 2, max = 100, message = "Name must be between 2 and 100 characters"))]
    pub name: Option<String>,
    #[validate(
        email(message = "Not a valid email address"),
        length(max = 255, message = "Email must be at most 255 characters")
    )]
    pub email: Option<String>,
}

impl UpdateUserRequest {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none()
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(email(message = "Not a valid email address"))]
    pub email: String,
    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchQuery {
    pub name: Option<String>,
}

#[derive(Debug, Validate)]
struct SearchTerm {
    #[validate(length(min = 1, max = 100, message = "Search term must be between 1 and 100 characters"))]
    name: String,
}

/// Request validation utilities
pub struct RequestValidator;

impl RequestValidator {
    /// Parses a path segment into a positive user id
    pub fn validate_user_id(raw: &str) -> Result<i64, Error> {
        match raw.trim().parse::<i64>() {
            Ok(id) if id > 0 => Ok(id),
            _ => Err(Error::InvalidRequest(
                "Invalid user ID: must be a positive integer".to_string(),
            )),
        }
    }

    /// Extracts the search term, rejecting missing or out-of-range values
    pub fn validate_search(query: &SearchQuery) -> Result<String, Error> {
        let name = query
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                Error::InvalidRequest("Query parameter 'name' is required".to_string())
            })?;

        let term = SearchTerm {
            name: name.to_string(),
        };
        term.validate()?;
        Ok(term.name)
    }

    pub fn validate_update(payload: &UpdateUserRequest) -> Result<(), Error> {
        if payload.is_empty() {
            return Err(Error::InvalidRequest(
                "No valid fields to update".to_string(),
            ));
        }
        payload.validate()?;
        Ok(())
    }
}

/// JSON body extractor that runs `validator` rules and reports failures in
/// the error envelope instead of axum's plain-text rejection
#[derive(Debug, Clone)]
pub struct ValidJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| Error::InvalidRequest(rejection.body_text()))?;
        value.validate()?;
        Ok(ValidJson(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::header::CONTENT_TYPE;

    #[test]
    fn test_validate_user_id() {
        assert_eq!(RequestValidator::validate_user_id("42").unwrap(), 42);
        assert!(RequestValidator::validate_user_id("0").is_err());
        assert!(RequestValidator::validate_user_id("-3").is_err());
        assert!(RequestValidator::validate_user_id("abc").is_err());
    }

    #[test]
    fn test_create_user_limits() {
        let valid = CreateUserRequest {
            name: "Al".to_string(),
            email: "al@example.com".to_string(),
            password: "secret".to_string(),
        };
        assert!(valid.validate().is_ok());

        let short_name = CreateUserRequest {
            name: "A".to_string(),
            ..valid.clone()
        };
        assert!(short_name.validate().is_err());

        let bad_email = CreateUserRequest {
            email: "not-an-email".to_string(),
            ..valid.clone()
        };
        assert!(bad_email.validate().is_err());

        let short_password = CreateUserRequest {
            password: "12345".to_string(),
            ..valid
        };
        assert!(short_password.validate().is_err());
    }

    #[test]
    fn test_update_requires_a_field() {
        let err = RequestValidator::validate_update(&UpdateUserRequest::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(msg) if msg == "No valid fields to update"));

        let rename = UpdateUserRequest {
            name: Some("New Name".to_string()),
            email: None,
        };
        assert!(RequestValidator::validate_update(&rename).is_ok());
    }

    #[test]
    fn test_search_term() {
        let missing = SearchQuery { name: None };
        assert!(RequestValidator::validate_search(&missing).is_err());

        let too_long = SearchQuery {
            name: Some("x".repeat(101)),
        };
        assert!(matches!(
            RequestValidator::validate_search(&too_long),
            Err(Error::Validation(_))
        ));

        let ok = SearchQuery {
            name: Some("Jo".to_string()),
        };
        assert_eq!(RequestValidator::validate_search(&ok).unwrap(), "Jo");
    }

    #[tokio::test]
    async fn test_valid_json_rejects_unknown_fields() {
        let request = axum::http::Request::builder()
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"name":"Jo","role":"admin"}"#))
            .unwrap();

        let result = ValidJson::<UpdateUserRequest>::from_request(request, &()).await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_valid_json_runs_validation() {
        let request = axum::http::Request::builder()
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"email":"bob@example.com","password":""}"#))
            .unwrap();

        let result = ValidJson::<LoginRequest>::from_request(request, &()).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
