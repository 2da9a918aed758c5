use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::Error;
use crate::governance::RequestGovernor;
use crate::middleware::ClientId;
use crate::response::ApiResponse;
use crate::users::UserStore;
use crate::validation::{
    CreateUserRequest, LoginRequest, RequestValidator, SearchQuery, UpdateUserRequest, ValidJson,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub governor: Arc<RequestGovernor>,
    pub users: UserStore,
    pub health_timeout: Duration,
}

/// Service banner
pub async fn index() -> impl IntoResponse {
    ApiResponse::ok(
        json!({ "status": "healthy", "service": "User Management API" }),
        "Service is running",
    )
}

/// Detailed health check; 503 when any probe fails or the run times out
pub async fn health_check(State(state): State<AppState>) -> Result<impl IntoResponse, Error> {
    let governor = state.governor.clone();
    let run = tokio::task::spawn_blocking(move || governor.health());

    let report = match tokio::time::timeout(state.health_timeout, run).await {
        Ok(joined) => joined.map_err(|e| Error::Internal(format!("health task failed: {}", e)))?,
        Err(_) => {
            warn!(timeout_secs = state.health_timeout.as_secs(), "Health check timed out");
            return Ok(ApiResponse::<Value>::with_status(
                StatusCode::SERVICE_UNAVAILABLE,
                None,
                "Health check timed out",
            ));
        }
    };

    let metrics = state.governor.metrics_summary();
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let message = if report.is_healthy() {
        "System is healthy"
    } else {
        "System is unhealthy"
    };

    Ok(ApiResponse::with_status(
        status,
        Some(json!({
            "health": report,
            "metrics": {
                "total_requests": metrics.total_requests,
                "active_connections": metrics.active_connections,
            }
        })),
        message,
    ))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    ApiResponse::ok(state.governor.metrics_summary(), "Metrics retrieved")
}

pub async fn list_users(State(state): State<AppState>) -> Result<impl IntoResponse, Error> {
    let users = state.users.list().await?;
    let count = users.len();

    Ok(ApiResponse::ok(
        json!({ "users": users, "count": count }),
        format!("Retrieved {} users", count),
    ))
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let id = RequestValidator::validate_user_id(&user_id)?;
    let user = state
        .users
        .get(id)
        .await?
        .ok_or_else(|| Error::NotFound("User".to_string()))?;

    Ok(ApiResponse::ok(json!({ "user": user }), "User retrieved successfully"))
}

pub async fn create_user(
    State(state): State<AppState>,
    ValidJson(payload): ValidJson<CreateUserRequest>,
) -> Result<impl IntoResponse, Error> {
    let user = state.users.create(payload).await?;
    info!(user_id = user.id, "User created");

    Ok(ApiResponse::created(json!({ "user": user }), "User created successfully"))
}

pub async fn update_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    ValidJson(payload): ValidJson<UpdateUserRequest>,
) -> Result<impl IntoResponse, Error> {
    let id = RequestValidator::validate_user_id(&user_id)?;
    RequestValidator::validate_update(&payload)?;

    let user = state
        .users
        .update(id, payload)
        .await?
        .ok_or_else(|| Error::NotFound("User".to_string()))?;

    Ok(ApiResponse::ok(json!({ "user": user }), "User updated successfully"))
}

pub async fn delete_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let id = RequestValidator::validate_user_id(&user_id)?;
    if !state.users.delete(id).await? {
        return Err(Error::NotFound("User".to_string()));
    }
    info!(user_id = id, "User deactivated");

    Ok(ApiResponse::message("User deleted successfully"))
}

pub async fn search_users(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse, Error> {
    let term = RequestValidator::validate_search(&query)?;
    let users = state.users.search(&term).await?;
    let count = users.len();

    Ok(ApiResponse::ok(
        json!({ "users": users, "count": count }),
        format!("Found {} users matching '{}'", count, term),
    ))
}

/// Verify credentials. Failures feed the lockout tracker for the caller's
/// address; the token is an opaque random value.
pub async fn login(
    State(state): State<AppState>,
    Extension(client): Extension<ClientId>,
    ValidJson(payload): ValidJson<LoginRequest>,
) -> Result<impl IntoResponse, Error> {
    let user = match state
        .users
        .authenticate(&payload.email, &payload.password)
        .await?
    {
        Some(user) => user,
        None => {
            let outcome = state.governor.report_auth_failure(client.as_str());
            info!(client = %client.as_str(), blocked = outcome.blocked, "Login failed");
            return Err(Error::InvalidCredentials);
        }
    };

    state.governor.report_auth_success(client.as_str());
    info!(user_id = user.id, "Login successful");

    Ok(ApiResponse::ok(
        json!({
            "user": { "id": user.id, "name": user.name, "email": user.email },
            "token": uuid::Uuid::new_v4().to_string(),
        }),
        "Login successful",
    ))
}

pub async fn not_found() -> Error {
    Error::NotFound("Endpoint".to_string())
}
