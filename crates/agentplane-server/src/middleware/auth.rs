//! Authentication middleware.
//!
//! Every request carries an `X-API-Key` header identifying the caller. The
//! key is hashed and resolved to a user through the metadata store; the
//! clear key is never persisted. Handlers compare the resolved user against
//! the `{user}` path segment.

use agentplane_core::types::api_key_digest;
use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

/// Authentication context extracted from the request
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
}

impl AuthContext {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

/// Authentication error
#[derive(Debug)]
pub enum AuthError {
    MissingKey,
    InvalidKey,
    StoreUnavailable,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, error, code) = match self {
            AuthError::MissingKey => (
                StatusCode::UNAUTHORIZED,
                "X-API-Key header is required",
                "MISSING_KEY",
            ),
            AuthError::InvalidKey => (StatusCode::UNAUTHORIZED, "Invalid API key", "INVALID_KEY"),
            AuthError::StoreUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Metadata store unavailable",
                "STORAGE_UNAVAILABLE",
            ),
        };
        let body = Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        });
        (status, body).into_response()
    }
}

/// Authentication middleware for axum
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let key = request
        .headers()
        .get("X-API-Key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or(AuthError::MissingKey)?;

    let user = state
        .store
        .get_user_by_api_key_digest(&api_key_digest(key))
        .map_err(|_| AuthError::StoreUnavailable)?
        .ok_or(AuthError::InvalidKey)?;

    request.extensions_mut().insert(AuthContext {
        user_id: user.user_id,
    });
    Ok(next.run(request).await)
}
