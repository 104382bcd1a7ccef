//! User and global-credential routes.

use axum::{
    extract::{Path, State},
    routing::{get, put},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::ApiError;
use crate::middleware::AuthContext;
use crate::routes::authorize;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/users", get(list_users))
        .route(
            "/users/:user_id/github-key",
            put(update_github_key)
                .get(check_github_key)
                .delete(delete_github_key),
        )
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: String,
    pub name: String,
}

/// List known users
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    Extension(_auth): Extension<AuthContext>,
) -> Result<Json<Vec<UserResponse>>, ApiError> {
    let users = state.store.list_users()?;
    Ok(Json(
        users
            .into_iter()
            .map(|u| UserResponse {
                id: u.user_id,
                name: u.name,
            })
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct GithubKeyRequest {
    pub github_key: Option<String>,
}

/// Set or remove the user's global Git token
pub async fn update_github_key(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(user_id): Path<String>,
    Json(req): Json<GithubKeyRequest>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;

    let removing = req.github_key.is_none();
    state
        .engine
        .update_user_global_token(&user_id, req.github_key)
        .await?;

    let message = if removing {
        "Global GitHub key removed successfully"
    } else {
        "Global GitHub key set successfully"
    };
    Ok(Json(json!({ "message": message })))
}

/// Whether a global Git token is set
pub async fn check_github_key(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;

    let user = state
        .store
        .get_user(&user_id)?
        .ok_or_else(|| agentplane_core::Error::UserNotFound(user_id.clone()))?;
    Ok(Json(json!({
        "github_key_set": user.github_secret_name.is_some()
    })))
}

/// Remove the user's global Git token
pub async fn delete_github_key(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;

    state.engine.update_user_global_token(&user_id, None).await?;
    Ok(Json(
        json!({ "message": "Global GitHub key removed successfully" }),
    ))
}
