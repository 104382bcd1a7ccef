//! Session management routes.

use axum::{
    extract::{Path, State},
    routing::get,
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::ApiError;
use crate::middleware::AuthContext;
use crate::routes::{authorize, owned_project};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/users/:user_id/projects/:project_id/sessions",
            get(list_sessions).post(create_session),
        )
        .route(
            "/users/:user_id/projects/:project_id/sessions/:session_id",
            axum::routing::delete(delete_session),
        )
        .route(
            "/users/:user_id/projects/:project_id/sessions/:session_id/messages",
            get(session_messages),
        )
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub name: Option<String>,
}

/// Create a session against the running agent
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((user_id, project_id)): Path<(String, String)>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;
    owned_project(&state, &user_id, &project_id)?;

    let session = state.proxy.create_session(&project_id, req.name).await?;
    Ok(Json(json!({
        "message": "Session created successfully",
        "session": session,
    })))
}

/// List the sessions stored on the project record
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((user_id, project_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;
    let project = owned_project(&state, &user_id, &project_id)?;

    Ok(Json(json!({ "sessions": project.sessions })))
}

/// Delete a session from the agent and the project record
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((user_id, project_id, session_id)): Path<(String, String, String)>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;
    owned_project(&state, &user_id, &project_id)?;

    state.proxy.delete_session(&project_id, &session_id).await?;
    Ok(Json(json!({ "message": "Session deleted successfully" })))
}

/// Message history for a session, fetched from the agent
pub async fn session_messages(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((user_id, project_id, session_id)): Path<(String, String, String)>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;
    owned_project(&state, &user_id, &project_id)?;

    let history = state
        .proxy
        .session_messages(&project_id, &session_id)
        .await?;
    Ok(Json(history))
}
