//! Extension management routes.
//!
//! Extensions are stored on the project record and serialized into the
//! agent's environment; every change requires a pod restart to take effect,
//! which the engine triggers on active projects.

use agentplane_core::types::Extension;
use axum::{
    extract::{Path, State},
    routing::{get, put},
    Extension as AxumExtension, Json, Router,
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
            "/users/:user_id/projects/:project_id/extensions",
            get(list_extensions).post(create_extension),
        )
        .route(
            "/users/:user_id/projects/:project_id/extensions/:name",
            put(update_extension).delete(delete_extension),
        )
        .route(
            "/users/:user_id/projects/:project_id/extensions/:name/toggle",
            put(toggle_extension),
        )
}

/// List extensions in insertion order
pub async fn list_extensions(
    State(state): State<Arc<AppState>>,
    AxumExtension(auth): AxumExtension<AuthContext>,
    Path((user_id, project_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;
    let project = owned_project(&state, &user_id, &project_id)?;

    Ok(Json(json!({ "extensions": project.extensions })))
}

/// Add an extension
pub async fn create_extension(
    State(state): State<Arc<AppState>>,
    AxumExtension(auth): AxumExtension<AuthContext>,
    Path((user_id, project_id)): Path<(String, String)>,
    Json(extension): Json<Extension>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;
    owned_project(&state, &user_id, &project_id)?;

    let restart_required = state
        .engine
        .upsert_extension(&project_id, extension)
        .await?;
    Ok(Json(json!({
        "message": "Extension created successfully",
        "restart_required": restart_required,
    })))
}

/// Replace an extension's payload, keyed by name
pub async fn update_extension(
    State(state): State<Arc<AppState>>,
    AxumExtension(auth): AxumExtension<AuthContext>,
    Path((user_id, project_id, name)): Path<(String, String, String)>,
    Json(mut extension): Json<Extension>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;
    owned_project(&state, &user_id, &project_id)?;

    // The path segment is authoritative for the name
    extension.name = name;
    let restart_required = state
        .engine
        .upsert_extension(&project_id, extension)
        .await?;
    Ok(Json(json!({
        "message": "Extension updated successfully",
        "restart_required": restart_required,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

/// Enable or disable an extension without touching its payload
pub async fn toggle_extension(
    State(state): State<Arc<AppState>>,
    AxumExtension(auth): AxumExtension<AuthContext>,
    Path((user_id, project_id, name)): Path<(String, String, String)>,
    Json(req): Json<ToggleRequest>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;
    owned_project(&state, &user_id, &project_id)?;

    let restart_required = state
        .engine
        .toggle_extension(&project_id, &name, req.enabled)
        .await?;
    let action = if req.enabled { "enabled" } else { "disabled" };
    Ok(Json(json!({
        "message": format!("Extension {action} successfully"),
        "restart_required": restart_required,
    })))
}

/// Remove an extension
pub async fn delete_extension(
    State(state): State<Arc<AppState>>,
    AxumExtension(auth): AxumExtension<AuthContext>,
    Path((user_id, project_id, name)): Path<(String, String, String)>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;
    owned_project(&state, &user_id, &project_id)?;

    let restart_required = state.engine.remove_extension(&project_id, &name).await?;
    Ok(Json(json!({
        "message": "Extension deleted successfully",
        "restart_required": restart_required,
    })))
}
