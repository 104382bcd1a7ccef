//! Project setting routes.
//!
//! The recognized keys are fixed at compile time; values are stored on the
//! project record and flow into the agent's environment at the next
//! (rolling) restart.

use agentplane_core::settings::{self, SettingType, SETTINGS};
use agentplane_core::types::Project;
use axum::{
    extract::{Path, State},
    routing::{get, put},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ApiError;
use crate::middleware::AuthContext;
use crate::routes::{authorize, owned_project};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/users/:user_id/projects/:project_id/settings",
            get(get_settings).put(update_settings_bulk),
        )
        .route(
            "/users/:user_id/projects/:project_id/settings/:key",
            put(update_setting)
                .get(get_setting)
                .delete(reset_setting),
        )
}

fn type_label(ty: SettingType) -> &'static str {
    match ty {
        SettingType::String => "string",
        SettingType::Int => "int",
        SettingType::Float => "float",
        SettingType::Bool => "bool",
        SettingType::Enum(_) => "enum",
    }
}

fn describe(project: &Project, key: &str) -> Result<Value, ApiError> {
    let def = settings::lookup(key).map_err(ApiError::from)?;
    let value = match project.settings.get(key) {
        Some(explicit) => explicit.clone(),
        None => def
            .default
            .map(|d| Value::String(d.to_string()))
            .unwrap_or(Value::Null),
    };
    Ok(json!({
        "key": def.key,
        "value": value,
        "type": type_label(def.ty),
        "default": def.default,
        "requires_restart": def.requires_restart,
        "is_default": !project.settings.contains_key(key),
    }))
}

/// All settings with their effective values
pub async fn get_settings(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((user_id, project_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;
    let project = owned_project(&state, &user_id, &project_id)?;

    let mut entries = Map::new();
    for def in SETTINGS {
        entries.insert(def.key.to_string(), describe(&project, def.key)?);
    }
    Ok(Json(json!({ "settings": entries })))
}

/// A single setting with its effective value
pub async fn get_setting(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((user_id, project_id, key)): Path<(String, String, String)>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;
    let project = owned_project(&state, &user_id, &project_id)?;
    Ok(Json(describe(&project, &key)?))
}

#[derive(Debug, Deserialize)]
pub struct SettingUpdateRequest {
    pub value: Value,
}

/// Update one setting
pub async fn update_setting(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((user_id, project_id, key)): Path<(String, String, String)>,
    Json(req): Json<SettingUpdateRequest>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;
    owned_project(&state, &user_id, &project_id)?;

    let mut changes = BTreeMap::new();
    changes.insert(key.clone(), req.value);
    let restart_required = state.engine.update_settings(&project_id, &changes).await?;

    let project = owned_project(&state, &user_id, &project_id)?;
    Ok(Json(json!({
        "message": format!("Setting {key} updated successfully"),
        "setting": describe(&project, &key)?,
        "restart_required": restart_required,
    })))
}

/// Bulk update: body is a map of key to value
pub async fn update_settings_bulk(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((user_id, project_id)): Path<(String, String)>,
    Json(req): Json<BTreeMap<String, Value>>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;
    owned_project(&state, &user_id, &project_id)?;

    let count = req.len();
    let restart_required = state.engine.update_settings(&project_id, &req).await?;
    Ok(Json(json!({
        "message": format!("Updated {count} settings"),
        "restart_required": restart_required,
    })))
}

/// Reset a setting to its declared default
pub async fn reset_setting(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((user_id, project_id, key)): Path<(String, String, String)>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;
    owned_project(&state, &user_id, &project_id)?;

    let restart_required = state.engine.remove_setting(&project_id, &key).await?;
    let project = owned_project(&state, &user_id, &project_id)?;
    Ok(Json(json!({
        "message": format!("Setting {key} reset to default successfully"),
        "setting": describe(&project, &key)?,
        "restart_required": restart_required,
    })))
}
