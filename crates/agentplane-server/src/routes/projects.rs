//! Project lifecycle routes.

use agentplane_core::types::{Project, SessionSummary};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::ApiError;
use crate::middleware::AuthContext;
use crate::routes::{authorize, owned_project};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/users/:user_id/projects",
            get(list_projects).post(create_project),
        )
        .route(
            "/users/:user_id/projects/:project_id",
            put(update_project).delete(delete_project),
        )
        .route(
            "/users/:user_id/projects/:project_id/activate",
            post(activate_project),
        )
        .route(
            "/users/:user_id/projects/:project_id/deactivate",
            post(deactivate_project),
        )
        .route(
            "/users/:user_id/projects/:project_id/clone-repository",
            post(clone_repository),
        )
        .route(
            "/users/:user_id/projects/:project_id/github-key",
            put(update_github_key),
        )
        .route(
            "/users/:user_id/projects/:project_id/agent/status",
            get(agent_status),
        )
}

#[derive(Debug, Serialize)]
pub struct ProjectResponse {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub status: String,
    pub endpoint: Option<String>,
    pub repo_url: Option<String>,
    pub has_repository: bool,
    pub github_key_set: bool,
    pub github_key_source: Option<String>,
    pub last_error: Option<String>,
    pub sessions: Vec<SessionSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Project> for ProjectResponse {
    fn from(p: Project) -> Self {
        Self {
            id: p.project_id,
            user_id: p.user_id,
            name: p.name,
            status: p.status.as_str().to_string(),
            endpoint: p.endpoint,
            repo_url: p.repo_url,
            has_repository: p.has_repository,
            github_key_set: p.github_key_set,
            github_key_source: p.github_key_source.map(|s| {
                match s {
                    agentplane_core::types::GithubKeySource::Project => "project",
                    agentplane_core::types::GithubKeySource::User => "user",
                }
                .to_string()
            }),
            last_error: p.last_error,
            sessions: p.sessions,
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

/// List the user's projects
pub async fn list_projects(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<ProjectResponse>>, ApiError> {
    authorize(&auth, &user_id)?;

    let projects = state.store.list_projects_by_user(&user_id)?;
    Ok(Json(projects.into_iter().map(Into::into).collect()))
}

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub github_key: Option<String>,
    pub repo_url: Option<String>,
}

/// Create a project and bring its agent up. Responds after the readiness
/// wait; a failed repository clone is reported as a warning, not a failure.
pub async fn create_project(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(user_id): Path<String>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    authorize(&auth, &user_id)?;

    let outcome = state
        .engine
        .create_project(&user_id, &req.name, req.repo_url, req.github_key)
        .await?;

    let mut body = json!({
        "message": "Project created successfully",
        "project_id": outcome.project.project_id,
        "endpoint": outcome.project.endpoint,
    });
    if let Some(warning) = outcome.clone_warning {
        body["warning"] = Value::from(warning);
    }
    Ok((StatusCode::CREATED, Json(body)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateProjectRequest {
    pub name: String,
}

/// Rename a project
pub async fn update_project(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((user_id, project_id)): Path<(String, String)>,
    Json(req): Json<UpdateProjectRequest>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;
    owned_project(&state, &user_id, &project_id)?;

    state.engine.rename_project(&project_id, &req.name)?;
    Ok(Json(json!({ "message": "Project updated successfully" })))
}

/// Delete a project and its cluster objects
pub async fn delete_project(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((user_id, project_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;
    owned_project(&state, &user_id, &project_id)?;

    state.engine.delete_project(&project_id).await?;
    Ok(Json(json!({ "message": "Project deleted successfully" })))
}

/// Activate a project and wait for its agent to become ready
pub async fn activate_project(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((user_id, project_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;
    owned_project(&state, &user_id, &project_id)?;

    let outcome = state.engine.activate_project(&project_id).await?;
    let mut body = json!({
        "message": "Project activated successfully",
        "endpoint": outcome.project.endpoint,
    });
    if let Some(warning) = outcome.clone_warning {
        body["warning"] = Value::from(warning);
    }
    Ok(Json(body))
}

/// Scale the project down to zero replicas
pub async fn deactivate_project(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((user_id, project_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;
    owned_project(&state, &user_id, &project_id)?;

    state.engine.deactivate_project(&project_id).await?;
    Ok(Json(json!({ "message": "Project deactivated successfully" })))
}

/// Re-run the repository clone inside the running pod
pub async fn clone_repository(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((user_id, project_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;
    owned_project(&state, &user_id, &project_id)?;

    match state.engine.clone_repository(&project_id).await {
        Ok(()) => Ok(Json(
            json!({ "message": "Repository cloned successfully" }),
        )),
        // Recorded on the project; the agent stays usable
        Err(agentplane_core::Error::CloneFailed(reason)) => Ok(Json(json!({
            "message": "Repository clone failed",
            "warning": reason,
        }))),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct ProjectGithubKeyRequest {
    pub github_key: Option<String>,
}

/// Set or remove the project's Git token
pub async fn update_github_key(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((user_id, project_id)): Path<(String, String)>,
    Json(req): Json<ProjectGithubKeyRequest>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;
    owned_project(&state, &user_id, &project_id)?;

    let action = if req.github_key.is_some() {
        "updated"
    } else {
        "removed"
    };
    state
        .engine
        .update_github_token(&project_id, req.github_key)
        .await?;
    Ok(Json(json!({
        "message": format!("GitHub key {action} successfully")
    })))
}

/// Agent health snapshot plus the persisted project status
pub async fn agent_status(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((user_id, project_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;
    owned_project(&state, &user_id, &project_id)?;

    let status = state.proxy.agent_status(&project_id).await?;
    Ok(Json(status))
}
