//! API route modules.

pub mod extensions;
pub mod health;
pub mod messages;
pub mod projects;
pub mod sessions;
pub mod settings;
pub mod users;

use agentplane_core::types::Project;
use agentplane_core::Error;
use axum::{middleware, routing::get, Router};
use std::sync::Arc;

use crate::error::ApiError;
use crate::middleware::{auth_middleware, AuthContext};
use crate::state::AppState;

/// Create the main router with all routes
pub fn create_router(state: Arc<AppState>) -> Router {
    // Public routes (no auth)
    let public_routes = Router::new().route("/health", get(health::health_check));

    // Everything else requires a caller-identifying API key
    let protected_routes = Router::new()
        .merge(users::router())
        .merge(projects::router())
        .merge(sessions::router())
        .merge(messages::router())
        .merge(settings::router())
        .merge(extensions::router())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}

/// Reject calls where the credential-bound user differs from the path user
pub(crate) fn authorize(auth: &AuthContext, user_id: &str) -> Result<(), ApiError> {
    if auth.user_id() != user_id {
        return Err(ApiError::AccessDenied);
    }
    Ok(())
}

/// Load a project and verify it belongs to the path user
pub(crate) fn owned_project(
    state: &AppState,
    user_id: &str,
    project_id: &str,
) -> Result<Project, ApiError> {
    let project = state
        .store
        .get_project(project_id)
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::Core(Error::ProjectNotFound(project_id.to_string())))?;
    if project.user_id != user_id {
        return Err(ApiError::AccessDenied);
    }
    Ok(project)
}
