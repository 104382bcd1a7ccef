//! Chat routes: streaming relay and fire-and-forget send.

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::post,
    Extension, Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;

use crate::error::ApiError;
use crate::middleware::AuthContext;
use crate::routes::{authorize, owned_project};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/users/:user_id/projects/:project_id/messages",
            post(stream_message),
        )
        .route(
            "/users/:user_id/projects/:project_id/messages/send",
            post(send_message),
        )
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub session_id: String,
    pub content: String,
}

/// Relay the agent's SSE stream to the caller.
///
/// Each upstream event is re-emitted with its name and data intact and
/// flushed immediately. When the caller disconnects the returned stream is
/// dropped, which tears down the upstream connection.
pub async fn stream_message(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((user_id, project_id)): Path<(String, String)>,
    Json(req): Json<MessageRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    authorize(&auth, &user_id)?;
    owned_project(&state, &user_id, &project_id)?;

    let upstream = state
        .proxy
        .stream_message(&project_id, &req.session_id, &req.content)
        .await?;

    let events =
        upstream.map(|event| Ok(Event::default().event(event.event).data(event.data)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Send a message and wait for the agent's full response
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((user_id, project_id)): Path<(String, String)>,
    Json(req): Json<MessageRequest>,
) -> Result<Json<Value>, ApiError> {
    authorize(&auth, &user_id)?;
    owned_project(&state, &user_id, &project_id)?;

    let result = state
        .proxy
        .send_message(&project_id, &req.session_id, &req.content)
        .await?;
    Ok(Json(json!({
        "message": "Message sent successfully",
        "result": result,
        "session_id": req.session_id,
    })))
}
