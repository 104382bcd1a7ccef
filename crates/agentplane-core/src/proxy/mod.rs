//! Agent proxy: forwards chat traffic to a project's in-cluster agent.
//!
//! Both operations verify the project is active against the metadata store
//! before dialing; the endpoint comes from the project record, never from a
//! fresh cluster lookup. Streaming preserves upstream SSE framing and emits
//! a terminal `error` event when the upstream fails mid-stream.

pub mod sse;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{Project, ProjectStatus, SessionSummary};
use chrono::Utc;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::{json, Value};
use sse::{SseEvent, SseParser};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const SESSION_TIMEOUT: Duration = Duration::from_secs(10);
const HISTORY_TIMEOUT: Duration = Duration::from_secs(30);
/// Non-streaming sends wait for the full agent turn
const SEND_TIMEOUT: Duration = Duration::from_secs(120);
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

pub struct AgentProxy {
    store: Arc<Store>,
    http: reqwest::Client,
}

impl AgentProxy {
    pub fn new(store: Arc<Store>) -> Result<Self> {
        // No global timeout: streams are unbounded. Sync calls set their own.
        let http = reqwest::Client::builder()
            .build()
            .map_err(Error::upstream)?;
        Ok(Self { store, http })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a session against the running agent and store its summary
    pub async fn create_session(
        &self,
        project_id: &str,
        name: Option<String>,
    ) -> Result<SessionSummary> {
        let (project, base) = self.require_active(project_id)?;

        let resp = self
            .http
            .post(format!("{base}/api/v1/sessions"))
            .timeout(SESSION_TIMEOUT)
            .send()
            .await
            .map_err(Error::upstream)?;
        if resp.status() != reqwest::StatusCode::CREATED {
            return Err(Error::Upstream(format!(
                "session create returned {}",
                resp.status()
            )));
        }
        let body: Value = resp.json().await.map_err(Error::upstream)?;
        let session_id = body
            .get("session_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Upstream("agent response missing session_id".into()))?
            .to_string();

        let summary = SessionSummary {
            session_id,
            name: name.unwrap_or_else(|| format!("Session {}", project.sessions.len() + 1)),
            created_at: Utc::now(),
            message_count: 0,
        };
        self.store.add_session(project_id, &summary)?;
        debug!(project_id, session_id = %summary.session_id, "session created");
        Ok(summary)
    }

    /// Delete a session. The agent is told first when reachable, but the
    /// stored summary is removed even if that call fails.
    pub async fn delete_session(&self, project_id: &str, session_id: &str) -> Result<()> {
        let project = self.require_project(project_id)?;

        if project.status == ProjectStatus::Active {
            if let Some(endpoint) = &project.endpoint {
                let url = format!("http://{endpoint}/api/v1/sessions/{session_id}");
                if let Err(e) = self
                    .http
                    .delete(&url)
                    .timeout(SESSION_TIMEOUT)
                    .send()
                    .await
                {
                    warn!(project_id, session_id, error = %e, "agent session delete failed");
                }
            }
        }

        if !self.store.remove_session(project_id, session_id)? {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Message history for a session, fetched from the agent
    pub async fn session_messages(&self, project_id: &str, session_id: &str) -> Result<Value> {
        let (project, base) = self.require_active(project_id)?;
        self.require_session(&project, session_id)?;

        let url = format!("{base}/api/v1/sessions/{session_id}/messages");
        let resp = self
            .http
            .get(&url)
            .timeout(HISTORY_TIMEOUT)
            .send()
            .await
            .map_err(Error::upstream)?;

        match resp.status() {
            reqwest::StatusCode::OK => resp.json().await.map_err(Error::upstream),
            // The agent lost the session (restart); report it empty
            reqwest::StatusCode::NOT_FOUND => Ok(json!({
                "session_id": session_id,
                "messages": [],
                "total_count": 0,
            })),
            status => Err(Error::Upstream(format!(
                "history fetch returned {status}"
            ))),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Chat
    // ─────────────────────────────────────────────────────────────────────────

    /// Synchronous send: waits for the agent's full response
    pub async fn send_message(
        &self,
        project_id: &str,
        session_id: &str,
        content: &str,
    ) -> Result<Value> {
        let (project, base) = self.require_active(project_id)?;
        self.require_session(&project, session_id)?;

        let url = format!("{base}/api/v1/sessions/{session_id}/send");
        let resp = self
            .http
            .post(&url)
            .timeout(SEND_TIMEOUT)
            .json(&json!({ "message": content }))
            .send()
            .await
            .map_err(Error::upstream)?;

        if resp.status() != reqwest::StatusCode::OK {
            return Err(Error::Upstream(format!(
                "agent send returned {}",
                resp.status()
            )));
        }
        let result: Value = resp.json().await.map_err(Error::upstream)?;
        self.store
            .increment_session_messages(project_id, session_id)?;
        Ok(result)
    }

    /// Streaming send: relays the agent's SSE stream event-by-event.
    ///
    /// The returned stream ends after a terminal `done` or `error` event or
    /// when the upstream closes; an upstream failure mid-stream becomes a
    /// terminal `error` event. Dropping the stream tears down the upstream
    /// connection.
    pub async fn stream_message(
        &self,
        project_id: &str,
        session_id: &str,
        content: &str,
    ) -> Result<impl Stream<Item = SseEvent> + Send + 'static> {
        let (project, base) = self.require_active(project_id)?;
        self.require_session(&project, session_id)?;

        let url = format!("{base}/api/v1/sessions/{session_id}/messages");
        let resp = self
            .http
            .post(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&json!({ "message": content }))
            .send()
            .await
            .map_err(Error::upstream)?;

        if !resp.status().is_success() {
            return Err(Error::Upstream(format!(
                "agent stream returned {}",
                resp.status()
            )));
        }
        self.store
            .increment_session_messages(project_id, session_id)?;

        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(|e| e.to_string()))
            .boxed();
        Ok(relay_stream(body))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────

    /// Agent health snapshot plus the persisted project status and last error
    pub async fn agent_status(&self, project_id: &str) -> Result<Value> {
        let project = self.require_project(project_id)?;

        let agent = match (&project.status, &project.endpoint) {
            (ProjectStatus::Active, Some(endpoint)) => {
                let url = format!("http://{endpoint}/api/v1/health");
                match self.http.get(&url).timeout(STATUS_TIMEOUT).send().await {
                    Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                        resp.json().await.unwrap_or(Value::Null)
                    }
                    Ok(resp) => json!({ "error": format!("health returned {}", resp.status()) }),
                    Err(e) => json!({ "error": e.to_string() }),
                }
            }
            _ => Value::Null,
        };

        Ok(json!({
            "project_status": project.status.as_str(),
            "agent": agent,
            "last_error": project.last_error,
        }))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    fn require_project(&self, project_id: &str) -> Result<Project> {
        self.store
            .get_project(project_id)?
            .ok_or_else(|| Error::ProjectNotFound(project_id.to_string()))
    }

    fn require_active(&self, project_id: &str) -> Result<(Project, String)> {
        let project = self.require_project(project_id)?;
        if project.status != ProjectStatus::Active {
            return Err(Error::ProjectNotActive(project_id.to_string()));
        }
        let endpoint = project
            .endpoint
            .clone()
            .ok_or_else(|| Error::ProjectNotActive(project_id.to_string()))?;
        Ok((project, format!("http://{endpoint}")))
    }

    fn require_session(&self, project: &Project, session_id: &str) -> Result<()> {
        if project.session(session_id).is_none() {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }
}

struct RelayState {
    body: BoxStream<'static, std::result::Result<Vec<u8>, String>>,
    parser: SseParser,
    buffer: String,
    pending: VecDeque<SseEvent>,
    done: bool,
}

/// Turn a raw upstream byte stream into parsed SSE events with terminal
/// error handling
fn relay_stream(
    body: BoxStream<'static, std::result::Result<Vec<u8>, String>>,
) -> impl Stream<Item = SseEvent> + Send + 'static {
    let state = RelayState {
        body,
        parser: SseParser::new(),
        buffer: String::new(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                if event.is_terminal() {
                    st.done = true;
                }
                return Some((event, st));
            }
            if st.done {
                return None;
            }
            match st.body.next().await {
                Some(Ok(chunk)) => {
                    st.buffer.push_str(&String::from_utf8_lossy(&chunk));
                    while let Some(pos) = st.buffer.find('\n') {
                        let line: String = st.buffer.drain(..=pos).collect();
                        if let Some(event) = st.parser.push_line(line.trim_end_matches('\n')) {
                            st.pending.push_back(event);
                        }
                    }
                }
                Some(Err(reason)) => {
                    st.pending
                        .push_back(SseEvent::error(format!("upstream stream failed: {reason}")));
                    st.done = true;
                    // Fall through so the error event is yielded first
                    if let Some(event) = st.pending.pop_front() {
                        return Some((event, st));
                    }
                }
                None => {
                    // Clean upstream close; a partial event without its blank
                    // line is dropped
                    st.done = true;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProjectStatus;
    use std::collections::BTreeMap;

    fn store_with_project(status: ProjectStatus, endpoint: Option<&str>) -> (Arc<Store>, String) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.upsert_user("u1", "User One").unwrap();
        let now = Utc::now();
        let project = Project {
            project_id: "p1".into(),
            user_id: "u1".into(),
            name: "demo".into(),
            status,
            endpoint: endpoint.map(String::from),
            repo_url: None,
            has_repository: false,
            github_key_set: false,
            github_key_source: None,
            github_key_masked: None,
            last_error: Some("probe failed".into()),
            sessions: vec![SessionSummary {
                session_id: "s1".into(),
                name: "chat".into(),
                created_at: now,
                message_count: 0,
            }],
            settings: BTreeMap::new(),
            extensions: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        store.create_project(&project).unwrap();
        (store, "p1".into())
    }

    #[tokio::test]
    async fn test_chat_requires_active_project() {
        let (store, pid) = store_with_project(ProjectStatus::Inactive, None);
        let proxy = AgentProxy::new(store).unwrap();

        let err = proxy.send_message(&pid, "s1", "ping").await;
        assert!(matches!(err, Err(Error::ProjectNotActive(_))));
        let err = proxy.stream_message(&pid, "s1", "ping").await.map(|_| ());
        assert!(matches!(err, Err(Error::ProjectNotActive(_))));
    }

    #[tokio::test]
    async fn test_unknown_session_is_rejected_before_dialing() {
        let (store, pid) = store_with_project(ProjectStatus::Active, Some("svc.local"));
        let proxy = AgentProxy::new(store).unwrap();

        let err = proxy.send_message(&pid, "nope", "ping").await;
        assert!(matches!(err, Err(Error::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_session_works_without_agent() {
        let (store, pid) = store_with_project(ProjectStatus::Inactive, None);
        let proxy = AgentProxy::new(store.clone()).unwrap();

        proxy.delete_session(&pid, "s1").await.unwrap();
        assert!(store.get_project(&pid).unwrap().unwrap().sessions.is_empty());

        let err = proxy.delete_session(&pid, "s1").await;
        assert!(matches!(err, Err(Error::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_agent_status_surfaces_last_error_when_not_active() {
        let (store, pid) = store_with_project(ProjectStatus::Error, None);
        let proxy = AgentProxy::new(store).unwrap();

        let status = proxy.agent_status(&pid).await.unwrap();
        assert_eq!(status["project_status"], "error");
        assert_eq!(status["last_error"], "probe failed");
        assert!(status["agent"].is_null());
    }

    #[tokio::test]
    async fn test_relay_stream_preserves_framing_and_order() {
        let chunks: Vec<std::result::Result<Vec<u8>, String>> = vec![
            Ok(b"event: message\nda".to_vec()),
            Ok(b"ta: {\"text\":\"hi\"}\n\nevent: done\ndata: {}\n\n".to_vec()),
        ];
        let body = stream::iter(chunks).boxed();
        let events: Vec<SseEvent> = relay_stream(body).collect().await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "{\"text\":\"hi\"}");
        assert_eq!(events[1].event, "done");
    }

    #[tokio::test]
    async fn test_relay_stream_stops_after_terminal_event() {
        let chunks: Vec<std::result::Result<Vec<u8>, String>> = vec![Ok(
            b"event: done\ndata: {}\n\nevent: message\ndata: late\n\n".to_vec(),
        )];
        let body = stream::iter(chunks).boxed();
        let events: Vec<SseEvent> = relay_stream(body).collect().await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "done");
    }

    #[tokio::test]
    async fn test_relay_stream_emits_terminal_error_on_upstream_failure() {
        let chunks: Vec<std::result::Result<Vec<u8>, String>> = vec![
            Ok(b"event: message\ndata: {\"text\":\"hi\"}\n\n".to_vec()),
            Err("connection reset".to_string()),
        ];
        let body = stream::iter(chunks).boxed();
        let events: Vec<SseEvent> = relay_stream(body).collect().await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event, "error");
        assert!(events[1].data.contains("connection reset"));
    }

    #[tokio::test]
    async fn test_relay_stream_encoded_output_is_well_formed() {
        let chunks: Vec<std::result::Result<Vec<u8>, String>> = vec![Ok(
            b"event: thinking\ndata: a\n\nevent: done\ndata: {}\n\n".to_vec(),
        )];
        let body = stream::iter(chunks).boxed();
        let events: Vec<SseEvent> = relay_stream(body).collect().await;

        let wire: String = events.iter().map(sse::encode).collect();
        // Every data line sits inside an event block and the stream ends
        // with a terminal event frame
        assert!(wire.starts_with("event: thinking\n"));
        assert!(wire.ends_with("event: done\ndata: {}\n\n"));
    }
}
