//! Metadata store for agentplane.
//!
//! Single source of truth for users and projects. Sessions, settings and
//! extensions are embedded in the project record and stored as JSON columns;
//! mutations on embedded lists are idempotent on identity (session_id,
//! extension name).
//!
//! All mutations write through; there is no cache.

use crate::error::{Error, Result};
use crate::types::{
    Extension, GithubKeySource, Project, ProjectStatus, SessionSummary, User,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

/// Columns accepted by [`Store::update_project_fields`]
const UPDATABLE_PROJECT_FIELDS: &[&str] = &[
    "name",
    "status",
    "endpoint",
    "repo_url",
    "has_repository",
    "github_key_set",
    "github_key_source",
    "github_key_masked",
    "last_error",
];

/// Store connection wrapper.
///
/// Thread-safe via internal Mutex. All operations acquire the lock, which
/// also serializes writes to the same project.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open the store at a specific path, creating the schema if needed
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (tests)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                user_id            TEXT PRIMARY KEY,
                name               TEXT NOT NULL,
                api_key_digest     TEXT,
                github_key_masked  TEXT,
                github_secret_name TEXT,
                api_key_masked     TEXT,
                api_secret_name    TEXT,
                created_at         TEXT NOT NULL,
                updated_at         TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS projects (
                project_id         TEXT PRIMARY KEY,
                user_id            TEXT NOT NULL,
                name               TEXT NOT NULL,
                status             TEXT NOT NULL,
                endpoint           TEXT,
                repo_url           TEXT,
                has_repository     INTEGER NOT NULL DEFAULT 0,
                github_key_set     INTEGER NOT NULL DEFAULT 0,
                github_key_source  TEXT,
                github_key_masked  TEXT,
                last_error         TEXT,
                sessions           TEXT NOT NULL DEFAULT '[]',
                settings           TEXT NOT NULL DEFAULT '{}',
                extensions         TEXT NOT NULL DEFAULT '[]',
                created_at         TEXT NOT NULL,
                updated_at         TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_projects_user ON projects(user_id);",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::StorageUnavailable("store lock poisoned".into()))
    }

    /// Check store connectivity
    pub fn ping(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch("SELECT 1")?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // User Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a user if absent, update the display name if present
    pub fn upsert_user(&self, user_id: &str, name: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO users (user_id, name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(user_id) DO UPDATE SET name = ?2, updated_at = ?3",
            params![user_id, name, now],
        )?;
        Ok(())
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, name, github_key_masked, github_secret_name,
                    api_key_masked, api_secret_name, created_at, updated_at
             FROM users WHERE user_id = ?1",
        )?;
        Ok(stmt
            .query_row(params![user_id], Self::map_user)
            .optional()?)
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, name, github_key_masked, github_secret_name,
                    api_key_masked, api_secret_name, created_at, updated_at
             FROM users ORDER BY user_id",
        )?;
        let users = stmt
            .query_map([], Self::map_user)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(users)
    }

    pub fn delete_user(&self, user_id: &str) -> Result<()> {
        let conn = self.lock()?;
        let n = conn.execute("DELETE FROM users WHERE user_id = ?1", params![user_id])?;
        if n == 0 {
            return Err(Error::UserNotFound(user_id.to_string()));
        }
        Ok(())
    }

    /// Bind the caller-identifying API key digest to a user
    pub fn set_user_api_key_digest(&self, user_id: &str, digest: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE users SET api_key_digest = ?2, updated_at = ?3 WHERE user_id = ?1",
            params![user_id, digest, now],
        )?;
        if n == 0 {
            return Err(Error::UserNotFound(user_id.to_string()));
        }
        Ok(())
    }

    /// Resolve the user owning an API key digest, for auth
    pub fn get_user_by_api_key_digest(&self, digest: &str) -> Result<Option<User>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, name, github_key_masked, github_secret_name,
                    api_key_masked, api_secret_name, created_at, updated_at
             FROM users WHERE api_key_digest = ?1",
        )?;
        Ok(stmt.query_row(params![digest], Self::map_user).optional()?)
    }

    /// Record the masked global Git token and its secret reference; clears
    /// both when `masked` is None
    pub fn set_user_github_key(
        &self,
        user_id: &str,
        masked: Option<&str>,
        secret_name: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE users SET github_key_masked = ?2, github_secret_name = ?3,
                    updated_at = ?4
             WHERE user_id = ?1",
            params![user_id, masked, secret_name, now],
        )?;
        if n == 0 {
            return Err(Error::UserNotFound(user_id.to_string()));
        }
        Ok(())
    }

    /// Record the masked workspace API key and its secret reference
    pub fn set_user_api_key(
        &self,
        user_id: &str,
        masked: Option<&str>,
        secret_name: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE users SET api_key_masked = ?2, api_secret_name = ?3, updated_at = ?4
             WHERE user_id = ?1",
            params![user_id, masked, secret_name, now],
        )?;
        if n == 0 {
            return Err(Error::UserNotFound(user_id.to_string()));
        }
        Ok(())
    }

    fn map_user(row: &Row) -> rusqlite::Result<User> {
        Ok(User {
            user_id: row.get(0)?,
            name: row.get(1)?,
            github_key_masked: row.get(2)?,
            github_secret_name: row.get(3)?,
            api_key_masked: row.get(4)?,
            api_secret_name: row.get(5)?,
            created_at: parse_ts(row.get::<_, String>(6)?),
            updated_at: parse_ts(row.get::<_, String>(7)?),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Project Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a complete project record. Atomic: either the whole record is
    /// visible afterwards or the call fails.
    pub fn create_project(&self, project: &Project) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO projects (project_id, user_id, name, status, endpoint,
                    repo_url, has_repository, github_key_set, github_key_source,
                    github_key_masked, last_error, sessions, settings, extensions,
                    created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                project.project_id,
                project.user_id,
                project.name,
                project.status.as_str(),
                project.endpoint,
                project.repo_url,
                project.has_repository,
                project.github_key_set,
                project.github_key_source.map(source_str),
                project.github_key_masked,
                project.last_error,
                serde_json::to_string(&project.sessions)?,
                serde_json::to_string(&project.settings)?,
                serde_json::to_string(&project.extensions)?,
                project.created_at.to_rfc3339(),
                project.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_project(&self, project_id: &str) -> Result<Option<Project>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM projects WHERE project_id = ?1",
            PROJECT_COLUMNS
        ))?;
        stmt.query_row(params![project_id], Self::map_project)
            .optional()?
            .transpose()
    }

    pub fn list_projects_by_user(&self, user_id: &str) -> Result<Vec<Project>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM projects WHERE user_id = ?1 ORDER BY created_at",
            PROJECT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![user_id], Self::map_project)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    /// Remove the record unconditionally. Callers must have cleaned up the
    /// cluster first, otherwise its objects leak.
    pub fn delete_project(&self, project_id: &str) -> Result<()> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM projects WHERE project_id = ?1",
            params![project_id],
        )?;
        if n == 0 {
            return Err(Error::ProjectNotFound(project_id.to_string()));
        }
        Ok(())
    }

    /// Apply a field→value map to the project row. Unknown fields are
    /// rejected; `updated_at` is always refreshed.
    pub fn update_project_fields(
        &self,
        project_id: &str,
        changes: &BTreeMap<String, Value>,
    ) -> Result<()> {
        for field in changes.keys() {
            if !UPDATABLE_PROJECT_FIELDS.contains(&field.as_str()) {
                return Err(Error::InvalidArgument(format!(
                    "unknown project field: {field}"
                )));
            }
        }

        let mut sets = Vec::with_capacity(changes.len() + 1);
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        for (i, (field, value)) in changes.iter().enumerate() {
            sets.push(format!("{field} = ?{}", i + 2));
            values.push(to_sql_value(value));
        }
        sets.push(format!("updated_at = ?{}", changes.len() + 2));
        values.push(Box::new(Utc::now().to_rfc3339()));

        let sql = format!(
            "UPDATE projects SET {} WHERE project_id = ?1",
            sets.join(", ")
        );
        let conn = self.lock()?;
        let mut param_refs: Vec<&dyn rusqlite::ToSql> = vec![&project_id];
        param_refs.extend(values.iter().map(|v| v.as_ref() as &dyn rusqlite::ToSql));
        let n = conn.execute(&sql, param_refs.as_slice())?;
        if n == 0 {
            return Err(Error::ProjectNotFound(project_id.to_string()));
        }
        Ok(())
    }

    /// Set status and endpoint together, keeping the §3 invariant that only
    /// active projects carry an endpoint
    pub fn set_project_status(
        &self,
        project_id: &str,
        status: ProjectStatus,
        endpoint: Option<&str>,
    ) -> Result<()> {
        let mut changes = BTreeMap::new();
        changes.insert("status".to_string(), Value::from(status.as_str()));
        changes.insert(
            "endpoint".to_string(),
            endpoint.map(Value::from).unwrap_or(Value::Null),
        );
        self.update_project_fields(project_id, &changes)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Embedded Sessions
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a session summary; idempotent on session_id
    pub fn add_session(&self, project_id: &str, session: &SessionSummary) -> Result<()> {
        self.mutate_sessions(project_id, |sessions| {
            if !sessions.iter().any(|s| s.session_id == session.session_id) {
                sessions.push(session.clone());
            }
        })
    }

    /// Remove a session summary; absent ids are not an error
    pub fn remove_session(&self, project_id: &str, session_id: &str) -> Result<bool> {
        let mut removed = false;
        self.mutate_sessions(project_id, |sessions| {
            let before = sessions.len();
            sessions.retain(|s| s.session_id != session_id);
            removed = sessions.len() != before;
        })?;
        Ok(removed)
    }

    pub fn increment_session_messages(&self, project_id: &str, session_id: &str) -> Result<()> {
        self.mutate_sessions(project_id, |sessions| {
            if let Some(s) = sessions.iter_mut().find(|s| s.session_id == session_id) {
                s.message_count += 1;
            }
        })
    }

    fn mutate_sessions(
        &self,
        project_id: &str,
        f: impl FnOnce(&mut Vec<SessionSummary>),
    ) -> Result<()> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT sessions FROM projects WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()?;
        let raw = raw.ok_or_else(|| Error::ProjectNotFound(project_id.to_string()))?;
        let mut sessions: Vec<SessionSummary> = serde_json::from_str(&raw)?;
        f(&mut sessions);
        conn.execute(
            "UPDATE projects SET sessions = ?2, updated_at = ?3 WHERE project_id = ?1",
            params![
                project_id,
                serde_json::to_string(&sessions)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Embedded Settings
    // ─────────────────────────────────────────────────────────────────────────

    /// Store an explicit (already coerced) setting value
    pub fn set_setting(&self, project_id: &str, key: &str, value: Value) -> Result<()> {
        self.mutate_settings(project_id, |settings| {
            settings.insert(key.to_string(), value);
        })
    }

    /// Drop an explicit value so the declared default applies again
    pub fn remove_setting(&self, project_id: &str, key: &str) -> Result<()> {
        self.mutate_settings(project_id, |settings| {
            settings.remove(key);
        })
    }

    fn mutate_settings(
        &self,
        project_id: &str,
        f: impl FnOnce(&mut BTreeMap<String, Value>),
    ) -> Result<()> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT settings FROM projects WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()?;
        let raw = raw.ok_or_else(|| Error::ProjectNotFound(project_id.to_string()))?;
        let mut settings: BTreeMap<String, Value> = serde_json::from_str(&raw)?;
        f(&mut settings);
        conn.execute(
            "UPDATE projects SET settings = ?2, updated_at = ?3 WHERE project_id = ?1",
            params![
                project_id,
                serde_json::to_string(&settings)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Embedded Extensions
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert or replace an extension by name, preserving insertion order
    pub fn upsert_extension(&self, project_id: &str, extension: &Extension) -> Result<()> {
        self.mutate_extensions(project_id, |extensions| {
            if let Some(existing) = extensions.iter_mut().find(|e| e.name == extension.name) {
                *existing = extension.clone();
            } else {
                extensions.push(extension.clone());
            }
        })
    }

    pub fn remove_extension(&self, project_id: &str, name: &str) -> Result<bool> {
        let mut removed = false;
        self.mutate_extensions(project_id, |extensions| {
            let before = extensions.len();
            extensions.retain(|e| e.name != name);
            removed = extensions.len() != before;
        })?;
        Ok(removed)
    }

    /// Flip the enabled flag, keeping the payload intact. Returns false when
    /// no extension with that name exists.
    pub fn set_extension_enabled(
        &self,
        project_id: &str,
        name: &str,
        enabled: bool,
    ) -> Result<bool> {
        let mut found = false;
        self.mutate_extensions(project_id, |extensions| {
            if let Some(e) = extensions.iter_mut().find(|e| e.name == name) {
                e.enabled = enabled;
                found = true;
            }
        })?;
        Ok(found)
    }

    fn mutate_extensions(
        &self,
        project_id: &str,
        f: impl FnOnce(&mut Vec<Extension>),
    ) -> Result<()> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT extensions FROM projects WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()?;
        let raw = raw.ok_or_else(|| Error::ProjectNotFound(project_id.to_string()))?;
        let mut extensions: Vec<Extension> = serde_json::from_str(&raw)?;
        f(&mut extensions);
        conn.execute(
            "UPDATE projects SET extensions = ?2, updated_at = ?3 WHERE project_id = ?1",
            params![
                project_id,
                serde_json::to_string(&extensions)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn map_project(row: &Row) -> rusqlite::Result<Result<Project>> {
        Ok(Self::project_from_row(row))
    }

    fn project_from_row(row: &Row) -> Result<Project> {
        let status_raw: String = row.get(3)?;
        let source_raw: Option<String> = row.get(8)?;
        Ok(Project {
            project_id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            status: ProjectStatus::parse(&status_raw).ok_or_else(|| {
                Error::Serialization(format!("invalid project status: {status_raw}"))
            })?,
            endpoint: row.get(4)?,
            repo_url: row.get(5)?,
            has_repository: row.get(6)?,
            github_key_set: row.get(7)?,
            github_key_source: match source_raw.as_deref() {
                Some("project") => Some(GithubKeySource::Project),
                Some("user") => Some(GithubKeySource::User),
                _ => None,
            },
            github_key_masked: row.get(9)?,
            last_error: row.get(10)?,
            sessions: serde_json::from_str(&row.get::<_, String>(11)?)?,
            settings: serde_json::from_str(&row.get::<_, String>(12)?)?,
            extensions: serde_json::from_str(&row.get::<_, String>(13)?)?,
            created_at: parse_ts(row.get::<_, String>(14)?),
            updated_at: parse_ts(row.get::<_, String>(15)?),
        })
    }
}

const PROJECT_COLUMNS: &str = "project_id, user_id, name, status, endpoint, repo_url, \
     has_repository, github_key_set, github_key_source, github_key_masked, \
     last_error, sessions, settings, extensions, created_at, updated_at";

fn source_str(source: GithubKeySource) -> &'static str {
    match source {
        GithubKeySource::Project => "project",
        GithubKeySource::User => "user",
    }
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn to_sql_value(value: &Value) -> Box<dyn rusqlite::ToSql> {
    match value {
        Value::Null => Box::new(Option::<String>::None),
        Value::Bool(b) => Box::new(*b),
        Value::Number(n) if n.is_i64() => Box::new(n.as_i64().unwrap_or_default()),
        Value::Number(n) => Box::new(n.as_f64().unwrap_or_default()),
        Value::String(s) => Box::new(s.clone()),
        other => Box::new(other.to_string()),
    }
}
