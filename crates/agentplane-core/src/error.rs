//! Error types for agentplane-core.

use thiserror::Error;

/// Result type alias using agentplane-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for control-plane operations
#[derive(Error, Debug)]
pub enum Error {
    // Lookup failures
    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Extension not found: {0}")]
    ExtensionNotFound(String),

    // Validation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown setting key: {0}")]
    UnknownSetting(String),

    // Lifecycle
    #[error("Conflicting transition in progress for project {0}")]
    Conflict(String),

    #[error("Project {0} is not active")]
    ProjectNotActive(String),

    #[error("Pod for project {0} did not become ready within {1}s")]
    ReadinessTimeout(String, u64),

    #[error("Repository clone failed: {0}")]
    CloneFailed(String),

    // Infrastructure
    #[error("Cluster operation failed: {0}")]
    Orchestrator(String),

    #[error("Metadata store unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Agent returned an error: {0}")]
    Upstream(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create an orchestrator error from any displayable cause
    pub fn orchestrator(cause: impl std::fmt::Display) -> Self {
        Self::Orchestrator(cause.to_string())
    }

    /// Create an upstream (agent) error from any displayable cause
    pub fn upstream(cause: impl std::fmt::Display) -> Self {
        Self::Upstream(cause.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::StorageUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Self::Orchestrator(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_context() {
        let err = Error::ReadinessTimeout("p1".into(), 120);
        assert!(err.to_string().contains("p1"));
        assert!(err.to_string().contains("120"));
    }

    #[test]
    fn test_sqlite_error_maps_to_storage_unavailable() {
        let err: Error = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, Error::StorageUnavailable(_)));
    }
}
