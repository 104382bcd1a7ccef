//! Shared types for agentplane-core.
//!
//! These types are used by the metadata store, the lifecycle engine and the
//! HTTP layer. Records returned to callers never contain clear credentials;
//! only masked copies plus the name of the cluster secret holding the value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Entity Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub name: String,
    /// Masked copy of the global Git token, if set
    pub github_key_masked: Option<String>,
    /// Name of the cluster secret holding the clear Git token
    pub github_secret_name: Option<String>,
    /// Masked copy of the workspace API key, if set
    pub api_key_masked: Option<String>,
    /// Name of the cluster secret holding the clear workspace key
    pub api_secret_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Project lifecycle status, persisted as its wire string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Inactive,
    Activating,
    Active,
    Deactivating,
    Error,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Inactive => "inactive",
            ProjectStatus::Activating => "activating",
            ProjectStatus::Active => "active",
            ProjectStatus::Deactivating => "deactivating",
            ProjectStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inactive" => Some(ProjectStatus::Inactive),
            "activating" => Some(ProjectStatus::Activating),
            "active" => Some(ProjectStatus::Active),
            "deactivating" => Some(ProjectStatus::Deactivating),
            "error" => Some(ProjectStatus::Error),
            _ => None,
        }
    }

    /// Terminal statuses are the only ones observable at rest
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProjectStatus::Inactive | ProjectStatus::Active | ProjectStatus::Error
        )
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a project's effective Git token comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GithubKeySource {
    Project,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub project_id: String,
    pub user_id: String,
    pub name: String,
    pub status: ProjectStatus,
    /// host[:port] of the agent service, set while active
    pub endpoint: Option<String>,
    pub repo_url: Option<String>,
    pub has_repository: bool,
    pub github_key_set: bool,
    pub github_key_source: Option<GithubKeySource>,
    pub github_key_masked: Option<String>,
    /// Last readiness or clone failure, surfaced by the agent-status endpoint
    pub last_error: Option<String>,
    pub sessions: Vec<SessionSummary>,
    /// Explicitly-set settings, keyed by registry key
    pub settings: std::collections::BTreeMap<String, serde_json::Value>,
    /// Extensions in insertion order
    pub extensions: Vec<Extension>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Look up a stored session summary by agent-issued id
    pub fn session(&self, session_id: &str) -> Option<&SessionSummary> {
        self.sessions.iter().find(|s| s.session_id == session_id)
    }
}

/// Summary of an agent-side session, embedded in the project record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub message_count: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Extensions
// ─────────────────────────────────────────────────────────────────────────────

/// Agent extension record. The payload varies by kind; exhaustive matching is
/// required wherever extensions are serialized for the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extension {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: ExtensionKind,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtensionKind {
    Builtin,
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: std::collections::BTreeMap<String, String>,
    },
    Sse {
        uri: String,
        #[serde(default)]
        env: std::collections::BTreeMap<String, String>,
    },
    StreamableHttp {
        uri: String,
        #[serde(default)]
        env: std::collections::BTreeMap<String, String>,
    },
    Frontend,
    InlinePython {
        code: String,
    },
}

impl ExtensionKind {
    pub fn kind_str(&self) -> &'static str {
        match self {
            ExtensionKind::Builtin => "builtin",
            ExtensionKind::Stdio { .. } => "stdio",
            ExtensionKind::Sse { .. } => "sse",
            ExtensionKind::StreamableHttp { .. } => "streamable_http",
            ExtensionKind::Frontend => "frontend",
            ExtensionKind::InlinePython { .. } => "inline_python",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Credential masking
// ─────────────────────────────────────────────────────────────────────────────

/// Mask a credential for storage: keep the first 8 and last 4 characters of
/// long keys, star out everything else.
pub fn mask_key(key: &str) -> String {
    if key.len() > 12 {
        format!(
            "{}{}{}",
            &key[..8],
            "*".repeat(key.len() - 12),
            &key[key.len() - 4..]
        )
    } else {
        "*".repeat(key.len())
    }
}

/// Hex sha-256 digest of an API key, for store lookups without the clear key
pub fn api_key_digest(key: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(key.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in [
            ProjectStatus::Inactive,
            ProjectStatus::Activating,
            ProjectStatus::Active,
            ProjectStatus::Deactivating,
            ProjectStatus::Error,
        ] {
            assert_eq!(ProjectStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(ProjectStatus::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ProjectStatus::Inactive.is_terminal());
        assert!(ProjectStatus::Active.is_terminal());
        assert!(ProjectStatus::Error.is_terminal());
        assert!(!ProjectStatus::Activating.is_terminal());
        assert!(!ProjectStatus::Deactivating.is_terminal());
    }

    #[test]
    fn test_mask_key_long() {
        let masked = mask_key("ghp_abcdefghijklmnop");
        assert!(masked.starts_with("ghp_abcd"));
        assert!(masked.ends_with("mnop"));
        assert!(masked.contains('*'));
        assert_eq!(masked.len(), "ghp_abcdefghijklmnop".len());
    }

    #[test]
    fn test_mask_key_short_is_fully_starred() {
        assert_eq!(mask_key("secret"), "******");
    }

    #[test]
    fn test_api_key_digest_is_stable_hex() {
        let a = api_key_digest("key-1");
        let b = api_key_digest("key-1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, api_key_digest("key-2"));
    }

    #[test]
    fn test_extension_kind_tags() {
        let ext = Extension {
            name: "files".into(),
            enabled: true,
            kind: ExtensionKind::Stdio {
                command: "npx".into(),
                args: vec!["-y".into(), "server-files".into()],
                env: Default::default(),
            },
        };
        let json = serde_json::to_value(&ext).unwrap();
        assert_eq!(json["kind"], "stdio");
        assert_eq!(json["command"], "npx");

        let back: Extension = serde_json::from_value(json).unwrap();
        assert_eq!(back, ext);
    }
}
