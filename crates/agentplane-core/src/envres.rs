//! Environment resolution for a project's agent container.
//!
//! Pure function from `(user, project, clear credentials)` to the env map
//! split into non-secret config and secret material. The clear credential
//! values are read out of the cluster's secret store by the lifecycle engine
//! before calling in here; the metadata store never holds them.

use crate::error::{Error, Result};
use crate::settings::{self, SETTINGS};
use crate::types::{GithubKeySource, Project, User};
use std::collections::BTreeMap;

/// Clear credential values fetched from the cluster secret store
#[derive(Debug, Clone, Default)]
pub struct CredentialInputs {
    pub project_github_token: Option<String>,
    pub user_github_token: Option<String>,
    pub project_api_key: Option<String>,
    pub user_api_key: Option<String>,
}

/// Resolved environment for the agent container.
///
/// `config` feeds the config map, `secrets` the workload secret. Both use
/// ordered maps so rendering is deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEnv {
    pub config: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
    pub github_source: Option<GithubKeySource>,
}

/// Resolve the full environment for `project` owned by `user`.
///
/// Token precedence: project token over user global token. The workspace API
/// key is required; resolution fails when neither the project nor the user
/// provides one.
pub fn resolve(user: &User, project: &Project, creds: &CredentialInputs) -> Result<ResolvedEnv> {
    let mut config = BTreeMap::new();
    let mut secrets = BTreeMap::new();

    config.insert("USER_ID".to_string(), user.user_id.clone());
    config.insert("PROJECT_ID".to_string(), project.project_id.clone());

    // Git token: project wins over user global
    let github_source = match (&creds.project_github_token, &creds.user_github_token) {
        (Some(token), _) => {
            secrets.insert("GITHUB_TOKEN".to_string(), token.clone());
            Some(GithubKeySource::Project)
        }
        (None, Some(token)) => {
            secrets.insert("GITHUB_TOKEN".to_string(), token.clone());
            Some(GithubKeySource::User)
        }
        (None, None) => None,
    };

    let api_key = creds
        .project_api_key
        .clone()
        .or_else(|| creds.user_api_key.clone())
        .ok_or_else(|| {
            Error::InvalidArgument(format!(
                "no workspace API key available for project {}",
                project.project_id
            ))
        })?;
    secrets.insert("AGENT_API_KEY".to_string(), api_key);

    // Settings: explicit value, else declared default, else omitted
    for def in SETTINGS {
        let value = match project.settings.get(def.key) {
            Some(explicit) => Some(settings::coerce(def, explicit)?),
            None => match def.default {
                Some(default) => {
                    Some(settings::coerce(def, &serde_json::Value::String(default.to_string()))?)
                }
                None => None,
            },
        };
        if let Some(value) = value {
            config.insert(def.env_var.to_string(), settings::to_env_string(&value));
        }
    }

    // Enabled extensions, serialized canonically (objects carry sorted keys)
    let enabled: Vec<_> = project.extensions.iter().filter(|e| e.enabled).collect();
    config.insert(
        "AGENT_EXTENSIONS".to_string(),
        serde_json::to_value(&enabled)?.to_string(),
    );

    Ok(ResolvedEnv {
        config,
        secrets,
        github_source,
    })
}
