//! Server configuration.
//!
//! Everything comes from the environment so the binary runs unchanged in and
//! out of the cluster. `AGENT_IMAGE` is the only required variable.

use agentplane_core::RenderSettings;
use anyhow::Context;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// User seeded at boot, mirroring an out-of-band provisioning step
#[derive(Debug, Clone, Deserialize)]
pub struct SeedUser {
    pub id: String,
    pub name: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for the control API
    pub bind_addr: SocketAddr,
    /// Metadata store location
    pub database_path: PathBuf,
    /// Agent container image
    pub agent_image: String,
    /// Port the agent listens on inside its container
    pub container_port: i32,
    /// Agent health endpoint path
    pub health_path: String,
    /// Base domain for per-project ingresses; no ingress when unset
    pub base_domain: Option<String>,
    pub ingress_class: Option<String>,
    /// TLS secret name pattern for ingresses; `{host}` is substituted
    pub tls_secret_pattern: Option<String>,
    /// Users provisioned at boot (JSON array in AGENTPLANE_USERS)
    pub seed_users: Vec<SeedUser>,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let bind_addr = env_or("AGENTPLANE_BIND", "0.0.0.0:8080")
            .parse()
            .context("invalid AGENTPLANE_BIND address")?;
        let database_path = PathBuf::from(env_or("AGENTPLANE_DB", "agentplane.db"));
        let agent_image =
            std::env::var("AGENT_IMAGE").context("AGENT_IMAGE must be set to the agent image")?;
        let container_port = env_or("AGENT_PORT", "3001")
            .parse()
            .context("invalid AGENT_PORT")?;
        let health_path = env_or("AGENT_HEALTH_PATH", "/api/v1/health");

        let seed_users = match std::env::var("AGENTPLANE_USERS") {
            Ok(raw) => serde_json::from_str(&raw).context("invalid AGENTPLANE_USERS JSON")?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            bind_addr,
            database_path,
            agent_image,
            container_port,
            health_path,
            base_domain: std::env::var("AGENTPLANE_BASE_DOMAIN").ok(),
            ingress_class: std::env::var("AGENTPLANE_INGRESS_CLASS").ok(),
            tls_secret_pattern: std::env::var("AGENTPLANE_TLS_SECRET_PATTERN").ok(),
            seed_users,
        })
    }

    pub fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            agent_image: self.agent_image.clone(),
            container_port: self.container_port,
            health_path: self.health_path.clone(),
            base_domain: self.base_domain.clone(),
            ingress_class: self.ingress_class.clone(),
            tls_secret_pattern: self.tls_secret_pattern.clone(),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_users_parse() {
        let raw = r#"[{"id":"u1","name":"User One","api_key":"wk-1"}]"#;
        let users: Vec<SeedUser> = serde_json::from_str(raw).unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, "u1");
        assert_eq!(users[0].api_key, "wk-1");
    }

    #[test]
    fn test_render_settings_carries_image_and_domain() {
        let config = Config {
            bind_addr: "127.0.0.1:8080".parse().unwrap(),
            database_path: PathBuf::from("test.db"),
            agent_image: "registry.local/agent:1".into(),
            container_port: 3001,
            health_path: "/api/v1/health".into(),
            base_domain: Some("agents.example.com".into()),
            ingress_class: Some("nginx".into()),
            tls_secret_pattern: None,
            seed_users: Vec::new(),
        };
        let settings = config.render_settings();
        assert_eq!(settings.agent_image, "registry.local/agent:1");
        assert_eq!(settings.base_domain.as_deref(), Some("agents.example.com"));
    }
}
