//! Lifecycle engine.
//!
//! Owns the project state machine and composes the metadata store, the
//! resource renderer and the cluster adapter. Every transition writes the new
//! status to the store before returning; transitions that touch the cluster
//! write the intermediate status first.
//!
//! Per-project serialization: each public transition holds the project's
//! async mutex for its duration. A second activate on the same project waits,
//! observes the state the first produced, and no-ops.

pub mod readiness;

use crate::cloner;
use crate::cluster::{Cluster, ResourceKind};
use crate::envres::{self, CredentialInputs};
use crate::error::{Error, Result};
use crate::render::{self, names, RenderSettings, ResourceBundle};
use crate::settings as setting_registry;
use crate::store::Store;
use crate::types::{
    mask_key, Extension, GithubKeySource, Project, ProjectStatus, User,
};
use chrono::Utc;
use self::readiness::ReadinessConfig;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

/// Annotation patched onto the pod template to trigger a rolling restart
const RESTART_ANNOTATION: &str = "agentplane.io/restarted-at";

/// Secret keys for stored credentials
const GITHUB_TOKEN_KEY: &str = "GITHUB_TOKEN";
const AGENT_API_KEY: &str = "AGENT_API_KEY";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub render: RenderSettings,
    pub readiness: ReadinessConfig,
    /// Overall budget for create/activate
    pub activation_budget: Duration,
    /// Budget for bounded control operations
    pub control_budget: Duration,
    /// Pod-drain polling during deactivation
    pub drain_poll: Duration,
    pub drain_timeout: Duration,
}

impl EngineConfig {
    pub fn new(render: RenderSettings) -> Self {
        Self {
            render,
            readiness: ReadinessConfig::default(),
            activation_budget: Duration::from_secs(150),
            control_budget: Duration::from_secs(30),
            drain_poll: Duration::from_secs(3),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of an activation, including a clone warning when the repository
/// could not be brought up but the agent itself is usable
#[derive(Debug, Clone)]
pub struct ActivationOutcome {
    pub project: Project,
    pub clone_warning: Option<String>,
}

/// Per-project async mutexes, created on demand
#[derive(Default)]
struct ProjectLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProjectLocks {
    async fn acquire(&self, project_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut map = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.entry(project_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

pub struct LifecycleEngine {
    store: Arc<Store>,
    cluster: Arc<dyn Cluster>,
    config: EngineConfig,
    locks: ProjectLocks,
}

impl LifecycleEngine {
    pub fn new(store: Arc<Store>, cluster: Arc<dyn Cluster>, config: EngineConfig) -> Self {
        Self {
            store,
            cluster,
            config,
            locks: ProjectLocks::default(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Public transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a project and bring it up. The response completes after the
    /// readiness wait and, when a repository is configured, after the clone
    /// attempt.
    pub async fn create_project(
        &self,
        user_id: &str,
        name: &str,
        repo_url: Option<String>,
        github_key: Option<String>,
    ) -> Result<ActivationOutcome> {
        if name.trim().is_empty() {
            return Err(Error::InvalidArgument("project name must not be empty".into()));
        }
        let user = self.require_user(user_id)?;
        let project_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        let (github_key_set, github_key_source, github_key_masked) = match &github_key {
            Some(key) => (true, Some(GithubKeySource::Project), Some(mask_key(key))),
            None if user.github_secret_name.is_some() => (true, Some(GithubKeySource::User), None),
            None => (false, None, None),
        };

        let project = Project {
            project_id: project_id.clone(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            status: ProjectStatus::Inactive,
            endpoint: None,
            repo_url: repo_url.clone(),
            has_repository: false,
            github_key_set,
            github_key_source,
            github_key_masked,
            last_error: None,
            sessions: Vec::new(),
            settings: BTreeMap::new(),
            extensions: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.store.create_project(&project)?;
        info!(project_id, user_id, "created project record");

        let _guard = self.locks.acquire(&project_id).await;
        let activation = tokio::time::timeout(
            self.config.activation_budget,
            self.provision(&user, &project_id, github_key.as_deref(), true),
        )
        .await
        .unwrap_or_else(|_| Err(Error::Orchestrator("activation budget exceeded".into())));

        match activation {
            Ok(()) => {
                let clone_warning = self.clone_if_configured(&user, &project_id).await;
                let project = self.require_project(&project_id)?;
                Ok(ActivationOutcome {
                    project,
                    clone_warning,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Bring an inactive or errored project back up. Objects are left in
    /// place on failure so a retry can reuse them.
    pub async fn activate_project(&self, project_id: &str) -> Result<ActivationOutcome> {
        let _guard = self.locks.acquire(project_id).await;
        let project = self.require_project(project_id)?;
        match project.status {
            // Collapsed concurrent activate: the state is already what the
            // caller asked for
            ProjectStatus::Active => {
                return Ok(ActivationOutcome {
                    project,
                    clone_warning: None,
                })
            }
            ProjectStatus::Inactive | ProjectStatus::Error => {}
            ProjectStatus::Activating | ProjectStatus::Deactivating => {
                return Err(Error::Conflict(project_id.to_string()))
            }
        }
        let user = self.require_user(&project.user_id)?;

        let activation = tokio::time::timeout(
            self.config.activation_budget,
            self.reactivate(&user, project_id),
        )
        .await
        .unwrap_or_else(|_| Err(Error::Orchestrator("activation budget exceeded".into())));

        match activation {
            Ok(()) => {
                let clone_warning = self.clone_if_configured(&user, project_id).await;
                let project = self.require_project(project_id)?;
                Ok(ActivationOutcome {
                    project,
                    clone_warning,
                })
            }
            Err(e) => {
                // No rollback here: a retry reuses the objects
                self.record_error(project_id, &e);
                Err(e)
            }
        }
    }

    /// Scale the project down. Scale-to-zero is best-effort: a drain timeout
    /// still lands in `inactive` and the next activate reconciles.
    pub async fn deactivate_project(&self, project_id: &str) -> Result<Project> {
        let _guard = self.locks.acquire(project_id).await;
        let project = self.require_project(project_id)?;
        match project.status {
            ProjectStatus::Inactive => return Ok(project),
            ProjectStatus::Active => {}
            _ => return Err(Error::Conflict(project_id.to_string())),
        }
        let namespace = names::namespace(&project.user_id);
        let workload = names::workload(project_id);

        self.store
            .set_project_status(project_id, ProjectStatus::Deactivating, None)?;
        self.cluster
            .scale_deployment(&namespace, &workload, 0)
            .await?;

        let selector = names::pod_selector(project_id);
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        loop {
            let status = self.cluster.get_pod_status(&namespace, &selector).await?;
            if status.running == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(project_id, "pods still terminating after drain timeout");
                break;
            }
            tokio::time::sleep(self.config.drain_poll).await;
        }

        self.store
            .set_project_status(project_id, ProjectStatus::Inactive, None)?;
        info!(project_id, "project deactivated");
        self.require_project(project_id)
    }

    /// Tear down the project's cluster objects and remove the record.
    /// Allowed from any state; object deletion failures are logged, not
    /// fatal. The shared namespace is never deleted here.
    pub async fn delete_project(&self, project_id: &str) -> Result<()> {
        let _guard = self.locks.acquire(project_id).await;
        let project = self.require_project(project_id)?;
        let namespace = names::namespace(&project.user_id);
        let workload = names::workload(project_id);

        let targets = [
            (ResourceKind::Ingress, workload.clone()),
            (ResourceKind::Service, workload.clone()),
            (ResourceKind::Deployment, workload.clone()),
            (ResourceKind::Secret, names::workload_secret(project_id)),
            (ResourceKind::ConfigMap, names::config_map(project_id)),
            (ResourceKind::Secret, names::project_github_secret(project_id)),
        ];
        self.with_control_budget(async {
            for (kind, name) in &targets {
                if let Err(e) = self.cluster.delete(*kind, &namespace, name).await {
                    warn!(project_id, kind = kind.as_str(), name = %name, error = %e, "delete failed");
                }
            }
            Ok(())
        })
        .await?;

        self.store.delete_project(project_id)?;
        info!(project_id, "project deleted");
        Ok(())
    }

    pub fn rename_project(&self, project_id: &str, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::InvalidArgument("project name must not be empty".into()));
        }
        let mut changes = BTreeMap::new();
        changes.insert("name".to_string(), Value::from(name));
        self.store.update_project_fields(project_id, &changes)
    }

    /// Run the repository clone against an already-active project
    pub async fn clone_repository(&self, project_id: &str) -> Result<()> {
        let _guard = self.locks.acquire(project_id).await;
        let project = self.require_project(project_id)?;
        if project.status != ProjectStatus::Active {
            return Err(Error::ProjectNotActive(project_id.to_string()));
        }
        let repo_url = project.repo_url.clone().ok_or_else(|| {
            Error::InvalidArgument("project has no repository configured".into())
        })?;
        let namespace = names::namespace(&project.user_id);

        let result = self
            .with_control_budget(cloner::clone_into_pod(
                self.cluster.as_ref(),
                &namespace,
                project_id,
                &repo_url,
            ))
            .await;
        match result {
            Ok(_) => {
                self.record_repo_state(project_id, true, None)?;
                Ok(())
            }
            Err(e) => {
                self.record_repo_state(project_id, false, Some(e.to_string()))?;
                Err(e)
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Settings and extensions
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply setting changes. Returns whether a rolling restart was
    /// triggered; the call returns once the restart annotation is written,
    /// not when new pods are ready.
    pub async fn update_settings(
        &self,
        project_id: &str,
        changes: &BTreeMap<String, Value>,
    ) -> Result<bool> {
        let project = self.require_project(project_id)?;

        // Validate everything before writing anything
        let mut coerced = Vec::with_capacity(changes.len());
        let mut restart_required = false;
        for (key, value) in changes {
            let def = setting_registry::lookup(key)?;
            coerced.push((def.key, setting_registry::coerce(def, value)?));
            restart_required |= def.requires_restart;
        }
        for (key, value) in coerced {
            self.store.set_setting(project_id, key, value)?;
        }

        self.refresh_if_active(&project, restart_required, false).await?;
        Ok(restart_required && project.status == ProjectStatus::Active)
    }

    /// Reset a setting to its declared default
    pub async fn remove_setting(&self, project_id: &str, key: &str) -> Result<bool> {
        let project = self.require_project(project_id)?;
        let def = setting_registry::lookup(key)?;
        self.store.remove_setting(project_id, key)?;
        self.refresh_if_active(&project, def.requires_restart, false).await?;
        Ok(def.requires_restart && project.status == ProjectStatus::Active)
    }

    /// Add or replace an extension. All extension changes require a restart
    /// to take effect.
    pub async fn upsert_extension(&self, project_id: &str, extension: Extension) -> Result<bool> {
        if extension.name.trim().is_empty() {
            return Err(Error::InvalidArgument("extension name must not be empty".into()));
        }
        let project = self.require_project(project_id)?;
        self.store.upsert_extension(project_id, &extension)?;
        self.refresh_if_active(&project, true, false).await?;
        Ok(project.status == ProjectStatus::Active)
    }

    pub async fn remove_extension(&self, project_id: &str, name: &str) -> Result<bool> {
        let project = self.require_project(project_id)?;
        if !self.store.remove_extension(project_id, name)? {
            return Err(Error::ExtensionNotFound(name.to_string()));
        }
        self.refresh_if_active(&project, true, false).await?;
        Ok(project.status == ProjectStatus::Active)
    }

    pub async fn toggle_extension(
        &self,
        project_id: &str,
        name: &str,
        enabled: bool,
    ) -> Result<bool> {
        let project = self.require_project(project_id)?;
        if !self.store.set_extension_enabled(project_id, name, enabled)? {
            return Err(Error::ExtensionNotFound(name.to_string()));
        }
        self.refresh_if_active(&project, true, false).await?;
        Ok(project.status == ProjectStatus::Active)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Credentials
    // ─────────────────────────────────────────────────────────────────────────

    /// Set or remove a project-scoped Git token. Removing falls back to the
    /// user's global token when one exists.
    pub async fn update_github_token(
        &self,
        project_id: &str,
        token: Option<String>,
    ) -> Result<()> {
        let _guard = self.locks.acquire(project_id).await;
        let project = self.require_project(project_id)?;
        let user = self.require_user(&project.user_id)?;
        let namespace = names::namespace(&project.user_id);
        let secret_name = names::project_github_secret(project_id);

        let mut changes = BTreeMap::new();
        match &token {
            Some(token) => {
                let secret =
                    render::credential_secret(&namespace, &secret_name, GITHUB_TOKEN_KEY, token);
                self.cluster.apply_secret(&namespace, &secret).await?;
                changes.insert("github_key_set".to_string(), Value::Bool(true));
                changes.insert("github_key_source".to_string(), Value::from("project"));
                changes.insert("github_key_masked".to_string(), Value::from(mask_key(token)));
            }
            None => {
                self.cluster
                    .delete(ResourceKind::Secret, &namespace, &secret_name)
                    .await?;
                changes.insert("github_key_masked".to_string(), Value::Null);
                if user.github_secret_name.is_some() {
                    changes.insert("github_key_set".to_string(), Value::Bool(true));
                    changes.insert("github_key_source".to_string(), Value::from("user"));
                } else {
                    changes.insert("github_key_set".to_string(), Value::Bool(false));
                    changes.insert("github_key_source".to_string(), Value::Null);
                }
            }
        }
        self.store.update_project_fields(project_id, &changes)?;

        let project = self.require_project(project_id)?;
        self.refresh_if_active(&project, true, true).await
    }

    /// Set or remove the user's global Git token, fanning the change out to
    /// every project that resolves through it. Restarting the same project
    /// twice is harmless, so the fan-out is at-least-once.
    pub async fn update_user_global_token(
        &self,
        user_id: &str,
        token: Option<String>,
    ) -> Result<()> {
        self.require_user(user_id)?;
        let namespace = names::namespace(user_id);
        let secret_name = names::user_github_secret(user_id);

        match &token {
            Some(token) => {
                let (ns_obj, quota) = render::namespace_objects(user_id);
                self.cluster.ensure_namespace(&ns_obj, &quota).await?;
                let secret =
                    render::credential_secret(&namespace, &secret_name, GITHUB_TOKEN_KEY, token);
                self.cluster.apply_secret(&namespace, &secret).await?;
                self.store
                    .set_user_github_key(user_id, Some(&mask_key(token)), Some(&secret_name))?;
            }
            None => {
                self.cluster
                    .delete(ResourceKind::Secret, &namespace, &secret_name)
                    .await?;
                self.store.set_user_github_key(user_id, None, None)?;
            }
        }

        for project in self.store.list_projects_by_user(user_id)? {
            let mut changes = BTreeMap::new();
            match &token {
                // Projects with their own token keep it (project > user)
                Some(_) if project.github_key_source != Some(GithubKeySource::Project) => {
                    changes.insert("github_key_set".to_string(), Value::Bool(true));
                    changes.insert("github_key_source".to_string(), Value::from("user"));
                }
                None if project.github_key_source == Some(GithubKeySource::User) => {
                    changes.insert("github_key_set".to_string(), Value::Bool(false));
                    changes.insert("github_key_source".to_string(), Value::Null);
                }
                _ => continue,
            }
            self.store
                .update_project_fields(&project.project_id, &changes)?;
            if let Err(e) = self.refresh_if_active(&project, true, true).await {
                // Keep fanning out; the next activate reconciles this one
                error!(project_id = %project.project_id, error = %e, "token fan-out failed");
            }
        }
        Ok(())
    }

    /// Store the user's workspace API key: cluster secret, masked copy, and
    /// the auth digest used to identify the caller.
    pub async fn set_user_api_key(&self, user_id: &str, key: &str) -> Result<()> {
        self.require_user(user_id)?;
        let namespace = names::namespace(user_id);
        let secret_name = names::user_api_secret(user_id);

        let (ns_obj, quota) = render::namespace_objects(user_id);
        self.cluster.ensure_namespace(&ns_obj, &quota).await?;
        let secret = render::credential_secret(&namespace, &secret_name, AGENT_API_KEY, key);
        self.cluster.apply_secret(&namespace, &secret).await?;

        self.store
            .set_user_api_key(user_id, Some(&mask_key(key)), Some(&secret_name))?;
        self.store
            .set_user_api_key_digest(user_id, &crate::types::api_key_digest(key))?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    /// Bound a control operation by the per-operation budget
    async fn with_control_budget<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.config.control_budget, fut)
            .await
            .unwrap_or_else(|_| Err(Error::Orchestrator("operation budget exceeded".into())))
    }

    fn require_user(&self, user_id: &str) -> Result<User> {
        self.store
            .get_user(user_id)?
            .ok_or_else(|| Error::UserNotFound(user_id.to_string()))
    }

    fn require_project(&self, project_id: &str) -> Result<Project> {
        self.store
            .get_project(project_id)?
            .ok_or_else(|| Error::ProjectNotFound(project_id.to_string()))
    }

    /// Read the clear credentials out of the cluster's secret store
    async fn credential_inputs(
        &self,
        user: &User,
        project_id: &str,
        provided_github_key: Option<&str>,
    ) -> Result<CredentialInputs> {
        let namespace = names::namespace(&user.user_id);
        let project_github_token = match provided_github_key {
            Some(key) => Some(key.to_string()),
            None => {
                self.cluster
                    .read_secret_key(
                        &namespace,
                        &names::project_github_secret(project_id),
                        GITHUB_TOKEN_KEY,
                    )
                    .await?
            }
        };
        let user_github_token = match &user.github_secret_name {
            Some(name) => {
                self.cluster
                    .read_secret_key(&namespace, name, GITHUB_TOKEN_KEY)
                    .await?
            }
            None => None,
        };
        let user_api_key = match &user.api_secret_name {
            Some(name) => {
                self.cluster
                    .read_secret_key(&namespace, name, AGENT_API_KEY)
                    .await?
            }
            None => None,
        };
        Ok(CredentialInputs {
            project_github_token,
            user_github_token,
            project_api_key: None,
            user_api_key,
        })
    }

    async fn render_bundle(
        &self,
        user: &User,
        project_id: &str,
        replicas: i32,
        provided_github_key: Option<&str>,
    ) -> Result<ResourceBundle> {
        let project = self.require_project(project_id)?;
        let creds = self
            .credential_inputs(user, project_id, provided_github_key)
            .await?;
        let env = envres::resolve(user, &project, &creds)?;
        Ok(render::render(
            &user.user_id,
            project_id,
            replicas,
            &env,
            &self.config.render,
        ))
    }

    /// First-time provisioning: apply everything, wait for readiness, record
    /// the endpoint. On failure, roll back the objects applied in this call
    /// (the shared namespace stays) and record the error state.
    async fn provision(
        &self,
        user: &User,
        project_id: &str,
        github_key: Option<&str>,
        rollback_on_failure: bool,
    ) -> Result<()> {
        self.store
            .set_project_status(project_id, ProjectStatus::Activating, None)?;

        let namespace = names::namespace(&user.user_id);
        let mut created: Vec<(ResourceKind, String)> = Vec::new();

        let result = self
            .apply_and_wait(user, project_id, github_key, &namespace, &mut created)
            .await;

        match result {
            Ok(endpoint) => {
                let mut changes = BTreeMap::new();
                changes.insert("status".to_string(), Value::from("active"));
                changes.insert("endpoint".to_string(), Value::from(endpoint));
                changes.insert("last_error".to_string(), Value::Null);
                self.store.update_project_fields(project_id, &changes)?;
                info!(project_id, "project active");
                Ok(())
            }
            Err(e) => {
                if rollback_on_failure {
                    for (kind, name) in created.iter().rev() {
                        if let Err(del) = self.cluster.delete(*kind, &namespace, name).await {
                            warn!(project_id, name = %name, error = %del, "rollback delete failed");
                        }
                    }
                }
                self.record_error(project_id, &e);
                Err(e)
            }
        }
    }

    async fn apply_and_wait(
        &self,
        user: &User,
        project_id: &str,
        github_key: Option<&str>,
        namespace: &str,
        created: &mut Vec<(ResourceKind, String)>,
    ) -> Result<String> {
        let bundle = self
            .render_bundle(user, project_id, 1, github_key)
            .await?;

        self.cluster
            .ensure_namespace(&bundle.namespace, &bundle.quota)
            .await?;

        if let Some(key) = github_key {
            let name = names::project_github_secret(project_id);
            let secret = render::credential_secret(namespace, &name, GITHUB_TOKEN_KEY, key);
            self.cluster.apply_secret(namespace, &secret).await?;
            created.push((ResourceKind::Secret, name));
        }

        // Secret and config map go first so the deployment's pods find them
        // on first mount
        self.cluster.apply_secret(namespace, &bundle.secret).await?;
        created.push((
            ResourceKind::Secret,
            names::workload_secret(project_id),
        ));
        self.cluster
            .apply_config_map(namespace, &bundle.config_map)
            .await?;
        created.push((ResourceKind::ConfigMap, names::config_map(project_id)));
        self.cluster
            .apply_service(namespace, &bundle.service)
            .await?;
        created.push((ResourceKind::Service, names::workload(project_id)));
        if let Some(ingress) = &bundle.ingress {
            self.cluster.apply_ingress(namespace, ingress).await?;
            created.push((ResourceKind::Ingress, names::workload(project_id)));
        }
        self.cluster
            .apply_deployment(namespace, &bundle.deployment)
            .await?;
        created.push((ResourceKind::Deployment, names::workload(project_id)));

        self.await_endpoint(project_id, namespace).await
    }

    /// Reactivation path: refresh config and secrets, scale up, wait
    async fn reactivate(&self, user: &User, project_id: &str) -> Result<()> {
        self.store
            .set_project_status(project_id, ProjectStatus::Activating, None)?;
        let namespace = names::namespace(&user.user_id);

        let bundle = self.render_bundle(user, project_id, 1, None).await?;
        self.cluster.apply_secret(&namespace, &bundle.secret).await?;
        self.cluster
            .apply_config_map(&namespace, &bundle.config_map)
            .await?;
        self.cluster
            .scale_deployment(&namespace, &names::workload(project_id), 1)
            .await?;

        let endpoint = self.await_endpoint(project_id, &namespace).await?;
        let mut changes = BTreeMap::new();
        changes.insert("status".to_string(), Value::from("active"));
        changes.insert("endpoint".to_string(), Value::from(endpoint));
        changes.insert("last_error".to_string(), Value::Null);
        self.store.update_project_fields(project_id, &changes)?;
        info!(project_id, "project active");
        Ok(())
    }

    async fn await_endpoint(&self, project_id: &str, namespace: &str) -> Result<String> {
        let endpoint = self
            .cluster
            .read_service_endpoint(namespace, &names::workload(project_id))
            .await?;
        let health_url = format!("http://{endpoint}{}", self.config.render.health_path);
        readiness::wait_for_ready(
            self.cluster.as_ref(),
            namespace,
            project_id,
            &health_url,
            &self.config.readiness,
        )
        .await?;
        Ok(endpoint)
    }

    /// Clone after a successful activation; failure is recorded on the
    /// project but never takes it out of the active state
    async fn clone_if_configured(&self, user: &User, project_id: &str) -> Option<String> {
        let project = self.store.get_project(project_id).ok().flatten()?;
        let repo_url = project.repo_url.clone()?;
        let namespace = names::namespace(&user.user_id);

        match cloner::clone_into_pod(self.cluster.as_ref(), &namespace, project_id, &repo_url)
            .await
        {
            Ok(_) => {
                if let Err(e) = self.record_repo_state(project_id, true, None) {
                    warn!(project_id, error = %e, "failed to record repository state");
                }
                None
            }
            Err(e) => {
                let warning = e.to_string();
                if let Err(store_err) =
                    self.record_repo_state(project_id, false, Some(warning.clone()))
                {
                    warn!(project_id, error = %store_err, "failed to record clone failure");
                }
                Some(warning)
            }
        }
    }

    fn record_repo_state(
        &self,
        project_id: &str,
        has_repository: bool,
        last_error: Option<String>,
    ) -> Result<()> {
        let mut changes = BTreeMap::new();
        changes.insert("has_repository".to_string(), Value::Bool(has_repository));
        changes.insert(
            "last_error".to_string(),
            last_error.map(Value::from).unwrap_or(Value::Null),
        );
        self.store.update_project_fields(project_id, &changes)
    }

    fn record_error(&self, project_id: &str, cause: &Error) {
        let mut changes = BTreeMap::new();
        changes.insert("status".to_string(), Value::from("error"));
        changes.insert("endpoint".to_string(), Value::Null);
        changes.insert("last_error".to_string(), Value::from(cause.to_string()));
        if let Err(e) = self.store.update_project_fields(project_id, &changes) {
            error!(project_id, error = %e, "failed to record error state");
        }
    }

    /// Push the current config (and optionally the workload secret) to the
    /// cluster and trigger a restart when the project is active
    async fn refresh_if_active(
        &self,
        project: &Project,
        restart: bool,
        include_secret: bool,
    ) -> Result<()> {
        if project.status != ProjectStatus::Active {
            return Ok(());
        }
        let user = self.require_user(&project.user_id)?;
        let namespace = names::namespace(&project.user_id);
        let bundle = self
            .render_bundle(&user, &project.project_id, 1, None)
            .await?;

        self.cluster
            .apply_config_map(&namespace, &bundle.config_map)
            .await?;
        if include_secret {
            self.cluster.apply_secret(&namespace, &bundle.secret).await?;
        }
        if restart {
            self.cluster
                .annotate_pod_template(
                    &namespace,
                    &names::workload(&project.project_id),
                    RESTART_ANNOTATION,
                    &Utc::now().to_rfc3339(),
                )
                .await?;
            info!(project_id = %project.project_id, "rolling restart triggered");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::types::ExtensionKind;
    use serde_json::json;

    fn render_settings() -> RenderSettings {
        RenderSettings {
            agent_image: "registry.local/agent:1".into(),
            container_port: 3001,
            health_path: "/api/v1/health".into(),
            base_domain: None,
            ingress_class: None,
            tls_secret_pattern: None,
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            render: render_settings(),
            readiness: ReadinessConfig {
                poll_interval: Duration::from_millis(2),
                total_timeout: Duration::from_millis(60),
            },
            activation_budget: Duration::from_secs(5),
            control_budget: Duration::from_secs(5),
            drain_poll: Duration::from_millis(2),
            drain_timeout: Duration::from_millis(40),
        }
    }

    /// Store with a seeded user whose workspace key secret exists
    fn seeded(cluster: &FakeCluster) -> Arc<Store> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.upsert_user("u1", "User One").unwrap();
        store
            .set_user_api_key("u1", Some("wk-user*"), Some(&names::user_api_secret("u1")))
            .unwrap();
        cluster.put_secret(
            "user-u1",
            &names::user_api_secret("u1"),
            AGENT_API_KEY,
            "wk-user",
        );
        store
    }

    fn engine(store: Arc<Store>, cluster: Arc<FakeCluster>) -> LifecycleEngine {
        LifecycleEngine::new(store, cluster, fast_config())
    }

    #[tokio::test]
    async fn test_create_project_happy_path() {
        let cluster = Arc::new(FakeCluster::new());
        let store = seeded(&cluster);
        let engine = engine(store.clone(), cluster.clone());

        let outcome = engine
            .create_project("u1", "demo", None, None)
            .await
            .unwrap();
        let project = outcome.project;
        assert_eq!(project.status, ProjectStatus::Active);
        let pid = project.project_id.clone();
        assert_eq!(
            project.endpoint.as_deref(),
            Some(format!("proj-{pid}-api.user-u1.svc.cluster.local").as_str())
        );
        assert!(outcome.clone_warning.is_none());

        // Apply ordering: namespace, then secret and config map before the
        // deployment
        let applied = cluster.applied();
        assert_eq!(applied[0], "namespace/user-u1");
        let secret_pos = applied
            .iter()
            .position(|a| a == &format!("secret/proj-{pid}-secrets"))
            .unwrap();
        let deploy_pos = applied
            .iter()
            .position(|a| a == &format!("deployment/proj-{pid}-api"))
            .unwrap();
        assert!(secret_pos < deploy_pos);
    }

    #[tokio::test]
    async fn test_create_rolls_back_on_apply_failure() {
        let cluster = Arc::new(FakeCluster::new());
        cluster
            .state
            .lock()
            .unwrap()
            .fail_apply
            .insert("deployment".into());
        let store = seeded(&cluster);
        let engine = engine(store.clone(), cluster.clone());

        let err = engine.create_project("u1", "demo", None, None).await;
        assert!(matches!(err, Err(Error::Orchestrator(_))));

        // Everything applied in this call was rolled back, newest first
        let deleted = cluster.deleted();
        assert!(deleted.iter().any(|d| d.starts_with("service/")));
        assert!(deleted.iter().any(|d| d.starts_with("secret/")));
        assert!(deleted.iter().any(|d| d.starts_with("configmap/")));
        // The shared namespace stays
        assert!(!deleted.iter().any(|d| d.starts_with("namespace/")));

        // The record stays, in error state, without an endpoint
        let projects = store.list_projects_by_user("u1").unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].status, ProjectStatus::Error);
        assert!(projects[0].endpoint.is_none());
        assert!(projects[0].last_error.is_some());
    }

    #[tokio::test]
    async fn test_create_readiness_timeout_sets_error() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.state.lock().unwrap().healthy = false;
        let store = seeded(&cluster);
        let engine = engine(store.clone(), cluster.clone());

        let err = engine.create_project("u1", "demo", None, None).await;
        assert!(matches!(err, Err(Error::ReadinessTimeout(_, _))));

        let project = &store.list_projects_by_user("u1").unwrap()[0];
        assert_eq!(project.status, ProjectStatus::Error);
    }

    #[tokio::test]
    async fn test_activate_is_idempotent_when_active() {
        let cluster = Arc::new(FakeCluster::new());
        let store = seeded(&cluster);
        let engine = engine(store.clone(), cluster.clone());

        let created = engine
            .create_project("u1", "demo", None, None)
            .await
            .unwrap();
        let endpoint = created.project.endpoint.clone();

        let again = engine
            .activate_project(&created.project.project_id)
            .await
            .unwrap();
        assert_eq!(again.project.status, ProjectStatus::Active);
        assert_eq!(again.project.endpoint, endpoint);
    }

    #[tokio::test]
    async fn test_activate_after_deactivate_rescales() {
        let cluster = Arc::new(FakeCluster::new());
        let store = seeded(&cluster);
        let engine = engine(store.clone(), cluster.clone());

        let pid = engine
            .create_project("u1", "demo", None, None)
            .await
            .unwrap()
            .project
            .project_id;

        let project = engine.deactivate_project(&pid).await.unwrap();
        assert_eq!(project.status, ProjectStatus::Inactive);
        assert!(project.endpoint.is_none());
        assert!(cluster
            .state
            .lock()
            .unwrap()
            .scaled
            .iter()
            .any(|(_, _, r)| *r == 0));

        let outcome = engine.activate_project(&pid).await.unwrap();
        assert_eq!(outcome.project.status, ProjectStatus::Active);
        assert!(cluster
            .state
            .lock()
            .unwrap()
            .scaled
            .iter()
            .any(|(_, _, r)| *r == 1));
    }

    #[tokio::test]
    async fn test_activate_failure_keeps_objects() {
        let cluster = Arc::new(FakeCluster::new());
        let store = seeded(&cluster);
        let engine = engine(store.clone(), cluster.clone());

        let pid = engine
            .create_project("u1", "demo", None, None)
            .await
            .unwrap()
            .project
            .project_id;
        engine.deactivate_project(&pid).await.unwrap();

        cluster.state.lock().unwrap().healthy = false;
        let before = cluster.deleted().len();
        let err = engine.activate_project(&pid).await;
        assert!(matches!(err, Err(Error::ReadinessTimeout(_, _))));
        // No rollback on activate: a retry reuses the objects
        assert_eq!(cluster.deleted().len(), before);

        let project = store.get_project(&pid).unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Error);
        assert!(project.last_error.is_some());
    }

    #[tokio::test]
    async fn test_delete_project_removes_objects_and_record() {
        let cluster = Arc::new(FakeCluster::new());
        let store = seeded(&cluster);
        let engine = engine(store.clone(), cluster.clone());

        let pid = engine
            .create_project("u1", "demo", None, None)
            .await
            .unwrap()
            .project
            .project_id;

        engine.delete_project(&pid).await.unwrap();
        assert!(store.get_project(&pid).unwrap().is_none());

        let deleted = cluster.deleted();
        assert!(deleted.contains(&format!("service/proj-{pid}-api")));
        assert!(deleted.contains(&format!("deployment/proj-{pid}-api")));
        assert!(deleted.contains(&format!("configmap/proj-{pid}-env")));

        // Deleting again is NotFound and touches nothing
        let count = cluster.deleted().len();
        assert!(matches!(
            engine.delete_project(&pid).await,
            Err(Error::ProjectNotFound(_))
        ));
        assert_eq!(cluster.deleted().len(), count);
    }

    #[tokio::test]
    async fn test_project_token_beats_user_token_in_workload_secret() {
        let cluster = Arc::new(FakeCluster::new());
        let store = seeded(&cluster);
        store
            .set_user_github_key("u1", Some("T_user***"), Some(&names::user_github_secret("u1")))
            .unwrap();
        cluster.put_secret(
            "user-u1",
            &names::user_github_secret("u1"),
            GITHUB_TOKEN_KEY,
            "T_user",
        );
        let engine = engine(store.clone(), cluster.clone());

        let project = engine
            .create_project("u1", "demo", None, Some("T_proj".into()))
            .await
            .unwrap()
            .project;
        let pid = project.project_id.clone();
        assert_eq!(project.github_key_source, Some(GithubKeySource::Project));

        let token = cluster
            .state
            .lock()
            .unwrap()
            .secrets
            .get(&(
                "user-u1".to_string(),
                names::workload_secret(&pid),
                GITHUB_TOKEN_KEY.to_string(),
            ))
            .cloned();
        assert_eq!(token.as_deref(), Some("T_proj"));

        // Dropping the project token falls back to the user token
        engine.update_github_token(&pid, None).await.unwrap();
        let project = store.get_project(&pid).unwrap().unwrap();
        assert!(project.github_key_set);
        assert_eq!(project.github_key_source, Some(GithubKeySource::User));

        let token = cluster
            .state
            .lock()
            .unwrap()
            .secrets
            .get(&(
                "user-u1".to_string(),
                names::workload_secret(&pid),
                GITHUB_TOKEN_KEY.to_string(),
            ))
            .cloned();
        assert_eq!(token.as_deref(), Some("T_user"));
    }

    #[tokio::test]
    async fn test_user_token_fanout_marks_projects_and_restarts_active() {
        let cluster = Arc::new(FakeCluster::new());
        let store = seeded(&cluster);
        let engine = engine(store.clone(), cluster.clone());

        let pid = engine
            .create_project("u1", "demo", None, None)
            .await
            .unwrap()
            .project
            .project_id;

        engine
            .update_user_global_token("u1", Some("T_user".into()))
            .await
            .unwrap();

        let project = store.get_project(&pid).unwrap().unwrap();
        assert!(project.github_key_set);
        assert_eq!(project.github_key_source, Some(GithubKeySource::User));
        assert!(!cluster.state.lock().unwrap().annotated.is_empty());

        // Removal clears the flags again
        engine.update_user_global_token("u1", None).await.unwrap();
        let project = store.get_project(&pid).unwrap().unwrap();
        assert!(!project.github_key_set);
        assert_eq!(project.github_key_source, None);
    }

    #[tokio::test]
    async fn test_settings_restart_only_when_required() {
        let cluster = Arc::new(FakeCluster::new());
        let store = seeded(&cluster);
        let engine = engine(store.clone(), cluster.clone());

        let pid = engine
            .create_project("u1", "demo", None, None)
            .await
            .unwrap()
            .project
            .project_id;

        let mut changes = BTreeMap::new();
        changes.insert("temperature".to_string(), json!(0.2));
        let restarted = engine.update_settings(&pid, &changes).await.unwrap();
        assert!(!restarted);
        assert!(cluster.state.lock().unwrap().annotated.is_empty());

        let mut changes = BTreeMap::new();
        changes.insert("model".to_string(), json!("frontier-1"));
        let restarted = engine.update_settings(&pid, &changes).await.unwrap();
        assert!(restarted);
        assert_eq!(cluster.state.lock().unwrap().annotated.len(), 1);

        let mut changes = BTreeMap::new();
        changes.insert("bogus".to_string(), json!(1));
        assert!(matches!(
            engine.update_settings(&pid, &changes).await,
            Err(Error::UnknownSetting(_))
        ));
    }

    #[tokio::test]
    async fn test_extension_changes_always_restart_active_project() {
        let cluster = Arc::new(FakeCluster::new());
        let store = seeded(&cluster);
        let engine = engine(store.clone(), cluster.clone());

        let pid = engine
            .create_project("u1", "demo", None, None)
            .await
            .unwrap()
            .project
            .project_id;

        let restarted = engine
            .upsert_extension(
                &pid,
                Extension {
                    name: "files".into(),
                    enabled: true,
                    kind: ExtensionKind::Builtin,
                },
            )
            .await
            .unwrap();
        assert!(restarted);

        assert!(matches!(
            engine.toggle_extension(&pid, "missing", true).await,
            Err(Error::ExtensionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_clone_failure_does_not_fail_activation() {
        let cluster = Arc::new(FakeCluster::new());
        cluster
            .state
            .lock()
            .unwrap()
            .exec_results
            .push_back(crate::cluster::ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "auth failed".into(),
            });
        let store = seeded(&cluster);
        let engine = engine(store.clone(), cluster.clone());

        let outcome = engine
            .create_project("u1", "demo", Some("https://example.com/r.git".into()), None)
            .await
            .unwrap();
        assert_eq!(outcome.project.status, ProjectStatus::Active);
        assert!(outcome.clone_warning.is_some());
        assert!(!outcome.project.has_repository);
        assert!(outcome.project.last_error.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_activations_collapse() {
        let cluster = Arc::new(FakeCluster::new());
        let store = seeded(&cluster);
        let engine = Arc::new(engine(store.clone(), cluster.clone()));

        let pid = engine
            .create_project("u1", "demo", None, None)
            .await
            .unwrap()
            .project
            .project_id;
        engine.deactivate_project(&pid).await.unwrap();

        let (a, b) = tokio::join!(engine.activate_project(&pid), engine.activate_project(&pid));
        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.project.status, ProjectStatus::Active);
        assert_eq!(b.project.status, ProjectStatus::Active);
        assert_eq!(a.project.endpoint, b.project.endpoint);
    }

    #[tokio::test]
    async fn test_clone_repository_requires_active() {
        let cluster = Arc::new(FakeCluster::new());
        let store = seeded(&cluster);
        let engine = engine(store.clone(), cluster.clone());

        let pid = engine
            .create_project("u1", "demo", Some("https://example.com/r.git".into()), None)
            .await
            .unwrap()
            .project
            .project_id;
        engine.deactivate_project(&pid).await.unwrap();

        assert!(matches!(
            engine.clone_repository(&pid).await,
            Err(Error::ProjectNotActive(_))
        ));
    }
}
