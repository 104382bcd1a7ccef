//! Cluster adapter: a typed façade over the orchestrator's imperative API.
//!
//! The lifecycle engine talks to the cluster exclusively through the
//! [`Cluster`] trait so tests can exercise transitions against a scripted
//! fake. The production implementation lives in [`kube_cluster`].
//!
//! Concurrency contract: every operation is individually serializable.
//! Creates treat "already exists" as success, deletes treat "not found" as
//! success.

#[cfg(test)]
pub(crate) mod fake;
mod kube_cluster;

pub use kube_cluster::KubeCluster;

use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, ResourceQuota, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;

/// Kinds the adapter can delete by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Deployment,
    Service,
    Ingress,
    Secret,
    ConfigMap,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "deployment",
            ResourceKind::Service => "service",
            ResourceKind::Ingress => "ingress",
            ResourceKind::Secret => "secret",
            ResourceKind::ConfigMap => "configmap",
        }
    }
}

/// Snapshot of pod state behind a label selector
#[derive(Debug, Clone, Default)]
pub struct PodStatusSummary {
    /// Pods whose phase is Running
    pub running: usize,
    /// At least one running pod reports a Ready condition of True
    pub ready: bool,
    /// Diagnostic detail from the first non-ready pod, if any
    pub message: Option<String>,
}

/// Captured output of a pod exec
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Imperative cluster operations used by the lifecycle engine
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Create the namespace if missing; converge labels and quota if present
    async fn ensure_namespace(&self, namespace: &Namespace, quota: &ResourceQuota) -> Result<()>;

    async fn apply_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()>;
    async fn apply_secret(&self, namespace: &str, secret: &Secret) -> Result<()>;
    async fn apply_service(&self, namespace: &str, service: &Service) -> Result<()>;
    async fn apply_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<()>;
    async fn apply_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()>;

    /// Set the replica count; idempotent
    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;

    /// Patch an annotation onto the deployment's pod template, causing the
    /// deployment controller to roll pods under its normal strategy
    async fn annotate_pod_template(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()>;

    /// Best-effort delete; absence is not an error
    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()>;

    /// Read a single key out of a secret, decoded to UTF-8
    async fn read_secret_key(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>>;

    /// Resolve a service to a host reachable from the control plane
    async fn read_service_endpoint(&self, namespace: &str, name: &str) -> Result<String>;

    /// Phase and readiness of pods matching `selector`
    async fn get_pod_status(&self, namespace: &str, selector: &str) -> Result<PodStatusSummary>;

    /// Run `argv` inside a pod matching `selector`, capturing output
    async fn exec_in_pod(
        &self,
        namespace: &str,
        selector: &str,
        argv: &[String],
    ) -> Result<ExecOutput>;

    /// HTTP GET against the agent health URL; true on 200
    async fn probe_health(&self, url: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_kind_names() {
        assert_eq!(ResourceKind::ConfigMap.as_str(), "configmap");
        assert_eq!(ResourceKind::Deployment.as_str(), "deployment");
    }

    #[test]
    fn test_exec_output_success() {
        let ok = ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        };
        let failed = ExecOutput {
            exit_code: 128,
            stdout: String::new(),
            stderr: "fatal: repository not found".into(),
        };
        assert!(ok.success());
        assert!(!failed.success());
    }
}
