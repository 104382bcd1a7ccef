//! Kubernetes-backed [`Cluster`] implementation.
//!
//! Applies use server-side apply with a fixed field manager, which gives the
//! create-or-replace semantics the engine expects in one call. Client
//! construction infers configuration the standard way (kubeconfig, then
//! in-cluster service account).

use super::{Cluster, ExecOutput, PodStatusSummary, ResourceKind};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, ResourceQuota, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

const FIELD_MANAGER: &str = "agentplane";
/// Per-attempt timeout for agent health probes
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Load-balancer address polling
const LB_POLL_INTERVAL: Duration = Duration::from_secs(3);
const LB_POLL_ATTEMPTS: u32 = 20;

/// Production cluster adapter over kube-rs
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    http: reqwest::Client,
}

impl KubeCluster {
    /// Connect using inferred configuration (kubeconfig or in-cluster).
    /// Fails when no valid configuration is reachable, which callers treat
    /// as a fatal boot error.
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Orchestrator(format!("cluster client init failed: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(Error::orchestrator)?;
        Ok(Self { client, http })
    }

    fn apply_params() -> PatchParams {
        PatchParams::apply(FIELD_MANAGER).force()
    }

    async fn apply<K>(&self, namespace: &str, name: &str, obj: &K) -> Result<()>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + std::fmt::Debug
            + serde::Serialize
            + serde::de::DeserializeOwned,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &Self::apply_params(), &Patch::Apply(obj))
            .await?;
        debug!(namespace, name, "applied {}", K::kind(&()));
        Ok(())
    }

    async fn delete_ignoring_absent<K>(&self, namespace: &str, name: &str) -> Result<()>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + std::fmt::Debug
            + serde::de::DeserializeOwned,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Pick a pod matching the selector, preferring running ones
    async fn find_pod(&self, namespace: &str, selector: &str) -> Result<Pod> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(selector))
            .await?
            .items;
        pods.iter()
            .find(|p| pod_phase(p) == Some("Running"))
            .or_else(|| pods.first())
            .cloned()
            .ok_or_else(|| {
                Error::Orchestrator(format!("no pod matching {selector} in {namespace}"))
            })
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn ensure_namespace(&self, namespace: &Namespace, quota: &ResourceQuota) -> Result<()> {
        let name = meta_name(&namespace.metadata)?;
        let api: Api<Namespace> = Api::all(self.client.clone());

        match api.get_opt(&name).await? {
            // Present: converge labels toward the rendered spec
            Some(_) => {
                api.patch(&name, &Self::apply_params(), &Patch::Apply(namespace))
                    .await?;
            }
            None => match api.create(&PostParams::default(), namespace).await {
                Ok(_) => debug!(%name, "created namespace"),
                // Lost a create race; the namespace exists now
                Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                Err(e) => return Err(e.into()),
            },
        }

        let quota_name = meta_name(&quota.metadata)?;
        let quota_api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), &name);
        quota_api
            .patch(&quota_name, &Self::apply_params(), &Patch::Apply(quota))
            .await?;
        Ok(())
    }

    async fn apply_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()> {
        self.apply(namespace, &meta_name(&config_map.metadata)?, config_map)
            .await
    }

    async fn apply_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        self.apply(namespace, &meta_name(&secret.metadata)?, secret)
            .await
    }

    async fn apply_service(&self, namespace: &str, service: &Service) -> Result<()> {
        self.apply(namespace, &meta_name(&service.metadata)?, service)
            .await
    }

    async fn apply_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<()> {
        self.apply(namespace, &meta_name(&ingress.metadata)?, ingress)
            .await
    }

    async fn apply_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()> {
        self.apply(namespace, &meta_name(&deployment.metadata)?, deployment)
            .await
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.patch_scale(
            name,
            &PatchParams::default(),
            &Patch::Merge(json!({ "spec": { "replicas": replicas } })),
        )
        .await?;
        debug!(namespace, name, replicas, "scaled deployment");
        Ok(())
    }

    async fn annotate_pod_template(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": { key: value }
                    }
                }
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()> {
        match kind {
            ResourceKind::Deployment => {
                self.delete_ignoring_absent::<Deployment>(namespace, name).await
            }
            ResourceKind::Service => self.delete_ignoring_absent::<Service>(namespace, name).await,
            ResourceKind::Ingress => self.delete_ignoring_absent::<Ingress>(namespace, name).await,
            ResourceKind::Secret => self.delete_ignoring_absent::<Secret>(namespace, name).await,
            ResourceKind::ConfigMap => {
                self.delete_ignoring_absent::<ConfigMap>(namespace, name).await
            }
        }
    }

    async fn read_secret_key(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let Some(secret) = api.get_opt(name).await? else {
            return Ok(None);
        };
        let Some(data) = secret.data else {
            return Ok(None);
        };
        match data.get(key) {
            Some(bytes) => String::from_utf8(bytes.0.clone())
                .map(Some)
                .map_err(|_| Error::Orchestrator(format!("secret {name}/{key} is not UTF-8"))),
            None => Ok(None),
        }
    }

    async fn read_service_endpoint(&self, namespace: &str, name: &str) -> Result<String> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let service = api
            .get_opt(name)
            .await?
            .ok_or_else(|| Error::Orchestrator(format!("service {namespace}/{name} not found")))?;

        let service_type = service
            .spec
            .as_ref()
            .and_then(|s| s.type_.clone())
            .unwrap_or_else(|| "ClusterIP".to_string());

        if service_type != "LoadBalancer" {
            // Cluster-internal DNS; port 80 is implied by the rendered service
            return Ok(format!("{name}.{namespace}.svc.cluster.local"));
        }

        // Load balancers take time to get an address assigned
        for attempt in 0..LB_POLL_ATTEMPTS {
            let service = api.get_opt(name).await?.ok_or_else(|| {
                Error::Orchestrator(format!("service {namespace}/{name} disappeared"))
            })?;
            let address = service
                .status
                .as_ref()
                .and_then(|s| s.load_balancer.as_ref())
                .and_then(|lb| lb.ingress.as_ref())
                .and_then(|ingress| ingress.first())
                .and_then(|i| i.ip.clone().or_else(|| i.hostname.clone()));
            if let Some(address) = address {
                return Ok(address);
            }
            if attempt + 1 < LB_POLL_ATTEMPTS {
                tokio::time::sleep(LB_POLL_INTERVAL).await;
            }
        }
        Err(Error::Orchestrator(format!(
            "no external address assigned to {namespace}/{name}"
        )))
    }

    async fn get_pod_status(&self, namespace: &str, selector: &str) -> Result<PodStatusSummary> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(selector))
            .await?
            .items;

        let mut summary = PodStatusSummary::default();
        for pod in &pods {
            let running = pod_phase(pod) == Some("Running");
            if running {
                summary.running += 1;
            }
            if running && pod_ready(pod) {
                summary.ready = true;
            } else if summary.message.is_none() {
                summary.message = pod_diagnostic(pod);
            }
        }
        Ok(summary)
    }

    async fn exec_in_pod(
        &self,
        namespace: &str,
        selector: &str,
        argv: &[String],
    ) -> Result<ExecOutput> {
        let pod = self.find_pod(namespace, selector).await?;
        let pod_name = meta_name(&pod.metadata)?;

        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default().stdout(true).stderr(true);
        let mut attached = api.exec(&pod_name, argv.to_vec(), &params).await?;

        let mut stdout_reader = attached
            .stdout()
            .ok_or_else(|| Error::Orchestrator("exec stdout channel missing".into()))?;
        let mut stderr_reader = attached
            .stderr()
            .ok_or_else(|| Error::Orchestrator("exec stderr channel missing".into()))?;
        let status_fut = attached
            .take_status()
            .ok_or_else(|| Error::Orchestrator("exec status channel missing".into()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let (out_res, err_res, status) = tokio::join!(
            stdout_reader.read_to_end(&mut stdout),
            stderr_reader.read_to_end(&mut stderr),
            status_fut,
        );
        out_res.map_err(Error::orchestrator)?;
        err_res.map_err(Error::orchestrator)?;

        attached.join().await.map_err(Error::orchestrator)?;

        Ok(ExecOutput {
            exit_code: exit_code_from_status(status.as_ref()),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn probe_health(&self, url: &str) -> Result<bool> {
        match self.http.get(url).send().await {
            Ok(resp) => Ok(resp.status() == reqwest::StatusCode::OK),
            Err(e) => {
                warn!(url, error = %e, "health probe failed");
                Ok(false)
            }
        }
    }
}

fn meta_name(
    meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
) -> Result<String> {
    meta.name
        .clone()
        .ok_or_else(|| Error::Orchestrator("rendered object has no name".into()))
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// First useful diagnostic from a pod that is not ready
fn pod_diagnostic(pod: &Pod) -> Option<String> {
    let status = pod.status.as_ref()?;
    if let Some(statuses) = &status.container_statuses {
        for cs in statuses {
            if let Some(waiting) = cs.state.as_ref().and_then(|s| s.waiting.as_ref()) {
                let reason = waiting.reason.clone().unwrap_or_else(|| "Waiting".into());
                return Some(match &waiting.message {
                    Some(msg) => format!("{reason}: {msg}"),
                    None => reason,
                });
            }
        }
    }
    status
        .message
        .clone()
        .or_else(|| status.phase.as_ref().map(|p| format!("phase {p}")))
}

/// Convention: a Success status is exit 0, a NonZeroExitCode failure carries
/// the code in its cause details
fn exit_code_from_status(status: Option<&Status>) -> i32 {
    let Some(status) = status else {
        return 1;
    };
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
                .and_then(|c| c.message.as_ref())
                .and_then(|m| m.parse().ok())
        })
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};

    #[test]
    fn test_exit_code_success() {
        let status = Status {
            status: Some("Success".into()),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(Some(&status)), 0);
    }

    #[test]
    fn test_exit_code_from_cause_details() {
        let status = Status {
            status: Some("Failure".into()),
            reason: Some("NonZeroExitCode".into()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".into()),
                    message: Some("128".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(Some(&status)), 128);
    }

    #[test]
    fn test_exit_code_defaults_to_failure() {
        assert_eq!(exit_code_from_status(None), 1);
        let status = Status {
            status: Some("Failure".into()),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(Some(&status)), 1);
    }

    #[test]
    fn test_pod_ready_requires_true_condition() {
        use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
        let pod = Pod {
            status: Some(PodStatus {
                phase: Some("Running".into()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".into(),
                    status: "False".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!pod_ready(&pod));
    }
}
