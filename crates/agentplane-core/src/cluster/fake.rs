//! Scriptable in-memory [`Cluster`] used by unit tests.

use super::{Cluster, ExecOutput, PodStatusSummary, ResourceKind};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, ResourceQuota, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
pub struct FakeState {
    /// Applied objects in call order, as "kind/name"
    pub applied: Vec<String>,
    /// Deleted objects in call order, as "kind/name"
    pub deleted: Vec<String>,
    /// (namespace, name, replicas) per scale call
    pub scaled: Vec<(String, String, i32)>,
    /// (deployment, annotation key) per rolling-restart trigger
    pub annotated: Vec<(String, String)>,
    /// Secret contents keyed by (namespace, name, key)
    pub secrets: HashMap<(String, String, String), String>,
    /// Pods currently running (tracked through scale calls)
    pub running: usize,
    /// Number of status polls before pods report ready
    pub ready_after_polls: usize,
    pub polls: usize,
    /// Agent health probe outcome
    pub healthy: bool,
    /// Kinds whose apply calls fail, e.g. "deployment"
    pub fail_apply: HashSet<String>,
    /// Scripted exec results; defaults to success when empty
    pub exec_results: VecDeque<ExecOutput>,
    /// Recorded exec argv
    pub exec_calls: Vec<Vec<String>>,
}

pub struct FakeCluster {
    pub state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                healthy: true,
                ..Default::default()
            }),
        }
    }

    pub fn put_secret(&self, namespace: &str, name: &str, key: &str, value: &str) {
        self.state.lock().unwrap().secrets.insert(
            (namespace.to_string(), name.to_string(), key.to_string()),
            value.to_string(),
        );
    }

    pub fn applied(&self) -> Vec<String> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    fn record_apply(&self, kind: &str, name: Option<&String>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_apply.contains(kind) {
            return Err(Error::Orchestrator(format!("{kind} apply failed")));
        }
        state
            .applied
            .push(format!("{kind}/{}", name.cloned().unwrap_or_default()));
        Ok(())
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn ensure_namespace(&self, namespace: &Namespace, _quota: &ResourceQuota) -> Result<()> {
        self.record_apply("namespace", namespace.metadata.name.as_ref())
    }

    async fn apply_config_map(&self, _ns: &str, config_map: &ConfigMap) -> Result<()> {
        self.record_apply("configmap", config_map.metadata.name.as_ref())
    }

    async fn apply_secret(&self, ns: &str, secret: &Secret) -> Result<()> {
        self.record_apply("secret", secret.metadata.name.as_ref())?;
        let mut state = self.state.lock().unwrap();
        if let (Some(name), Some(data)) = (&secret.metadata.name, &secret.string_data) {
            for (key, value) in data {
                state.secrets.insert(
                    (ns.to_string(), name.clone(), key.clone()),
                    value.clone(),
                );
            }
        }
        Ok(())
    }

    async fn apply_service(&self, _ns: &str, service: &Service) -> Result<()> {
        self.record_apply("service", service.metadata.name.as_ref())
    }

    async fn apply_ingress(&self, _ns: &str, ingress: &Ingress) -> Result<()> {
        self.record_apply("ingress", ingress.metadata.name.as_ref())
    }

    async fn apply_deployment(&self, _ns: &str, deployment: &Deployment) -> Result<()> {
        self.record_apply("deployment", deployment.metadata.name.as_ref())?;
        let mut state = self.state.lock().unwrap();
        let replicas = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0);
        state.running = replicas.max(0) as usize;
        Ok(())
    }

    async fn scale_deployment(&self, ns: &str, name: &str, replicas: i32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .scaled
            .push((ns.to_string(), name.to_string(), replicas));
        state.running = replicas.max(0) as usize;
        Ok(())
    }

    async fn annotate_pod_template(
        &self,
        _ns: &str,
        name: &str,
        key: &str,
        _value: &str,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .annotated
            .push((name.to_string(), key.to_string()));
        Ok(())
    }

    async fn delete(&self, kind: ResourceKind, ns: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.deleted.push(format!("{}/{}", kind.as_str(), name));
        if kind == ResourceKind::Secret {
            state
                .secrets
                .retain(|(sns, sname, _), _| !(sns == ns && sname == name));
        }
        Ok(())
    }

    async fn read_secret_key(&self, ns: &str, name: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .secrets
            .get(&(ns.to_string(), name.to_string(), key.to_string()))
            .cloned())
    }

    async fn read_service_endpoint(&self, ns: &str, name: &str) -> Result<String> {
        Ok(format!("{name}.{ns}.svc.cluster.local"))
    }

    async fn get_pod_status(&self, _ns: &str, _selector: &str) -> Result<PodStatusSummary> {
        let mut state = self.state.lock().unwrap();
        state.polls += 1;
        let ready = state.running > 0 && state.polls > state.ready_after_polls;
        Ok(PodStatusSummary {
            running: state.running,
            ready,
            message: (!ready).then(|| "ContainerCreating".to_string()),
        })
    }

    async fn exec_in_pod(&self, _ns: &str, _sel: &str, argv: &[String]) -> Result<ExecOutput> {
        let mut state = self.state.lock().unwrap();
        state.exec_calls.push(argv.to_vec());
        Ok(state.exec_results.pop_front().unwrap_or(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }))
    }

    async fn probe_health(&self, _url: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().healthy)
    }
}
