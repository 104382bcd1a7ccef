//! Resource renderer: pure function from `(user, project, resolved env)` to
//! the cluster objects backing a project.
//!
//! The renderer owns the naming scheme; every other component computes object
//! names through [`names`]. Same inputs produce identical specifications, so
//! re-applying a bundle is always safe.

use crate::envres::ResolvedEnv;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EnvFromSource, HTTPGetAction,
    Namespace, PodSpec, PodTemplateSpec, Probe, ResourceQuota, ResourceQuotaSpec,
    ResourceRequirements, Secret, SecretEnvSource, SecurityContext, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

pub const MANAGED_BY: &str = "agentplane";

/// Canonical object names. Other components must call in here instead of
/// formatting names themselves.
pub mod names {
    /// Shared namespace for all of a user's projects
    pub fn namespace(user_id: &str) -> String {
        format!("user-{user_id}")
    }

    pub fn config_map(project_id: &str) -> String {
        format!("proj-{project_id}-env")
    }

    /// Workload secret carrying the resolved credentials
    pub fn workload_secret(project_id: &str) -> String {
        format!("proj-{project_id}-secrets")
    }

    /// Deployment, service and ingress share this name
    pub fn workload(project_id: &str) -> String {
        format!("proj-{project_id}-api")
    }

    pub fn pod_selector(project_id: &str) -> String {
        format!("app={}", workload(project_id))
    }

    pub fn ingress_host(project_id: &str, user_id: &str, base_domain: &str) -> String {
        format!("{project_id}-{user_id}.{base_domain}")
    }

    /// Secret owned by the project, holding its own Git token
    pub fn project_github_secret(project_id: &str) -> String {
        format!("proj-{project_id}-github")
    }

    /// Secret owned by the user, holding the global Git token
    pub fn user_github_secret(user_id: &str) -> String {
        format!("user-{user_id}-github")
    }

    /// Secret owned by the user, holding the workspace API key
    pub fn user_api_secret(user_id: &str) -> String {
        format!("user-{user_id}-agent-key")
    }

    pub fn quota() -> String {
        "agentplane-quota".to_string()
    }
}

/// Static inputs the renderer needs besides the project itself
#[derive(Debug, Clone)]
pub struct RenderSettings {
    /// Agent container image reference
    pub agent_image: String,
    /// Port the agent listens on inside the container
    pub container_port: i32,
    /// HTTP path of the agent health endpoint
    pub health_path: String,
    /// When set, an ingress is rendered under this domain
    pub base_domain: Option<String>,
    pub ingress_class: Option<String>,
    /// TLS secret name pattern; `{host}` is replaced with the ingress host
    pub tls_secret_pattern: Option<String>,
}

/// The full set of cluster objects for one project
#[derive(Debug, Clone)]
pub struct ResourceBundle {
    pub namespace: Namespace,
    pub quota: ResourceQuota,
    pub config_map: ConfigMap,
    pub secret: Secret,
    pub service: Service,
    pub deployment: Deployment,
    pub ingress: Option<Ingress>,
}

/// Render the cluster objects for `project_id` owned by `user_id`.
///
/// `replicas` is 1 when the desired state is active and 0 when inactive.
pub fn render(
    user_id: &str,
    project_id: &str,
    replicas: i32,
    env: &ResolvedEnv,
    settings: &RenderSettings,
) -> ResourceBundle {
    let namespace_name = names::namespace(user_id);
    let workload_name = names::workload(project_id);

    ResourceBundle {
        namespace: render_namespace(user_id),
        quota: render_quota(&namespace_name),
        config_map: render_config_map(user_id, project_id, &namespace_name, env),
        secret: render_secret(user_id, project_id, &namespace_name, env),
        service: render_service(user_id, project_id, &namespace_name, settings),
        deployment: render_deployment(user_id, project_id, &namespace_name, replicas, settings),
        ingress: settings.base_domain.as_deref().map(|domain| {
            render_ingress(user_id, project_id, &namespace_name, &workload_name, domain, settings)
        }),
    }
}

/// Namespace and quota pair for a user, for operations that must ensure the
/// namespace before any project exists (user-scoped secrets)
pub fn namespace_objects(user_id: &str) -> (Namespace, ResourceQuota) {
    (
        render_namespace(user_id),
        render_quota(&names::namespace(user_id)),
    )
}

/// Single-key credential secret, owned by the user or project that set it
pub fn credential_secret(namespace: &str, name: &str, key: &str, value: &str) -> Secret {
    let mut labels = BTreeMap::new();
    labels.insert("managed-by".to_string(), MANAGED_BY.to_string());
    let mut data = BTreeMap::new();
    data.insert(key.to_string(), value.to_string());
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(data),
        ..Default::default()
    }
}

fn common_labels(user_id: &str, project_id: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("managed-by".to_string(), MANAGED_BY.to_string());
    labels.insert("user-id".to_string(), user_id.to_string());
    labels.insert("project-id".to_string(), project_id.to_string());
    labels
}

fn render_namespace(user_id: &str) -> Namespace {
    let mut labels = BTreeMap::new();
    labels.insert("role".to_string(), "project-workload".to_string());
    labels.insert("managed-by".to_string(), MANAGED_BY.to_string());
    labels.insert("user-id".to_string(), user_id.to_string());
    Namespace {
        metadata: ObjectMeta {
            name: Some(names::namespace(user_id)),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn render_quota(namespace: &str) -> ResourceQuota {
    let mut hard = BTreeMap::new();
    hard.insert("pods".to_string(), Quantity("10".to_string()));
    hard.insert("requests.cpu".to_string(), Quantity("4".to_string()));
    hard.insert("requests.memory".to_string(), Quantity("8Gi".to_string()));
    hard.insert("limits.cpu".to_string(), Quantity("8".to_string()));
    hard.insert("limits.memory".to_string(), Quantity("16Gi".to_string()));
    ResourceQuota {
        metadata: ObjectMeta {
            name: Some(names::quota()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ResourceQuotaSpec {
            hard: Some(hard),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn render_config_map(
    user_id: &str,
    project_id: &str,
    namespace: &str,
    env: &ResolvedEnv,
) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(names::config_map(project_id)),
            namespace: Some(namespace.to_string()),
            labels: Some(common_labels(user_id, project_id)),
            ..Default::default()
        },
        data: Some(env.config.clone()),
        ..Default::default()
    }
}

fn render_secret(user_id: &str, project_id: &str, namespace: &str, env: &ResolvedEnv) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(names::workload_secret(project_id)),
            namespace: Some(namespace.to_string()),
            labels: Some(common_labels(user_id, project_id)),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(env.secrets.clone()),
        ..Default::default()
    }
}

fn render_service(
    user_id: &str,
    project_id: &str,
    namespace: &str,
    settings: &RenderSettings,
) -> Service {
    let workload_name = names::workload(project_id);
    let mut selector = BTreeMap::new();
    selector.insert("app".to_string(), workload_name.clone());

    Service {
        metadata: ObjectMeta {
            name: Some(workload_name),
            namespace: Some(namespace.to_string()),
            labels: Some(common_labels(user_id, project_id)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: 80,
                target_port: Some(IntOrString::Int(settings.container_port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn render_deployment(
    user_id: &str,
    project_id: &str,
    namespace: &str,
    replicas: i32,
    settings: &RenderSettings,
) -> Deployment {
    let workload_name = names::workload(project_id);

    let mut selector_labels = BTreeMap::new();
    selector_labels.insert("app".to_string(), workload_name.clone());
    let mut pod_labels = common_labels(user_id, project_id);
    pod_labels.insert("app".to_string(), workload_name.clone());

    let health_probe = |initial_delay: i32, period: i32| Probe {
        http_get: Some(HTTPGetAction {
            path: Some(settings.health_path.clone()),
            port: IntOrString::Int(settings.container_port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        ..Default::default()
    };

    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), Quantity("250m".to_string()));
    requests.insert("memory".to_string(), Quantity("512Mi".to_string()));
    let mut limits = BTreeMap::new();
    limits.insert("cpu".to_string(), Quantity("1".to_string()));
    limits.insert("memory".to_string(), Quantity("2Gi".to_string()));

    let container = Container {
        name: "agent".to_string(),
        image: Some(settings.agent_image.clone()),
        ports: Some(vec![ContainerPort {
            container_port: settings.container_port,
            name: Some("http".to_string()),
            ..Default::default()
        }]),
        env_from: Some(vec![
            EnvFromSource {
                config_map_ref: Some(ConfigMapEnvSource {
                    name: names::config_map(project_id),
                    ..Default::default()
                }),
                ..Default::default()
            },
            EnvFromSource {
                secret_ref: Some(SecretEnvSource {
                    name: names::workload_secret(project_id),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ]),
        readiness_probe: Some(health_probe(10, 5)),
        liveness_probe: Some(health_probe(30, 15)),
        resources: Some(ResourceRequirements {
            requests: Some(requests),
            limits: Some(limits),
            ..Default::default()
        }),
        security_context: Some(SecurityContext {
            run_as_non_root: Some(true),
            run_as_user: Some(1000),
            allow_privilege_escalation: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut deploy_labels = common_labels(user_id, project_id);
    deploy_labels.insert("app".to_string(), workload_name.clone());

    Deployment {
        metadata: ObjectMeta {
            name: Some(workload_name),
            namespace: Some(namespace.to_string()),
            labels: Some(deploy_labels),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn render_ingress(
    user_id: &str,
    project_id: &str,
    namespace: &str,
    workload_name: &str,
    base_domain: &str,
    settings: &RenderSettings,
) -> Ingress {
    let host = names::ingress_host(project_id, user_id, base_domain);
    let tls = settings.tls_secret_pattern.as_deref().map(|pattern| {
        vec![IngressTLS {
            hosts: Some(vec![host.clone()]),
            secret_name: Some(pattern.replace("{host}", &host)),
        }]
    });

    Ingress {
        metadata: ObjectMeta {
            name: Some(workload_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(common_labels(user_id, project_id)),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: settings.ingress_class.clone(),
            rules: Some(vec![IngressRule {
                host: Some(host),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: workload_name.to_string(),
                                port: Some(ServiceBackendPort {
                                    number: Some(80),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            tls,
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envres::ResolvedEnv;

    fn env() -> ResolvedEnv {
        let mut config = BTreeMap::new();
        config.insert("USER_ID".to_string(), "u1".to_string());
        config.insert("PROJECT_ID".to_string(), "p1".to_string());
        let mut secrets = BTreeMap::new();
        secrets.insert("AGENT_API_KEY".to_string(), "wk".to_string());
        ResolvedEnv {
            config,
            secrets,
            github_source: None,
        }
    }

    fn settings() -> RenderSettings {
        RenderSettings {
            agent_image: "registry.local/agent:1".to_string(),
            container_port: 3001,
            health_path: "/api/v1/health".to_string(),
            base_domain: Some("agents.example.com".to_string()),
            ingress_class: Some("nginx".to_string()),
            tls_secret_pattern: None,
        }
    }

    #[test]
    fn test_canonical_names() {
        assert_eq!(names::namespace("u1"), "user-u1");
        assert_eq!(names::config_map("p1"), "proj-p1-env");
        assert_eq!(names::workload_secret("p1"), "proj-p1-secrets");
        assert_eq!(names::workload("p1"), "proj-p1-api");
        assert_eq!(names::pod_selector("p1"), "app=proj-p1-api");
        assert_eq!(
            names::ingress_host("p1", "u1", "agents.example.com"),
            "p1-u1.agents.example.com"
        );
    }

    #[test]
    fn test_render_is_deterministic() {
        let a = render("u1", "p1", 1, &env(), &settings());
        let b = render("u1", "p1", 1, &env(), &settings());
        assert_eq!(
            serde_json::to_string(&a.deployment).unwrap(),
            serde_json::to_string(&b.deployment).unwrap()
        );
        assert_eq!(
            serde_json::to_string(&a.config_map).unwrap(),
            serde_json::to_string(&b.config_map).unwrap()
        );
    }

    #[test]
    fn test_deployment_wiring() {
        let bundle = render("u1", "p1", 1, &env(), &settings());
        let spec = bundle.deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));

        let pod = spec.template.spec.unwrap();
        let container = &pod.containers[0];
        assert_eq!(container.name, "agent");

        let env_from = container.env_from.as_ref().unwrap();
        let config_ref = env_from[0].config_map_ref.as_ref().unwrap();
        let secret_ref = env_from[1].secret_ref.as_ref().unwrap();
        assert_eq!(config_ref.name, "proj-p1-env");
        assert_eq!(secret_ref.name, "proj-p1-secrets");

        let readiness = container.readiness_probe.as_ref().unwrap();
        assert_eq!(readiness.initial_delay_seconds, Some(10));
        assert_eq!(readiness.period_seconds, Some(5));
        let liveness = container.liveness_probe.as_ref().unwrap();
        assert!(liveness.initial_delay_seconds > readiness.initial_delay_seconds);

        let security = container.security_context.as_ref().unwrap();
        assert_eq!(security.run_as_non_root, Some(true));
    }

    #[test]
    fn test_zero_replicas_when_inactive() {
        let bundle = render("u1", "p1", 0, &env(), &settings());
        assert_eq!(bundle.deployment.spec.unwrap().replicas, Some(0));
    }

    #[test]
    fn test_service_maps_port_80_to_container_port() {
        let bundle = render("u1", "p1", 1, &env(), &settings());
        let spec = bundle.service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.port, 80);
        assert_eq!(port.target_port, Some(IntOrString::Int(3001)));
    }

    #[test]
    fn test_ingress_only_with_base_domain() {
        let with = render("u1", "p1", 1, &env(), &settings());
        assert!(with.ingress.is_some());
        let host = with.ingress.unwrap().spec.unwrap().rules.unwrap()[0]
            .host
            .clone();
        assert_eq!(host.as_deref(), Some("p1-u1.agents.example.com"));

        let mut no_domain = settings();
        no_domain.base_domain = None;
        let without = render("u1", "p1", 1, &env(), &no_domain);
        assert!(without.ingress.is_none());
    }

    #[test]
    fn test_tls_pattern_substitutes_host() {
        let mut settings = settings();
        settings.tls_secret_pattern = Some("{host}-tls".to_string());
        let bundle = render("u1", "p1", 1, &env(), &settings);
        let tls = bundle.ingress.unwrap().spec.unwrap().tls.unwrap();
        assert_eq!(
            tls[0].secret_name.as_deref(),
            Some("p1-u1.agents.example.com-tls")
        );
    }

    #[test]
    fn test_namespace_labels_and_quota() {
        let bundle = render("u1", "p1", 1, &env(), &settings());
        let labels = bundle.namespace.metadata.labels.unwrap();
        assert_eq!(labels.get("role").map(String::as_str), Some("project-workload"));
        let hard = bundle.quota.spec.unwrap().hard.unwrap();
        assert!(hard.contains_key("pods"));
    }

    #[test]
    fn test_secret_carries_resolved_credentials() {
        let bundle = render("u1", "p1", 1, &env(), &settings());
        let data = bundle.secret.string_data.unwrap();
        assert_eq!(data.get("AGENT_API_KEY").map(String::as_str), Some("wk"));
    }
}
