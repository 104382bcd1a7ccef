//! agentplane-core: project lifecycle engine for per-project AI-agent
//! runtimes on Kubernetes.
//!
//! The pieces compose as: the [`store`] keeps the desired state, the
//! [`render`] module turns a project into cluster object specifications, the
//! [`cluster`] adapter applies them, and the [`lifecycle`] engine drives
//! transitions between the two while the [`proxy`] forwards chat traffic to
//! the running agent.

pub mod cloner;
pub mod cluster;
pub mod envres;
pub mod error;
pub mod lifecycle;
pub mod proxy;
pub mod render;
pub mod settings;
pub mod store;
pub mod types;

pub use cluster::{Cluster, KubeCluster};
pub use error::{Error, Result};
pub use lifecycle::{ActivationOutcome, EngineConfig, LifecycleEngine};
pub use proxy::AgentProxy;
pub use render::RenderSettings;
pub use store::Store;
