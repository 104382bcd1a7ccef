//! Readiness waiter.
//!
//! The single place where the lifecycle engine blocks for extended time.
//! Polls pod state and the agent health endpoint until the pod is ready or
//! the total budget elapses.

use crate::cluster::Cluster;
use crate::error::{Error, Result};
use crate::render::names;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct ReadinessConfig {
    pub poll_interval: Duration,
    pub total_timeout: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            total_timeout: Duration::from_secs(120),
        }
    }
}

/// Block until a pod behind the project's selector is Running, Ready, and
/// answering its health endpoint with 200.
///
/// On timeout the deployment is left in place and `ReadinessTimeout` is
/// returned; the caller decides what to persist.
pub async fn wait_for_ready(
    cluster: &dyn Cluster,
    namespace: &str,
    project_id: &str,
    health_url: &str,
    config: &ReadinessConfig,
) -> Result<()> {
    let selector = names::pod_selector(project_id);
    let deadline = Instant::now() + config.total_timeout;

    loop {
        let status = cluster.get_pod_status(namespace, &selector).await?;
        if status.ready && cluster.probe_health(health_url).await? {
            debug!(project_id, "pod ready and agent healthy");
            return Ok(());
        }
        if let Some(message) = &status.message {
            debug!(project_id, message, "waiting for readiness");
        }

        if Instant::now() + config.poll_interval > deadline {
            return Err(Error::ReadinessTimeout(
                project_id.to_string(),
                config.total_timeout.as_secs(),
            ));
        }
        tokio::time::sleep(config.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;

    fn fast_config() -> ReadinessConfig {
        ReadinessConfig {
            poll_interval: Duration::from_millis(5),
            total_timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_succeeds_once_pod_is_ready() {
        let cluster = FakeCluster::new();
        {
            let mut state = cluster.state.lock().unwrap();
            state.running = 1;
            state.ready_after_polls = 2;
        }
        let result =
            wait_for_ready(&cluster, "user-u1", "p1", "http://svc/health", &fast_config()).await;
        assert!(result.is_ok());
        assert!(cluster.state.lock().unwrap().polls >= 3);
    }

    #[tokio::test]
    async fn test_times_out_when_health_never_passes() {
        let cluster = FakeCluster::new();
        {
            let mut state = cluster.state.lock().unwrap();
            state.running = 1;
            state.healthy = false;
        }
        let result =
            wait_for_ready(&cluster, "user-u1", "p1", "http://svc/health", &fast_config()).await;
        assert!(matches!(result, Err(Error::ReadinessTimeout(_, _))));
    }

    #[tokio::test]
    async fn test_times_out_with_no_running_pods() {
        let cluster = FakeCluster::new();
        let result =
            wait_for_ready(&cluster, "user-u1", "p1", "http://svc/health", &fast_config()).await;
        assert!(matches!(result, Err(Error::ReadinessTimeout(_, _))));
    }
}
