//! agentplane-server - control plane for per-project AI-agent runtimes
//!
//! REST API over TCP. Provisions and routes traffic to per-project agent
//! pods in a Kubernetes cluster.

use agentplane_core::{AgentProxy, EngineConfig, KubeCluster, LifecycleEngine, Store};
use anyhow::Context;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod error;
mod middleware;
mod routes;
mod state;

use config::Config;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("agentplane_server=info".parse()?)
                .add_directive("agentplane_core=info".parse()?),
        )
        .init();

    info!("agentplane-server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load()?;
    info!("Agent image: {}", config.agent_image);

    // Open the metadata store
    let store = Arc::new(
        Store::open(&config.database_path).context("Failed to open metadata store")?,
    );
    info!("Metadata store opened at {:?}", config.database_path);

    // Connect to the cluster; the control plane cannot run without it
    let cluster = Arc::new(
        KubeCluster::connect()
            .await
            .context("Failed to connect to the Kubernetes cluster")?,
    );
    info!("Cluster connection verified");

    let engine = LifecycleEngine::new(
        store.clone(),
        cluster,
        EngineConfig::new(config.render_settings()),
    );
    let proxy = AgentProxy::new(store.clone()).context("Failed to build agent proxy")?;

    // Create application state
    let state = AppState::new(config.clone(), store, engine, proxy);

    // Provision seeded users (idempotent)
    seed_users(&state).await?;

    // Create router
    let app = routes::create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(state.config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", state.config.bind_addr))?;
    info!("Listening on {}", state.config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutdown complete");
    Ok(())
}

/// Upsert seeded users and provision their workspace-key secrets
async fn seed_users(state: &Arc<AppState>) -> anyhow::Result<()> {
    for user in &state.config.seed_users {
        state
            .store
            .upsert_user(&user.id, &user.name)
            .with_context(|| format!("Failed to seed user {}", user.id))?;
        if let Err(e) = state.engine.set_user_api_key(&user.id, &user.api_key).await {
            warn!(user_id = %user.id, error = %e, "failed to provision workspace key");
        }
    }
    if !state.config.seed_users.is_empty() {
        info!("Seeded {} users", state.config.seed_users.len());
    }
    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
