//! Application state.

use agentplane_core::{AgentProxy, LifecycleEngine, Store};
use std::sync::Arc;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub config: Arc<Config>,
    /// Metadata store
    pub store: Arc<Store>,
    /// Lifecycle engine
    pub engine: Arc<LifecycleEngine>,
    /// Agent proxy
    pub proxy: Arc<AgentProxy>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<Store>,
        engine: LifecycleEngine,
        proxy: AgentProxy,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            store,
            engine: Arc::new(engine),
            proxy: Arc::new(proxy),
        })
    }
}
