//! Application state

use std::sync::Arc;

use agent_runner::{
    AgentRuntime, ExecutorConfig, GatewayConfig, ScriptedRuntime, SessionExecutor,
    SessionRegistry,
};
use runwatch_core::{EventArchive, SessionLog};

use crate::config::ServerConfig;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    executor: SessionExecutor,
    gateway: GatewayConfig,
    archive_enabled: bool,
}

impl AppState {
    /// Create state running the scripted demo runtime
    pub fn new(config: &ServerConfig) -> Self {
        let runtime = ScriptedRuntime::demo().with_step_delay(config.step_delay());
        Self::with_runtime(config, Arc::new(runtime))
    }

    pub fn with_runtime(config: &ServerConfig, runtime: Arc<dyn AgentRuntime>) -> Self {
        let mut log = SessionLog::new(config.log());
        if config.archive {
            log = log.with_archive(EventArchive::new(&config.data_dir));
        }
        let registry = Arc::new(SessionRegistry::new(Arc::new(log)));
        let executor = SessionExecutor::new(registry, runtime, ExecutorConfig::default());

        Self {
            inner: Arc::new(AppStateInner {
                executor,
                gateway: config.gateway(),
                archive_enabled: config.archive,
            }),
        }
    }

    pub fn executor(&self) -> &SessionExecutor {
        &self.inner.executor
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.inner.executor.registry()
    }

    pub fn gateway_config(&self) -> &GatewayConfig {
        &self.inner.gateway
    }

    pub fn archive_enabled(&self) -> bool {
        self.inner.archive_enabled
    }
}
