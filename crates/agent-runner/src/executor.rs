//! Session executor - runs agent sessions on the blocking pool

use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use runwatch_core::{EventId, SessionId, SessionInfo, SessionStatus};

use crate::error::{ExecutorError, Result};
use crate::publisher::{Publisher, RetryPolicy};
use crate::registry::SessionRegistry;
use crate::runtime::{AgentRuntime, RunContext};

/// Configuration for the session executor
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    /// Backoff applied to transient append failures
    pub retry: RetryPolicy,
}

/// Control surface for sessions: prepare, execute, inspect, cancel
pub struct SessionExecutor {
    config: ExecutorConfig,
    registry: Arc<SessionRegistry>,
    runtime: Arc<dyn AgentRuntime>,
}

impl SessionExecutor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        runtime: Arc<dyn AgentRuntime>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            config,
            registry,
            runtime,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Register a session for `query` without starting it.
    pub fn prepare_session(&self, query: &str) -> Result<SessionInfo> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ExecutorError::execution_failed("query must not be empty"));
        }
        Ok(self.registry.create(query))
    }

    /// Start the blocking run. Returns once the run is scheduled; the handle
    /// resolves to the session's final status.
    pub fn execute_session(&self, session_id: SessionId) -> Result<JoinHandle<SessionStatus>> {
        self.registry.claim_execution(session_id)?;
        let info = self
            .registry
            .get(session_id)
            .ok_or(ExecutorError::SessionNotFound { session_id })?;

        let ctx = RunContext {
            session_id,
            query: info.query,
            publisher: Publisher::new(Arc::clone(&self.registry), session_id)
                .with_retry(self.config.retry),
            cancel: self.registry.cancel_token(session_id)?,
        };
        let publisher = ctx.publisher.clone();
        let runtime = Arc::clone(&self.runtime);
        let registry = Arc::clone(&self.registry);

        info!(
            session_id = %session_id,
            runtime = runtime.name(),
            "Starting session execution"
        );

        Ok(tokio::spawn(async move {
            let run = tokio::task::spawn_blocking(move || {
                let result = runtime.run(&ctx);
                finish_run(&ctx, result);
            });

            if let Err(e) = run.await {
                error!(session_id = %session_id, "Session run panicked: {}", e);
                if let Err(e) = publisher.error("agent runtime crashed", true) {
                    warn!(session_id = %session_id, "Could not record crash: {}", e);
                    registry.mark_errored(session_id);
                }
            }

            registry.status(session_id).unwrap_or(SessionStatus::Errored)
        }))
    }

    pub fn get_session_state(&self, session_id: SessionId) -> Result<SessionStatus> {
        self.registry.status(session_id)
    }

    /// Stop a session: the runtime sees the token, and a terminal aborted
    /// error closes the log so later publishes are refused.
    pub fn cancel_session(&self, session_id: SessionId) -> Result<Option<EventId>> {
        self.registry.cancel_token(session_id)?.cancel();
        let id = Publisher::new(Arc::clone(&self.registry), session_id)
            .with_retry(self.config.retry)
            .abort("cancelled by user")?;
        if id.is_some() {
            info!(session_id = %session_id, "Session cancelled");
        }
        Ok(id)
    }
}

/// Publish the terminal record for a finished run.
fn finish_run(ctx: &RunContext, result: anyhow::Result<String>) {
    let session_id = ctx.session_id;
    let publisher = &ctx.publisher;

    if ctx.is_cancelled() {
        info!(session_id = %session_id, "Run stopped after cancellation");
        return;
    }

    let outcome = match result {
        Ok(answer) => {
            let answered = if publisher.has_final_answer() {
                Ok(0)
            } else {
                publisher.final_answer(&answer)
            };
            answered.and_then(|_| publisher.complete(json!({ "status": "completed" })))
        }
        Err(e) => {
            warn!(session_id = %session_id, "Run failed: {:#}", e);
            publisher.error(format!("{:#}", e), true)
        }
    };

    match outcome {
        Ok(id) => info!(session_id = %session_id, last_event_id = id, "Run finished"),
        Err(ExecutorError::SessionClosed { .. }) => {
            info!(session_id = %session_id, "Session closed before the run finished")
        }
        Err(e) => error!(session_id = %session_id, "Failed to record run outcome: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use runwatch_core::{EventType, LogConfig, SessionLog};

    use crate::scripted::ScriptedRuntime;

    struct FailingRuntime;

    impl AgentRuntime for FailingRuntime {
        fn name(&self) -> &str {
            "failing"
        }

        fn run(&self, _ctx: &RunContext) -> anyhow::Result<String> {
            anyhow::bail!("model provider unavailable")
        }
    }

    fn executor(runtime: Arc<dyn AgentRuntime>) -> SessionExecutor {
        let log = Arc::new(SessionLog::new(LogConfig::default()));
        SessionExecutor::new(
            Arc::new(SessionRegistry::new(log)),
            runtime,
            ExecutorConfig::default(),
        )
    }

    async fn all_events(executor: &SessionExecutor, sid: SessionId) -> Vec<runwatch_core::AgentEvent> {
        executor
            .registry()
            .log()
            .read(sid, 0, 1000, Duration::ZERO)
            .await
            .unwrap()
            .events
    }

    #[tokio::test]
    async fn successful_run_ends_with_single_complete() {
        let executor = executor(Arc::new(ScriptedRuntime::demo()));
        let sid = executor.prepare_session("what is tokio").unwrap().id;
        assert_eq!(executor.get_session_state(sid).unwrap(), SessionStatus::Created);

        let status = executor.execute_session(sid).unwrap().await.unwrap();
        assert_eq!(status, SessionStatus::Completed);

        let events = all_events(&executor, sid).await;
        let last = events.last().unwrap();
        assert_eq!(last.event_type, EventType::Complete);
        assert_eq!(
            events.iter().filter(|e| e.is_terminal()).count(),
            1
        );
        assert_eq!(
            events[events.len() - 2].event_type,
            EventType::FinalAnswer
        );
    }

    #[tokio::test]
    async fn runtime_error_is_fatal() {
        let executor = executor(Arc::new(FailingRuntime));
        let sid = executor.prepare_session("q").unwrap().id;

        let status = executor.execute_session(sid).unwrap().await.unwrap();
        assert_eq!(status, SessionStatus::Errored);

        let events = all_events(&executor, sid).await;
        assert!(events.last().unwrap().is_fatal_error());
    }

    #[tokio::test]
    async fn session_executes_once() {
        let executor = executor(Arc::new(ScriptedRuntime::demo()));
        let sid = executor.prepare_session("q").unwrap().id;

        let handle = executor.execute_session(sid).unwrap();
        assert!(executor.execute_session(sid).is_err());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_closes_session_with_aborted_error() {
        let runtime = ScriptedRuntime::demo().with_step_delay(Duration::from_millis(50));
        let executor = executor(Arc::new(runtime));
        let sid = executor.prepare_session("q").unwrap().id;

        let handle = executor.execute_session(sid).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(executor.cancel_session(sid).unwrap().is_some());

        assert_eq!(handle.await.unwrap(), SessionStatus::Errored);
        let events = all_events(&executor, sid).await;
        let last = events.last().unwrap();
        assert_eq!(last.payload["aborted"], true);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        assert_eq!(executor.cancel_session(sid).unwrap(), None);
    }

    #[test]
    fn empty_query_is_rejected() {
        let executor = executor(Arc::new(ScriptedRuntime::demo()));
        assert!(executor.prepare_session("   ").is_err());
    }
}
