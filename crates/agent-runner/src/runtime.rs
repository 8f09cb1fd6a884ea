//! Agent runtime seam
//!
//! The reasoning loop itself lives outside this crate. A runtime is handed a
//! [`RunContext`] and drives the session from its own blocking thread.

use tokio_util::sync::CancellationToken;

use runwatch_core::SessionId;

use crate::publisher::Publisher;

/// Everything a runtime needs to execute one session
pub struct RunContext {
    pub session_id: SessionId,
    pub query: String,
    pub publisher: Publisher,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A blocking agent execution.
///
/// `run` is called on a blocking worker thread and may take minutes. It
/// publishes step events through `ctx.publisher` as they happen and returns
/// the final answer. The executor publishes `complete` (or a fatal error)
/// after it returns, so runtimes should not.
pub trait AgentRuntime: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn run(&self, ctx: &RunContext) -> anyhow::Result<String>;
}
