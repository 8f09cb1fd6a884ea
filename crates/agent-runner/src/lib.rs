//! Agent Runner - bridges a blocking agent run to resumable event streams
//!
//! The publisher appends synchronously from the agent's step path, the
//! session log is the source of truth, and every gateway connection reads
//! from the log on its own cursor.

mod error;
mod executor;
mod publisher;
mod registry;
mod runtime;
mod scripted;
mod stream;
mod sweeper;

pub use error::{ExecutorError, Result};
pub use executor::{ExecutorConfig, SessionExecutor};
pub use publisher::{Publisher, RetryPolicy, StepScope};
pub use registry::{RecoveryResult, SessionRegistry};
pub use runtime::{AgentRuntime, RunContext};
pub use scripted::{ScriptStep, ScriptedRuntime};
pub use stream::{
    connect, ConnectRequest, GatewayConfig, Subscription, DEFAULT_READ_BATCH, DEFAULT_READ_BLOCK,
};
pub use sweeper::{start_sweeper, sweep_once, SweepConfig, SweepReport};
