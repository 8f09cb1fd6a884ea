//! Background sweep of detached cursors and finished sessions

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::SessionRegistry;

#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// How long a detached consumer group keeps its cursor
    pub cursor_grace: Duration,
    /// How long a finished, unwatched session stays queryable
    pub session_retention: Duration,
    pub interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            cursor_grace: Duration::from_secs(60),
            session_retention: Duration::from_secs(600),
            interval: Duration::from_secs(15),
        }
    }
}

/// Outcome of one sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_cursors: usize,
    pub evicted_sessions: usize,
}

pub fn sweep_once(registry: &SessionRegistry, config: &SweepConfig) -> SweepReport {
    let expired_cursors = registry.log().expire_cursors(config.cursor_grace).len();
    let evicted_sessions = registry.evict_expired(config.session_retention).len();
    SweepReport {
        expired_cursors,
        evicted_sessions,
    }
}

/// Spawn the periodic sweep. Returns its handle; cancel `shutdown` to stop it.
pub fn start_sweeper(
    registry: Arc<SessionRegistry>,
    config: SweepConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let report = sweep_once(&registry, &config);
            if report != SweepReport::default() {
                info!(
                    expired_cursors = report.expired_cursors,
                    evicted_sessions = report.evicted_sessions,
                    remaining = registry.len(),
                    "Swept session state"
                );
            }
        }
    })
}
