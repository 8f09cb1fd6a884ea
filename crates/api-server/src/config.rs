//! Server configuration from `RUNWATCH_*` environment variables

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use agent_runner::{GatewayConfig, SweepConfig};
use runwatch_core::LogConfig;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub data_dir: PathBuf,
    /// Mirror every append to JSONL under `data_dir`
    pub archive: bool,
    pub log_max_len: usize,
    pub read_block_ms: u64,
    pub read_batch: usize,
    pub cursor_grace_secs: u64,
    pub session_retention_secs: u64,
    pub sweep_interval_secs: u64,
    pub step_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            data_dir: PathBuf::from(".runwatch-data"),
            archive: true,
            log_max_len: runwatch_core::log::DEFAULT_MAX_LEN,
            read_block_ms: 15_000,
            read_batch: 64,
            cursor_grace_secs: 60,
            session_retention_secs: 600,
            sweep_interval_secs: 15,
            step_delay_ms: 400,
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; malformed values keep their
    /// defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let flag = |name: &str, default: bool| match lookup(name) {
            Some(raw) => parse_flag(&raw).unwrap_or_else(|| {
                warn!("Ignoring invalid {}={:?}", name, raw);
                default
            }),
            None => default,
        };

        Self {
            addr: parse_var(&lookup, "RUNWATCH_ADDR", defaults.addr),
            data_dir: lookup("RUNWATCH_DATA_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            archive: flag("RUNWATCH_ARCHIVE", defaults.archive),
            log_max_len: parse_var(&lookup, "RUNWATCH_LOG_MAX_LEN", defaults.log_max_len),
            read_block_ms: parse_var(&lookup, "RUNWATCH_READ_BLOCK_MS", defaults.read_block_ms),
            read_batch: parse_var(&lookup, "RUNWATCH_READ_BATCH", defaults.read_batch),
            cursor_grace_secs: parse_var(
                &lookup,
                "RUNWATCH_CURSOR_GRACE_SECS",
                defaults.cursor_grace_secs,
            ),
            session_retention_secs: parse_var(
                &lookup,
                "RUNWATCH_SESSION_RETENTION_SECS",
                defaults.session_retention_secs,
            ),
            sweep_interval_secs: parse_var(
                &lookup,
                "RUNWATCH_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval_secs,
            ),
            step_delay_ms: parse_var(&lookup, "RUNWATCH_STEP_DELAY_MS", defaults.step_delay_ms),
        }
    }

    pub fn log(&self) -> LogConfig {
        LogConfig {
            max_len: self.log_max_len.max(1),
        }
    }

    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            read_block: Duration::from_millis(self.read_block_ms),
            batch_size: self.read_batch.max(1),
        }
    }

    pub fn sweep(&self) -> SweepConfig {
        SweepConfig {
            cursor_grace: Duration::from_secs(self.cursor_grace_secs),
            session_retention: Duration::from_secs(self.session_retention_secs),
            // A zero period would make the interval timer panic.
            interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
        }
    }

    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    match lookup(name) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={:?}", name, raw);
            default
        }),
        None => default,
    }
}
