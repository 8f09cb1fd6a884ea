//! Client side of Runwatch
//!
//! - `client`: control routes and a resumable SSE subscription
//! - `sse`: byte stream to wire record decoding
//! - `reconcile`: UI state machine fed by wire records
//! - `watcher`: background task tying the two together

pub mod client;
pub mod error;
pub mod reconcile;
pub mod sse;
pub mod watcher;

pub use client::{ReconnectPolicy, RunwatchClient};
pub use error::{ClientError, Result};
pub use reconcile::{Reconciler, ReconcilerConfig, UiState};
pub use sse::{SseDecoder, SseFrame};
pub use watcher::{SessionWatcher, WatcherConfig};
