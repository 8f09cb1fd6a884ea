//! Session watcher
//!
//! Runs a subscription through a [`Reconciler`] on a background task and
//! exposes the result as `watch` channels, so a UI can redraw on state
//! changes and drive its timers from the generation-in-flight signal
//! instead of individual frames.

use std::time::{Duration, Instant};

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use runwatch_core::{EventId, SessionId, WireEvent};

use crate::client::RunwatchClient;
use crate::error::Result;
use crate::reconcile::{Reconciler, ReconcilerConfig, UiState};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct WatcherConfig {
    /// How often the silence timer is re-evaluated
    pub tick: Duration,
    pub reconciler: ReconcilerConfig,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(250),
            reconciler: ReconcilerConfig::default(),
        }
    }
}

pub struct SessionWatcher {
    state: watch::Receiver<UiState>,
    in_flight: watch::Receiver<bool>,
    events: mpsc::Receiver<WireEvent>,
    handle: JoinHandle<Result<()>>,
}

impl SessionWatcher {
    /// Follow `session_id` through `client`, resuming after `last_event_id`.
    pub fn spawn(
        client: &RunwatchClient,
        session_id: SessionId,
        last_event_id: Option<EventId>,
        group: Option<String>,
        config: WatcherConfig,
    ) -> Self {
        Self::from_stream(client.subscribe(session_id, last_event_id, group), config)
    }

    pub fn from_stream(
        stream: BoxStream<'static, Result<WireEvent>>,
        config: WatcherConfig,
    ) -> Self {
        let (state_tx, state) = watch::channel(UiState::Standby);
        let (in_flight_tx, in_flight) = watch::channel(false);
        let (events_tx, events) = mpsc::channel(EVENT_BUFFER);

        let handle = tokio::spawn(drive(stream, config, state_tx, in_flight_tx, events_tx));

        Self {
            state,
            in_flight,
            events,
            handle,
        }
    }

    pub fn state(&self) -> watch::Receiver<UiState> {
        self.state.clone()
    }

    pub fn generation_in_flight(&self) -> watch::Receiver<bool> {
        self.in_flight.clone()
    }

    /// Next raw frame, `None` once the stream has ended.
    pub async fn next_event(&mut self) -> Option<WireEvent> {
        self.events.recv().await
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Wait for the stream to end. Frames not yet taken are dropped.
    pub async fn finish(self) -> Result<()> {
        drop(self.events);
        match self.handle.await {
            Ok(result) => result,
            Err(e) => {
                warn!("Watcher task ended abnormally: {}", e);
                Ok(())
            }
        }
    }
}

async fn drive(
    mut stream: BoxStream<'static, Result<WireEvent>>,
    config: WatcherConfig,
    state_tx: watch::Sender<UiState>,
    in_flight_tx: watch::Sender<bool>,
    events_tx: mpsc::Sender<WireEvent>,
) -> Result<()> {
    let mut reconciler = Reconciler::new(config.reconciler);
    let mut ticker = tokio::time::interval(config.tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let publish = |reconciler: &Reconciler| {
        state_tx.send_if_modified(|state| replace(state, reconciler.state()));
        in_flight_tx.send_if_modified(|flag| replace(flag, reconciler.generation_in_flight()));
    };

    loop {
        tokio::select! {
            frame = stream.next() => {
                let event = match frame {
                    Some(Ok(event)) => event,
                    Some(Err(e)) => return Err(e),
                    None => {
                        debug!("Watched stream ended");
                        return Ok(());
                    }
                };

                let content = event.kind.event_type().is_some();
                if content && !reconciler.is_closed() {
                    // The terminal record ends the generation before it lands.
                    reconciler.set_generation_in_flight(!event.is_terminal());
                }
                reconciler.apply(&event, Instant::now());
                publish(&reconciler);

                // State must keep advancing even when nobody drains raw frames.
                match events_tx.try_send(event) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(event)) => {
                        warn!("Event buffer full, dropping frame {:?}", event.id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("Event receiver dropped");
                    }
                }
            }
            _ = ticker.tick() => {
                reconciler.tick(Instant::now());
                publish(&reconciler);
            }
        }
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}
