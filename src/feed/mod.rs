//! Push subscription to a single driver's live location stream.

pub mod hub;
pub mod protocol;
pub mod transport;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::FeedError;
use crate::models::location::LocationEvent;
use crate::models::view::ConnectionState;
use crate::observability::metrics::Metrics;
use transport::{HubConnection, HubEvent, LocationTransport, SUBSCRIBE, UNSUBSCRIBE};

const EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone)]
pub enum FeedEvent {
    State(ConnectionState),
    Location(LocationEvent),
    Closed { reason: Option<String> },
}

pub type FeedHandler = Arc<dyn Fn(FeedEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(3),
        }
    }
}

#[derive(Clone)]
pub struct LocationFeed {
    shared: Arc<FeedShared>,
}

struct FeedShared {
    transport: Arc<dyn LocationTransport>,
    policy: RetryPolicy,
    metrics: Metrics,
    state_tx: watch::Sender<ConnectionState>,
    slot: Mutex<Slot>,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    active: Option<Subscription>,
}

struct Subscription {
    entity_id: String,
    connection: Arc<dyn HubConnection>,
    handler: FeedHandler,
    connected: bool,
    pump: Option<JoinHandle<()>>,
}

impl FeedShared {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        let slot = self.slot();
        slot.generation == generation && slot.active.is_some()
    }

    fn connection(&self, generation: u64) -> Option<(Arc<dyn HubConnection>, String)> {
        let slot = self.slot();
        if slot.generation != generation {
            return None;
        }
        slot.active
            .as_ref()
            .map(|sub| (sub.connection.clone(), sub.entity_id.clone()))
    }

    fn transition(&self, generation: u64, state: ConnectionState) {
        let handler = {
            let mut slot = self.slot();
            if slot.generation != generation {
                return;
            }
            let Some(sub) = slot.active.as_mut() else {
                return;
            };
            if matches!(state, ConnectionState::Connected | ConnectionState::Receiving) {
                sub.connected = true;
            }
            let previous = self.state_tx.send_replace(state);
            if previous == state {
                return;
            }
            sub.handler.clone()
        };

        handler(FeedEvent::State(state));
    }

    fn deliver(&self, generation: u64, event: FeedEvent) {
        let handler = {
            let slot = self.slot();
            if slot.generation != generation {
                return;
            }
            match slot.active.as_ref() {
                Some(sub) => sub.handler.clone(),
                None => return,
            }
        };

        handler(event);
    }

    fn retire(&self, generation: u64) -> Option<Subscription> {
        let mut slot = self.slot();
        if slot.generation != generation {
            return None;
        }
        slot.active.take()
    }

    fn settle_disconnected(&self, handler: &FeedHandler) {
        let previous = self.state_tx.send_replace(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            handler(FeedEvent::State(ConnectionState::Disconnected));
        }
    }
}

impl LocationFeed {
    pub fn new(transport: Arc<dyn LocationTransport>, policy: RetryPolicy, metrics: Metrics) -> Self {
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);

        Self {
            shared: Arc::new(FeedShared {
                transport,
                policy,
                metrics,
                state_tx,
                slot: Mutex::new(Slot::default()),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn entity_id(&self) -> Option<String> {
        self.shared
            .slot()
            .active
            .as_ref()
            .map(|sub| sub.entity_id.clone())
    }

    // At most `policy.attempts` handshakes. Reconnects after that are the
    // transport's business.
    pub async fn start(&self, entity_id: &str, handler: FeedHandler) -> Result<(), FeedError> {
        self.stop().await;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let connection = self.shared.transport.open(events_tx);

        let generation = {
            let mut slot = self.shared.slot();
            slot.generation += 1;
            slot.active = Some(Subscription {
                entity_id: entity_id.to_string(),
                connection: connection.clone(),
                handler: handler.clone(),
                connected: false,
                pump: None,
            });
            slot.generation
        };

        self.shared.transition(generation, ConnectionState::Connecting);
        info!(entity_id, "connecting location feed");

        let mut attempt = 0;
        loop {
            attempt += 1;
            match connection.start().await {
                Ok(()) => {
                    self.shared
                        .metrics
                        .connect_attempts_total
                        .with_label_values(&["success"])
                        .inc();
                    break;
                }
                Err(err) => {
                    self.shared
                        .metrics
                        .connect_attempts_total
                        .with_label_values(&["failure"])
                        .inc();

                    if !self.shared.is_current(generation) {
                        return Err(FeedError::Superseded);
                    }

                    if attempt >= self.shared.policy.attempts {
                        error!(entity_id, attempts = attempt, error = %err, "location feed gave up connecting");
                        if let Some(sub) = self.shared.retire(generation) {
                            sub.connection.stop().await;
                            self.shared.settle_disconnected(&sub.handler);
                        }
                        return Err(FeedError::ConnectFailed {
                            attempts: attempt,
                            last: err,
                        });
                    }

                    warn!(entity_id, attempt, error = %err, "location feed connect failed; retrying");
                    sleep(self.shared.policy.delay).await;

                    if !self.shared.is_current(generation) {
                        return Err(FeedError::Superseded);
                    }
                }
            }
        }

        if !self.shared.is_current(generation) {
            connection.stop().await;
            return Err(FeedError::Superseded);
        }

        self.shared.transition(generation, ConnectionState::Connected);

        if let Err(err) = connection.invoke(SUBSCRIBE, entity_id).await {
            warn!(entity_id, error = %err, "subscribe failed; keeping connection open");
        }

        let pump = tokio::spawn(run_pump(
            self.shared.clone(),
            generation,
            entity_id.to_string(),
            events_rx,
        ));

        let mut slot = self.shared.slot();
        let current = slot.generation == generation;
        match slot.active.as_mut() {
            Some(sub) if current => sub.pump = Some(pump),
            _ => pump.abort(),
        }

        Ok(())
    }

    pub async fn stop(&self) {
        let retired = {
            let mut slot = self.shared.slot();
            slot.generation += 1;
            slot.active.take()
        };

        let Some(sub) = retired else {
            self.shared.state_tx.send_replace(ConnectionState::Disconnected);
            return;
        };

        if let Some(pump) = &sub.pump {
            pump.abort();
        }

        if sub.connected {
            if let Err(err) = sub.connection.invoke(UNSUBSCRIBE, &sub.entity_id).await {
                warn!(entity_id = %sub.entity_id, error = %err, "unsubscribe failed during teardown");
            }
        }
        sub.connection.stop().await;

        self.shared.settle_disconnected(&sub.handler);
        info!(entity_id = %sub.entity_id, "location feed stopped");
    }
}

async fn run_pump(
    shared: Arc<FeedShared>,
    generation: u64,
    entity_id: String,
    mut events: mpsc::Receiver<HubEvent>,
) {
    while let Some(event) = events.recv().await {
        if !shared.is_current(generation) {
            break;
        }

        match event {
            HubEvent::ReceiveLocation {
                entity_id: from,
                lat,
                lng,
            } => {
                if from != entity_id {
                    debug!(expected = %entity_id, received = %from, "ignoring location for another entity");
                    continue;
                }

                shared.transition(generation, ConnectionState::Receiving);
                shared.deliver(
                    generation,
                    FeedEvent::Location(LocationEvent {
                        driver_id: from,
                        lat,
                        lng,
                        received_at: Utc::now(),
                    }),
                );
            }
            HubEvent::Reconnecting => {
                warn!(entity_id = %entity_id, "location feed reconnecting");
                shared.transition(generation, ConnectionState::Connecting);
            }
            HubEvent::Reconnected => {
                shared.transition(generation, ConnectionState::Connected);
                if let Some((connection, entity_id)) = shared.connection(generation) {
                    if let Err(err) = connection.invoke(SUBSCRIBE, &entity_id).await {
                        warn!(entity_id = %entity_id, error = %err, "resubscribe after reconnect failed");
                    }
                }
            }
            HubEvent::Closed { reason } => {
                warn!(entity_id = %entity_id, reason = ?reason, "location feed closed by transport");
                if let Some(sub) = shared.retire(generation) {
                    shared.settle_disconnected(&sub.handler);
                    (sub.handler)(FeedEvent::Closed { reason });
                }
                break;
            }
        }
    }
}
