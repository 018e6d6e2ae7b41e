//! In-memory stand-ins for the external collaborators of a tracking session.
//!
//! Each mock implements the same trait as its production adapter, records
//! what it was asked to do and lets a test steer the replies: fail the next
//! handshakes, hold route replies until the test releases them, or push
//! location events into the most recently opened hub connection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::clients::geocoder::{Geocoder, RouteResponse, TravelMode};
use crate::clients::orders::OrderBackend;
use crate::error::{GeocodeError, LookupError, TransportError};
use crate::feed::transport::{HubConnection, HubEvent, LocationTransport};
use crate::geo::polyline;
use crate::models::location::Coordinate;
use crate::models::order::OrderTrackingData;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn tracking_data(code: &str, pickup: &str, delivery: &str, driver_id: &str) -> OrderTrackingData {
    OrderTrackingData {
        order_id: format!("order-{code}"),
        tracking_code: code.to_string(),
        pickup_address: pickup.to_string(),
        delivery_address: delivery.to_string(),
        driver_id: driver_id.to_string(),
        driver_name: format!("driver {driver_id}"),
        status_history: Vec::new(),
    }
}

#[derive(Clone, Default)]
pub struct MockOrderBackend {
    replies: Arc<Mutex<HashMap<String, Result<OrderTrackingData, LookupError>>>>,
    lookups: Arc<AtomicUsize>,
}

impl MockOrderBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_order(self, data: OrderTrackingData) -> Self {
        locked(&self.replies).insert(data.tracking_code.clone(), Ok(data));
        self
    }

    pub fn with_failure(self, code: &str, err: LookupError) -> Self {
        locked(&self.replies).insert(code.to_string(), Err(err));
        self
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrderBackend for MockOrderBackend {
    async fn track_order(&self, tracking_code: &str) -> Result<OrderTrackingData, LookupError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        locked(&self.replies)
            .get(tracking_code)
            .cloned()
            .unwrap_or(Err(LookupError::NotFound))
    }
}

pub struct HeldRoute {
    pub origin: Coordinate,
    pub destination: Coordinate,
    reply: oneshot::Sender<Result<RouteResponse, GeocodeError>>,
}

impl HeldRoute {
    pub fn respond(self, path: &[Coordinate]) {
        self.respond_encoded(&polyline::encode(path));
    }

    pub fn respond_encoded(self, geometry: &str) {
        let _ = self.reply.send(Ok(RouteResponse {
            geometry: geometry.to_string(),
        }));
    }

    pub fn fail(self) {
        let _ = self.reply.send(Err(GeocodeError::NoRoute));
    }
}

#[derive(Default)]
struct GeocoderState {
    addresses: HashMap<String, Coordinate>,
    geocode_calls: Vec<String>,
    route_calls: Vec<(Coordinate, Coordinate)>,
    fail_routes: bool,
    held: Option<mpsc::UnboundedSender<HeldRoute>>,
}

#[derive(Clone, Default)]
pub struct MockGeocoder {
    state: Arc<Mutex<GeocoderState>>,
}

impl MockGeocoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_address(self, text: &str, coordinate: Coordinate) -> Self {
        self.add_address(text, coordinate);
        self
    }

    pub fn add_address(&self, text: &str, coordinate: Coordinate) {
        locked(&self.state)
            .addresses
            .insert(text.to_string(), coordinate);
    }

    pub fn fail_routes(&self, fail: bool) {
        locked(&self.state).fail_routes = fail;
    }

    /// From now on every route request waits for the test to answer it
    /// through the returned channel.
    pub fn hold_routes(&self) -> mpsc::UnboundedReceiver<HeldRoute> {
        let (tx, rx) = mpsc::unbounded_channel();
        locked(&self.state).held = Some(tx);
        rx
    }

    pub fn geocode_calls(&self) -> Vec<String> {
        locked(&self.state).geocode_calls.clone()
    }

    pub fn route_calls(&self) -> Vec<(Coordinate, Coordinate)> {
        locked(&self.state).route_calls.clone()
    }
}

#[async_trait]
impl Geocoder for MockGeocoder {
    async fn geocode_address(&self, text: &str) -> Result<Option<Coordinate>, GeocodeError> {
        let mut state = locked(&self.state);
        state.geocode_calls.push(text.to_string());
        Ok(state.addresses.get(text).copied())
    }

    async fn route(
        &self,
        origin: Coordinate,
        destination: Coordinate,
        _mode: TravelMode,
    ) -> Result<RouteResponse, GeocodeError> {
        let held = {
            let mut state = locked(&self.state);
            state.route_calls.push((origin, destination));
            if state.fail_routes {
                return Err(GeocodeError::Status(500));
            }
            state.held.clone()
        };

        let Some(held) = held else {
            return Ok(RouteResponse {
                geometry: polyline::encode(&[origin, destination]),
            });
        };

        let (reply, wait) = oneshot::channel();
        held.send(HeldRoute {
            origin,
            destination,
            reply,
        })
        .map_err(|_| GeocodeError::Request("route holder dropped".to_string()))?;

        wait.await
            .unwrap_or_else(|_| Err(GeocodeError::Request("held route abandoned".to_string())))
    }
}

#[derive(Default)]
struct TransportState {
    calls: Vec<String>,
    connections: Vec<mpsc::Sender<HubEvent>>,
    failing_invocations: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
    failing_starts: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` handshakes fail.
    pub fn fail_next_starts(&self, n: usize) {
        self.failing_starts.store(n, Ordering::SeqCst);
    }

    pub fn fail_invocations(&self, method: &str) {
        locked(&self.state)
            .failing_invocations
            .insert(method.to_string());
    }

    /// Every call made through the transport, e.g. `"invoke Subscribe D1"`.
    pub fn calls(&self) -> Vec<String> {
        locked(&self.state).calls.clone()
    }

    pub fn opened(&self) -> usize {
        locked(&self.state).connections.len()
    }

    pub fn connection(&self, index: usize) -> Option<mpsc::Sender<HubEvent>> {
        locked(&self.state).connections.get(index).cloned()
    }

    pub async fn emit(&self, event: HubEvent) -> bool {
        let latest = locked(&self.state).connections.last().cloned();
        match latest {
            Some(events) => events.send(event).await.is_ok(),
            None => false,
        }
    }

    pub async fn push_location(&self, entity_id: &str, lat: f64, lng: f64) -> bool {
        self.emit(HubEvent::ReceiveLocation {
            entity_id: entity_id.to_string(),
            lat,
            lng,
        })
        .await
    }
}

impl LocationTransport for MockTransport {
    fn open(&self, events: mpsc::Sender<HubEvent>) -> Arc<dyn HubConnection> {
        let mut state = locked(&self.state);
        state.calls.push("open".to_string());
        state.connections.push(events);

        Arc::new(MockConnection {
            state: self.state.clone(),
            failing_starts: self.failing_starts.clone(),
        })
    }
}

struct MockConnection {
    state: Arc<Mutex<TransportState>>,
    failing_starts: Arc<AtomicUsize>,
}

#[async_trait]
impl HubConnection for MockConnection {
    async fn start(&self) -> Result<(), TransportError> {
        locked(&self.state).calls.push("start".to_string());

        let failing = self
            .failing_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        Ok(())
    }

    async fn invoke(&self, method: &str, entity_id: &str) -> Result<(), TransportError> {
        let mut state = locked(&self.state);
        state.calls.push(format!("invoke {method} {entity_id}"));

        if state.failing_invocations.contains(method) {
            return Err(TransportError::Invoke {
                method: method.to_string(),
                reason: "rejected by hub".to_string(),
            });
        }
        Ok(())
    }

    async fn stop(&self) {
        locked(&self.state).calls.push("stop".to_string());
    }
}
