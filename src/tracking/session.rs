use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clients::geocoder::{Geocoder, TravelMode};
use crate::clients::orders::OrderBackend;
use crate::error::{FeedError, TrackingError};
use crate::feed::transport::LocationTransport;
use crate::feed::{FeedEvent, FeedHandler, LocationFeed, RetryPolicy};
use crate::geo::{haversine_km, polyline};
use crate::models::location::Coordinate;
use crate::models::order::{Place, TrackedOrder};
use crate::models::view::{ConnectionState, FocusRequest, FocusTarget, SessionEvent, ViewModel};
use crate::observability::metrics::Metrics;

const PICKUP_PAIR: &str = "pickup_delivery";
const DRIVER_PAIR: &str = "driver_delivery";

#[derive(Clone)]
pub struct SessionDeps {
    pub orders: Arc<dyn OrderBackend>,
    pub geocoder: Arc<dyn Geocoder>,
    pub transport: Arc<dyn LocationTransport>,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub retry: RetryPolicy,
    /// Oldest points are dropped beyond this many; 0 keeps everything.
    pub path_history_limit: usize,
    pub travel_mode: TravelMode,
    pub event_buffer_size: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            path_history_limit: 5000,
            travel_mode: TravelMode::Car,
            event_buffer_size: 1024,
        }
    }
}

/// Live view of one tracked order.
///
/// Lifecycle calls (`load`, `stop`, `resume`, `retry_geocoding`) run one at a
/// time per session. Location events and route replies may arrive at any
/// time; every callback carries the epoch it was issued under and is dropped
/// once a newer `load` or `stop` has opened another epoch.
#[derive(Clone)]
pub struct TrackingSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    orders: Arc<dyn OrderBackend>,
    geocoder: Arc<dyn Geocoder>,
    feed: LocationFeed,
    settings: SessionSettings,
    metrics: Metrics,
    lifecycle: tokio::sync::Mutex<()>,
    state: Mutex<SessionState>,
    events_tx: broadcast::Sender<SessionEvent>,
}

#[derive(Debug)]
struct SessionState {
    session_id: Uuid,
    epoch: u64,
    order: Option<TrackedOrder>,
    auto_started: bool,
    connection: ConnectionState,
    driver_position: Option<Coordinate>,
    path: VecDeque<Coordinate>,
    pickup_route: Option<Vec<Coordinate>>,
    driver_route: Option<Vec<Coordinate>>,
    latest_route_seq: u64,
}

impl SessionState {
    fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            epoch: 0,
            order: None,
            auto_started: false,
            connection: ConnectionState::Disconnected,
            driver_position: None,
            path: VecDeque::new(),
            pickup_route: None,
            driver_route: None,
            latest_route_seq: 0,
        }
    }

    fn clear_tracking(&mut self) {
        self.connection = ConnectionState::Disconnected;
        self.driver_position = None;
        self.path.clear();
        self.pickup_route = None;
        self.driver_route = None;
    }

    fn push_point(&mut self, point: Coordinate, limit: usize) {
        if limit > 0 && self.path.len() >= limit {
            self.path.pop_front();
        }
        self.path.push_back(point);
        self.driver_position = Some(point);
    }

    fn point(&self, target: FocusTarget) -> Option<Coordinate> {
        match target {
            FocusTarget::Driver => self.driver_position,
            FocusTarget::Pickup => self.order.as_ref()?.pickup.coordinates,
            FocusTarget::Delivery => self.order.as_ref()?.delivery.coordinates,
        }
    }

    fn view(&self) -> ViewModel {
        let delivery = self.point(FocusTarget::Delivery);

        ViewModel {
            session_id: self.session_id,
            tracking_code: self.order.as_ref().map(|o| o.tracking_code.clone()),
            driver_name: self.order.as_ref().map(|o| o.driver_name.clone()),
            connection_state: self.connection,
            driver_position: self.driver_position,
            path: self.path.iter().copied().collect(),
            pickup: self.point(FocusTarget::Pickup),
            delivery,
            pickup_to_delivery_route: self.pickup_route.clone(),
            driver_to_delivery_route: self.driver_route.clone(),
            pending_coordinates: self
                .order
                .as_ref()
                .is_some_and(|o| o.endpoints().is_none()),
            remaining_km: self
                .driver_position
                .zip(delivery)
                .map(|(driver, delivery)| haversine_km(&driver, &delivery)),
        }
    }
}

impl SessionInner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Caller holds the state lock, so events leave in mutation order.
    fn publish(&self, state: &SessionState) {
        let _ = self.events_tx.send(SessionEvent::Snapshot(state.view()));
    }

    async fn geocode(&self, address: &str) -> Option<Coordinate> {
        match self.geocoder.geocode_address(address).await {
            Ok(Some(coordinate)) => Some(coordinate),
            Ok(None) => {
                warn!(address, "address has no geocoding match; tracking waits");
                None
            }
            Err(err) => {
                warn!(address, error = %err, "geocoding failed; tracking waits");
                None
            }
        }
    }

    fn apply_coordinates(
        &self,
        epoch: u64,
        pickup: Option<Coordinate>,
        delivery: Option<Coordinate>,
    ) -> Result<(), TrackingError> {
        let mut state = self.lock();
        if state.epoch != epoch {
            return Err(TrackingError::Superseded);
        }
        let Some(order) = state.order.as_mut() else {
            return Err(TrackingError::NoOrderLoaded);
        };

        if order.pickup.coordinates.is_none() {
            order.pickup.coordinates = pickup;
        }
        if order.delivery.coordinates.is_none() {
            order.delivery.coordinates = delivery;
        }

        self.publish(&state);
        Ok(())
    }

    async fn fetch_route(
        &self,
        pair: &'static str,
        origin: Coordinate,
        destination: Coordinate,
    ) -> Option<Vec<Coordinate>> {
        let started = Instant::now();
        let result = self
            .geocoder
            .route(origin, destination, self.settings.travel_mode)
            .await;
        self.metrics
            .route_latency_seconds
            .with_label_values(&[pair])
            .observe(started.elapsed().as_secs_f64());

        let outcome = result
            .map_err(|err| err.to_string())
            .and_then(|route| polyline::decode(&route.geometry).map_err(|err| err.to_string()));

        match outcome {
            Ok(geometry) => {
                self.metrics
                    .route_requests_total
                    .with_label_values(&[pair, "success"])
                    .inc();
                Some(geometry)
            }
            Err(err) => {
                self.metrics
                    .route_requests_total
                    .with_label_values(&[pair, "error"])
                    .inc();
                warn!(pair, error = %err, "route request failed; keeping previous geometry");
                None
            }
        }
    }

    async fn request_pickup_route(self: Arc<Self>, epoch: u64, pickup: Coordinate, delivery: Coordinate) {
        let Some(geometry) = self.fetch_route(PICKUP_PAIR, pickup, delivery).await else {
            return;
        };

        let mut state = self.lock();
        if state.epoch != epoch {
            self.metrics.stale_route_responses_total.inc();
            debug!(pair = PICKUP_PAIR, "dropping route from a previous epoch");
            return;
        }
        state.pickup_route = Some(geometry);
        self.publish(&state);
    }

    async fn request_driver_route(
        self: Arc<Self>,
        epoch: u64,
        seq: u64,
        origin: Coordinate,
        destination: Coordinate,
    ) {
        let Some(geometry) = self.fetch_route(DRIVER_PAIR, origin, destination).await else {
            return;
        };

        let mut state = self.lock();
        if state.epoch != epoch || state.latest_route_seq != seq {
            self.metrics.stale_route_responses_total.inc();
            debug!(seq, latest = state.latest_route_seq, "dropping superseded route");
            return;
        }
        state.driver_route = Some(geometry);
        self.publish(&state);
    }

    fn feed_handler(self: &Arc<Self>, epoch: u64) -> FeedHandler {
        let session = Arc::downgrade(self);
        Arc::new(move |event| {
            if let Some(session) = session.upgrade() {
                session.on_feed_event(epoch, event);
            }
        })
    }

    fn on_feed_event(self: &Arc<Self>, epoch: u64, event: FeedEvent) {
        match event {
            FeedEvent::State(connection) => {
                let mut state = self.lock();
                if state.epoch != epoch {
                    return;
                }
                state.connection = connection;
                self.publish(&state);
            }
            FeedEvent::Location(location) => self.on_location_update(epoch, location.coordinate()),
            FeedEvent::Closed { reason } => {
                warn!(reason = ?reason, "location feed closed; resume to restart tracking");
            }
        }
    }

    fn on_location_update(self: &Arc<Self>, epoch: u64, point: Coordinate) {
        let (seq, delivery) = {
            let mut state = self.lock();
            if state.epoch != epoch {
                return;
            }

            let first = state.path.is_empty();
            state.push_point(point, self.settings.path_history_limit);
            self.metrics.location_events_total.inc();
            self.publish(&state);

            if first {
                let _ = self.events_tx.send(SessionEvent::Focus(FocusRequest {
                    target: FocusTarget::Driver,
                    coordinate: point,
                }));
            }

            let Some(delivery) = state.point(FocusTarget::Delivery) else {
                return;
            };
            state.latest_route_seq += 1;
            (state.latest_route_seq, delivery)
        };

        tokio::spawn(self.clone().request_driver_route(epoch, seq, point, delivery));
    }

    async fn maybe_auto_start(self: &Arc<Self>, epoch: u64) {
        let (driver_id, pickup, delivery) = {
            let mut state = self.lock();
            if state.epoch != epoch || state.auto_started {
                return;
            }
            let Some(order) = state.order.as_ref() else {
                return;
            };
            if !order.has_driver() {
                debug!(tracking_code = %order.tracking_code, "no driver assigned; not tracking");
                return;
            }
            let Some((pickup, delivery)) = order.endpoints() else {
                debug!(tracking_code = %order.tracking_code, "waiting for coordinates");
                return;
            };
            let driver_id = order.driver_id.clone();
            state.auto_started = true;
            (driver_id, pickup, delivery)
        };

        info!(driver_id = %driver_id, "starting live tracking");
        tokio::spawn(self.clone().request_pickup_route(epoch, pickup, delivery));
        self.start_feed(epoch, &driver_id).await;
    }

    async fn start_feed(self: &Arc<Self>, epoch: u64, driver_id: &str) {
        match self.feed.start(driver_id, self.feed_handler(epoch)).await {
            Ok(()) => {}
            Err(FeedError::Superseded) => debug!(driver_id, "feed start superseded"),
            Err(err) => error!(driver_id, error = %err, "live tracking unavailable"),
        }
    }
}

impl TrackingSession {
    pub fn new(deps: SessionDeps, settings: SessionSettings, metrics: Metrics) -> Self {
        let (events_tx, _unused_rx) = broadcast::channel(settings.event_buffer_size.max(1));
        let feed = LocationFeed::new(deps.transport, settings.retry, metrics.clone());

        Self {
            inner: Arc::new(SessionInner {
                orders: deps.orders,
                geocoder: deps.geocoder,
                feed,
                settings,
                metrics,
                lifecycle: tokio::sync::Mutex::new(()),
                state: Mutex::new(SessionState::new()),
                events_tx,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn view(&self) -> ViewModel {
        self.inner.lock().view()
    }

    pub fn order(&self) -> Option<TrackedOrder> {
        self.inner.lock().order.clone()
    }

    pub fn feed(&self) -> &LocationFeed {
        &self.inner.feed
    }

    pub async fn load(&self, tracking_code: &str) -> Result<ViewModel, TrackingError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.stop_tracking().await;

        let data = match self.inner.orders.track_order(tracking_code).await {
            Ok(data) => data,
            Err(err) => {
                warn!(tracking_code, reason = err.reason(), error = %err, "tracking lookup failed");
                let mut state = self.inner.lock();
                state.epoch += 1;
                state.order = None;
                self.inner.publish(&state);
                return Err(err.into());
            }
        };

        let order = TrackedOrder::from(data);
        let pickup_address = order.pickup.name.clone();
        let delivery_address = order.delivery.name.clone();

        let epoch = {
            let mut state = self.inner.lock();
            state.epoch += 1;
            state.session_id = Uuid::new_v4();
            state.clear_tracking();
            state.order = Some(order);
            state.auto_started = false;
            self.inner.publish(&state);
            state.epoch
        };
        info!(tracking_code, "order loaded; geocoding endpoints");

        let (pickup, delivery) = tokio::join!(
            self.inner.geocode(&pickup_address),
            self.inner.geocode(&delivery_address),
        );
        self.inner.apply_coordinates(epoch, pickup, delivery)?;
        self.inner.maybe_auto_start(epoch).await;

        Ok(self.view())
    }

    /// Re-geocodes whichever endpoints are still unresolved.
    pub async fn retry_geocoding(&self) -> Result<ViewModel, TrackingError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let (epoch, pickup_address, delivery_address) = {
            let state = self.inner.lock();
            let order = state.order.as_ref().ok_or(TrackingError::NoOrderLoaded)?;
            let missing = |place: &Place| {
                place.coordinates.is_none().then(|| place.name.clone())
            };
            (state.epoch, missing(&order.pickup), missing(&order.delivery))
        };

        let geocode_missing = |address: Option<String>| async move {
            match address {
                Some(address) => self.inner.geocode(&address).await,
                None => None,
            }
        };
        let (pickup, delivery) = tokio::join!(
            geocode_missing(pickup_address),
            geocode_missing(delivery_address),
        );

        self.inner.apply_coordinates(epoch, pickup, delivery)?;
        self.inner.maybe_auto_start(epoch).await;

        Ok(self.view())
    }

    /// Restarts the feed for the loaded order. Path history is kept.
    pub async fn resume(&self) -> Result<ViewModel, TrackingError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let (epoch, driver_id, endpoints, need_pickup_route) = {
            let mut state = self.inner.lock();
            let order = state.order.as_ref().ok_or(TrackingError::NoOrderLoaded)?;
            if !order.has_driver() {
                return Err(TrackingError::NoDriver);
            }
            let pickup = order
                .pickup
                .coordinates
                .ok_or(TrackingError::PointUnavailable(FocusTarget::Pickup))?;
            let delivery = order
                .delivery
                .coordinates
                .ok_or(TrackingError::PointUnavailable(FocusTarget::Delivery))?;
            let driver_id = order.driver_id.clone();

            state.epoch += 1;
            state.auto_started = true;
            (
                state.epoch,
                driver_id,
                (pickup, delivery),
                state.pickup_route.is_none(),
            )
        };

        info!(driver_id = %driver_id, "resuming live tracking");
        if need_pickup_route {
            let (pickup, delivery) = endpoints;
            tokio::spawn(self.inner.clone().request_pickup_route(epoch, pickup, delivery));
        }
        self.inner.start_feed(epoch, &driver_id).await;

        Ok(self.view())
    }

    pub fn focus(&self, target: FocusTarget) -> Result<FocusRequest, TrackingError> {
        let state = self.inner.lock();
        let coordinate = state
            .point(target)
            .ok_or(TrackingError::PointUnavailable(target))?;

        let request = FocusRequest { target, coordinate };
        let _ = self.inner.events_tx.send(SessionEvent::Focus(request.clone()));
        Ok(request)
    }

    /// Drops the path and both routes. The loaded order stays; nothing
    /// restarts until `load` or `resume`.
    pub async fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.stop_tracking().await;
    }

    async fn stop_tracking(&self) {
        {
            let mut state = self.inner.lock();
            state.epoch += 1;
            state.auto_started = true;
            state.clear_tracking();
            self.inner.publish(&state);
        }
        self.inner.feed.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::broadcast;

    use super::{SessionDeps, SessionSettings, TrackingSession};
    use crate::error::{LookupError, TrackingError};
    use crate::mock::{tracking_data, MockGeocoder, MockOrderBackend, MockTransport};
    use crate::models::location::Coordinate;
    use crate::models::view::{ConnectionState, FocusTarget, SessionEvent, ViewModel};
    use crate::observability::metrics::Metrics;

    const PICKUP: Coordinate = Coordinate { lat: 10.0, lng: 106.0 };
    const DELIVERY: Coordinate = Coordinate { lat: 10.1, lng: 106.1 };

    struct Harness {
        session: TrackingSession,
        orders: MockOrderBackend,
        geocoder: MockGeocoder,
        transport: MockTransport,
        metrics: Metrics,
    }

    fn harness(geocoder: MockGeocoder) -> Harness {
        let orders = MockOrderBackend::new()
            .with_order(tracking_data("TRAK_X", "A", "B", "D1"))
            .with_order(tracking_data("TRAK_Y", "A", "B", "D2"))
            .with_order(tracking_data("NO_DRIVER", "A", "B", ""))
            .with_failure("DONE", LookupError::OrderCompleted);
        let transport = MockTransport::new();
        let metrics = Metrics::new();

        let session = TrackingSession::new(
            SessionDeps {
                orders: Arc::new(orders.clone()),
                geocoder: Arc::new(geocoder.clone()),
                transport: Arc::new(transport.clone()),
            },
            SessionSettings::default(),
            metrics.clone(),
        );

        Harness {
            session,
            orders,
            geocoder,
            transport,
            metrics,
        }
    }

    fn resolving_geocoder() -> MockGeocoder {
        MockGeocoder::new()
            .with_address("A", PICKUP)
            .with_address("B", DELIVERY)
    }

    async fn wait_for(
        rx: &mut broadcast::Receiver<SessionEvent>,
        predicate: impl Fn(&ViewModel) -> bool,
    ) -> ViewModel {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for session snapshot")
                .expect("session events closed");
            if let SessionEvent::Snapshot(view) = event {
                if predicate(&view) {
                    return view;
                }
            }
        }
    }

    fn driver_route_calls(geocoder: &MockGeocoder) -> usize {
        geocoder
            .route_calls()
            .iter()
            .filter(|(origin, _)| *origin != PICKUP)
            .count()
    }

    #[tokio::test]
    async fn tracks_driver_end_to_end() {
        let h = harness(resolving_geocoder());
        let mut rx = h.session.subscribe();

        let loaded = h.session.load("TRAK_X").await.unwrap();
        assert_eq!(loaded.pickup, Some(PICKUP));
        assert_eq!(loaded.delivery, Some(DELIVERY));
        assert_eq!(h.session.feed().entity_id().as_deref(), Some("D1"));

        h.transport.push_location("D1", 10.05, 106.05).await;
        h.transport.push_location("D1", 10.07, 106.08).await;

        let view = wait_for(&mut rx, |v| {
            v.path.len() == 2
                && v.pickup_to_delivery_route.is_some()
                && v.driver_to_delivery_route.as_ref().and_then(|r| r.first().copied())
                    == Some(Coordinate::new(10.07, 106.08))
        })
        .await;

        assert_eq!(
            view.path,
            vec![Coordinate::new(10.05, 106.05), Coordinate::new(10.07, 106.08)]
        );
        assert_eq!(view.driver_position, Some(Coordinate::new(10.07, 106.08)));
        assert_eq!(view.connection_state, ConnectionState::Receiving);
        assert!(view.remaining_km.is_some());
        assert_eq!(driver_route_calls(&h.geocoder), 2);
        let pickup_calls = h
            .geocoder
            .route_calls()
            .iter()
            .filter(|(origin, _)| *origin == PICKUP)
            .count();
        assert_eq!(pickup_calls, 1);
    }

    #[tokio::test]
    async fn first_location_requests_driver_focus() {
        let h = harness(resolving_geocoder());
        let mut rx = h.session.subscribe();
        h.session.load("TRAK_X").await.unwrap();

        h.transport.push_location("D1", 10.05, 106.05).await;

        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let SessionEvent::Focus(request) = event {
                assert_eq!(request.target, FocusTarget::Driver);
                assert_eq!(request.coordinate, Coordinate::new(10.05, 106.05));
                break;
            }
        }
    }

    #[tokio::test]
    async fn latest_route_request_wins() {
        let geocoder = resolving_geocoder();
        let mut held = geocoder.hold_routes();
        let h = harness(geocoder);
        let mut rx = h.session.subscribe();
        h.session.load("TRAK_X").await.unwrap();

        let pickup_route = held.recv().await.unwrap();
        assert_eq!(pickup_route.origin, PICKUP);
        pickup_route.respond(&[PICKUP, DELIVERY]);

        h.transport.push_location("D1", 10.05, 106.05).await;
        let r1 = held.recv().await.unwrap();
        h.transport.push_location("D1", 10.07, 106.08).await;
        let r2 = held.recv().await.unwrap();

        let r2_path = vec![r2.origin, Coordinate::new(10.09, 106.09), DELIVERY];
        r2.respond(&r2_path);
        wait_for(&mut rx, |v| v.driver_to_delivery_route.as_ref() == Some(&r2_path)).await;

        r1.respond(&[Coordinate::new(10.05, 106.05), DELIVERY]);
        h.transport.push_location("D9", 0.0, 0.0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.session.view().driver_to_delivery_route, Some(r2_path));
    }

    #[tokio::test]
    async fn failed_route_keeps_previous_geometry() {
        let h = harness(resolving_geocoder());
        let mut rx = h.session.subscribe();
        h.session.load("TRAK_X").await.unwrap();

        h.transport.push_location("D1", 10.05, 106.05).await;
        let first = wait_for(&mut rx, |v| v.driver_to_delivery_route.is_some()).await;

        h.geocoder.fail_routes(true);
        h.transport.push_location("D1", 10.07, 106.08).await;
        wait_for(&mut rx, |v| v.path.len() == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            h.session.view().driver_to_delivery_route,
            first.driver_to_delivery_route
        );
    }

    #[tokio::test]
    async fn malformed_geometry_is_skipped() {
        let geocoder = resolving_geocoder();
        let mut held = geocoder.hold_routes();
        let h = harness(geocoder);
        h.session.load("TRAK_X").await.unwrap();

        held.recv().await.unwrap().respond_encoded("_");
        h.transport.push_location("D1", 10.05, 106.05).await;
        held.recv().await.unwrap().respond_encoded("__________");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let view = h.session.view();
        assert_eq!(view.pickup_to_delivery_route, None);
        assert_eq!(view.driver_to_delivery_route, None);
        assert_eq!(view.path.len(), 1);
    }

    #[tokio::test]
    async fn waits_for_both_coordinates_then_starts_once() {
        let geocoder = MockGeocoder::new().with_address("A", PICKUP);
        let h = harness(geocoder);

        let view = h.session.load("TRAK_X").await.unwrap();
        assert!(view.pending_coordinates);
        assert_eq!(h.transport.opened(), 0);
        assert_eq!(h.session.feed().entity_id(), None);

        h.geocoder.add_address("B", DELIVERY);
        let view = h.session.retry_geocoding().await.unwrap();
        assert!(!view.pending_coordinates);
        assert_eq!(h.transport.opened(), 1);

        h.session.retry_geocoding().await.unwrap();
        assert_eq!(h.transport.opened(), 1);
        let pickup_geocodes = h.geocoder.geocode_calls().iter().filter(|a| *a == "A").count();
        assert_eq!(pickup_geocodes, 1);
    }

    #[tokio::test]
    async fn order_without_driver_never_tracks() {
        let h = harness(resolving_geocoder());
        h.session.load("NO_DRIVER").await.unwrap();
        assert_eq!(h.transport.opened(), 0);
    }

    #[tokio::test]
    async fn lookup_failure_is_typed_and_does_not_track() {
        let h = harness(resolving_geocoder());

        assert_eq!(
            h.session.load("DONE").await,
            Err(TrackingError::Lookup(LookupError::OrderCompleted))
        );
        assert_eq!(
            h.session.load("MISSING").await,
            Err(TrackingError::Lookup(LookupError::NotFound))
        );
        assert_eq!(h.orders.lookups(), 2);
        assert!(h.geocoder.geocode_calls().is_empty());
        assert_eq!(h.transport.opened(), 0);
        assert_eq!(h.session.view().tracking_code, None);
    }

    #[tokio::test]
    async fn reload_replaces_subscription_and_drops_stale_points() {
        let h = harness(resolving_geocoder());
        h.session.load("TRAK_X").await.unwrap();
        h.transport.push_location("D1", 10.05, 106.05).await;

        h.session.load("TRAK_Y").await.unwrap();
        let mut rx = h.session.subscribe();
        assert_eq!(h.session.feed().entity_id().as_deref(), Some("D2"));
        assert!(h.transport.calls().contains(&"invoke Unsubscribe D1".to_string()));

        h.transport.push_location("D1", 10.06, 106.06).await;
        h.transport.push_location("D2", 10.02, 106.02).await;
        let view = wait_for(&mut rx, |v| !v.path.is_empty()).await;

        assert_eq!(view.tracking_code.as_deref(), Some("TRAK_Y"));
        assert_eq!(view.path, vec![Coordinate::new(10.02, 106.02)]);
    }

    #[tokio::test]
    async fn stop_clears_live_state() {
        let h = harness(resolving_geocoder());
        let mut rx = h.session.subscribe();
        h.session.load("TRAK_X").await.unwrap();
        h.transport.push_location("D1", 10.05, 106.05).await;
        wait_for(&mut rx, |v| v.driver_to_delivery_route.is_some()).await;

        h.session.stop().await;

        let view = h.session.view();
        assert!(view.path.is_empty());
        assert_eq!(view.driver_position, None);
        assert_eq!(view.pickup_to_delivery_route, None);
        assert_eq!(view.driver_to_delivery_route, None);
        assert_eq!(view.connection_state, ConnectionState::Disconnected);
        assert_eq!(h.session.feed().entity_id(), None);

        h.session.retry_geocoding().await.unwrap();
        assert_eq!(h.transport.opened(), 1);
    }

    #[tokio::test]
    async fn resume_restarts_feed_after_close() {
        let h = harness(resolving_geocoder());
        let mut rx = h.session.subscribe();
        h.session.load("TRAK_X").await.unwrap();
        h.transport.push_location("D1", 10.05, 106.05).await;
        wait_for(&mut rx, |v| v.path.len() == 1).await;

        h.transport
            .emit(crate::feed::transport::HubEvent::Closed { reason: None })
            .await;
        wait_for(&mut rx, |v| v.connection_state == ConnectionState::Disconnected).await;

        let view = h.session.resume().await.unwrap();
        assert_eq!(view.connection_state, ConnectionState::Connected);
        assert_eq!(view.path.len(), 1);
        assert_eq!(h.transport.opened(), 2);
    }

    #[tokio::test]
    async fn path_history_is_bounded() {
        let geocoder = resolving_geocoder();
        let orders = MockOrderBackend::new().with_order(tracking_data("TRAK_X", "A", "B", "D1"));
        let transport = MockTransport::new();
        let session = TrackingSession::new(
            SessionDeps {
                orders: Arc::new(orders),
                geocoder: Arc::new(geocoder),
                transport: Arc::new(transport.clone()),
            },
            SessionSettings {
                path_history_limit: 2,
                ..SessionSettings::default()
            },
            Metrics::new(),
        );
        let mut rx = session.subscribe();
        session.load("TRAK_X").await.unwrap();

        for lat in [10.01, 10.02, 10.03] {
            transport.push_location("D1", lat, 106.0).await;
        }
        let view = wait_for(&mut rx, |v| v.driver_position == Some(Coordinate::new(10.03, 106.0))).await;

        assert_eq!(
            view.path,
            vec![Coordinate::new(10.02, 106.0), Coordinate::new(10.03, 106.0)]
        );
    }

    #[tokio::test]
    async fn focus_needs_a_known_point() {
        let h = harness(resolving_geocoder());
        assert_eq!(
            h.session.focus(FocusTarget::Pickup),
            Err(TrackingError::PointUnavailable(FocusTarget::Pickup))
        );

        h.session.load("TRAK_X").await.unwrap();
        assert_eq!(h.session.focus(FocusTarget::Delivery).unwrap().coordinate, DELIVERY);
        assert_eq!(
            h.session.focus(FocusTarget::Driver),
            Err(TrackingError::PointUnavailable(FocusTarget::Driver))
        );
    }

    #[tokio::test]
    async fn pickup_route_reply_after_stop_is_dropped() {
        let geocoder = resolving_geocoder();
        let mut held = geocoder.hold_routes();
        let h = harness(geocoder);
        h.session.load("TRAK_X").await.unwrap();

        let pickup_route = held.recv().await.unwrap();
        h.session.stop().await;
        pickup_route.respond(&[PICKUP, DELIVERY]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.session.view().pickup_to_delivery_route, None);
        assert_eq!(h.metrics.stale_route_responses_total.get(), 1);
    }

    #[tokio::test]
    async fn driver_route_reply_after_reload_is_dropped() {
        let geocoder = resolving_geocoder();
        let mut held = geocoder.hold_routes();
        let h = harness(geocoder);
        h.session.load("TRAK_X").await.unwrap();
        held.recv().await.unwrap().respond(&[PICKUP, DELIVERY]);

        h.transport.push_location("D1", 10.05, 106.05).await;
        let stale = held.recv().await.unwrap();
        assert_eq!(stale.origin, Coordinate::new(10.05, 106.05));

        h.session.load("TRAK_Y").await.unwrap();
        held.recv().await.unwrap().respond(&[PICKUP, DELIVERY]);
        stale.respond(&[Coordinate::new(10.05, 106.05), DELIVERY]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let view = h.session.view();
        assert_eq!(view.tracking_code.as_deref(), Some("TRAK_Y"));
        assert_eq!(view.driver_to_delivery_route, None);
        assert!(view.path.is_empty());
        assert_eq!(h.metrics.stale_route_responses_total.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_an_inflight_load() {
        let h = harness(resolving_geocoder());
        h.transport.fail_next_starts(2);

        let loading = tokio::spawn({
            let session = h.session.clone();
            async move { session.load("TRAK_X").await }
        });
        while !h.transport.calls().iter().any(|c| c == "start") {
            tokio::task::yield_now().await;
        }

        h.session.stop().await;
        let loaded = loading.await.unwrap().unwrap();

        assert_eq!(loaded.connection_state, ConnectionState::Connected);
        assert_eq!(h.session.feed().entity_id(), None);
        assert_eq!(h.session.view().connection_state, ConnectionState::Disconnected);
        let calls = h.transport.calls();
        assert!(calls.contains(&"invoke Unsubscribe D1".to_string()));
        assert_eq!(calls.last().map(String::as_str), Some("stop"));
    }

    #[tokio::test]
    async fn resume_needs_an_assigned_driver() {
        let h = harness(resolving_geocoder());
        h.session.load("NO_DRIVER").await.unwrap();

        assert_eq!(h.session.resume().await, Err(TrackingError::NoDriver));
        assert_eq!(h.transport.opened(), 0);
    }
}
