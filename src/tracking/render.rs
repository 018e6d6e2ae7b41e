//! Map handle and the adapter that turns session events into frames a map
//! client can draw directly.

use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::location::Coordinate;
use crate::models::view::{ConnectionState, FocusTarget, SessionEvent, ViewModel};

const FOCUS_ZOOM: f64 = 15.0;

const PATH_COLOR: &str = "#1e88e5";
const PICKUP_ROUTE_COLOR: &str = "#9e9e9e";
const DRIVER_ROUTE_COLOR: &str = "#43a047";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("map service has not been initialised")]
    MapNotReady,

    #[error("map service is already initialised")]
    AlreadyInitialized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapConfig {
    pub style_url: String,
    pub api_key: Option<String>,
}

impl MapConfig {
    fn resolved_style_url(&self) -> String {
        match &self.api_key {
            Some(key) => format!("{}?api_key={}", self.style_url, key),
            None => self.style_url.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MapService {
    config: OnceLock<MapConfig>,
}

impl MapService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(&self, config: MapConfig) -> Result<(), RenderError> {
        self.config
            .set(config)
            .map_err(|_| RenderError::AlreadyInitialized)
    }

    pub fn is_ready(&self) -> bool {
        self.config.get().is_some()
    }

    fn config(&self) -> Result<&MapConfig, RenderError> {
        self.config.get().ok_or(RenderError::MapNotReady)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub id: String,
    pub color: String,
    pub coordinates: Vec<Coordinate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub target: FocusTarget,
    pub coordinate: Coordinate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub center: Coordinate,
    pub zoom: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderFrame {
    pub style_url: String,
    pub connection_state: Option<ConnectionState>,
    pub pending_coordinates: bool,
    pub layers: Vec<Layer>,
    pub markers: Vec<Marker>,
    pub camera: Option<Camera>,
}

#[derive(Clone)]
pub struct RenderAdapter {
    map: Arc<MapService>,
}

impl RenderAdapter {
    pub fn new(map: Arc<MapService>) -> Self {
        Self { map }
    }

    pub fn frame(&self, event: &SessionEvent) -> Result<RenderFrame, RenderError> {
        let style_url = self.map.config()?.resolved_style_url();

        let frame = match event {
            SessionEvent::Snapshot(view) => RenderFrame {
                style_url,
                connection_state: Some(view.connection_state),
                pending_coordinates: view.pending_coordinates,
                layers: layers(view),
                markers: markers(view),
                camera: None,
            },
            SessionEvent::Focus(request) => RenderFrame {
                style_url,
                connection_state: None,
                pending_coordinates: false,
                layers: Vec::new(),
                markers: Vec::new(),
                camera: Some(Camera {
                    center: request.coordinate,
                    zoom: FOCUS_ZOOM,
                }),
            },
        };

        Ok(frame)
    }
}

fn layers(view: &ViewModel) -> Vec<Layer> {
    let candidates = [
        ("pickup-route", PICKUP_ROUTE_COLOR, view.pickup_to_delivery_route.as_deref()),
        ("driver-route", DRIVER_ROUTE_COLOR, view.driver_to_delivery_route.as_deref()),
        ("path", PATH_COLOR, Some(view.path.as_slice())),
    ];

    candidates
        .into_iter()
        .filter_map(|(id, color, coordinates)| match coordinates {
            Some(coordinates) if coordinates.len() >= 2 => Some(Layer {
                id: id.to_string(),
                color: color.to_string(),
                coordinates: coordinates.to_vec(),
            }),
            _ => None,
        })
        .collect()
}

fn markers(view: &ViewModel) -> Vec<Marker> {
    [
        (FocusTarget::Pickup, view.pickup),
        (FocusTarget::Delivery, view.delivery),
        (FocusTarget::Driver, view.driver_position),
    ]
    .into_iter()
    .filter_map(|(target, coordinate)| Some(Marker {
        target,
        coordinate: coordinate?,
    }))
    .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::{MapConfig, MapService, RenderAdapter, RenderError};
    use crate::models::location::Coordinate;
    use crate::models::view::{
        ConnectionState, FocusRequest, FocusTarget, SessionEvent, ViewModel,
    };

    fn view() -> ViewModel {
        ViewModel {
            session_id: Uuid::nil(),
            tracking_code: Some("TRAK_X".to_string()),
            driver_name: Some("Minh".to_string()),
            connection_state: ConnectionState::Receiving,
            driver_position: Some(Coordinate::new(10.05, 106.05)),
            path: vec![Coordinate::new(10.05, 106.05)],
            pickup: Some(Coordinate::new(10.0, 106.0)),
            delivery: Some(Coordinate::new(10.1, 106.1)),
            pickup_to_delivery_route: Some(vec![
                Coordinate::new(10.0, 106.0),
                Coordinate::new(10.1, 106.1),
            ]),
            driver_to_delivery_route: None,
            pending_coordinates: false,
            remaining_km: Some(7.8),
        }
    }

    fn ready_map() -> Arc<MapService> {
        let map = Arc::new(MapService::new());
        map.init(MapConfig {
            style_url: "https://tiles.example/style.json".to_string(),
            api_key: Some("k".to_string()),
        })
        .unwrap();
        map
    }

    #[test]
    fn refuses_to_render_before_init() {
        let adapter = RenderAdapter::new(Arc::new(MapService::new()));
        assert_eq!(
            adapter.frame(&SessionEvent::Snapshot(view())),
            Err(RenderError::MapNotReady)
        );
    }

    #[test]
    fn init_happens_once() {
        let map = ready_map();
        assert!(map.is_ready());
        assert_eq!(
            map.init(MapConfig {
                style_url: "other".to_string(),
                api_key: None
            }),
            Err(RenderError::AlreadyInitialized)
        );
    }

    #[test]
    fn snapshot_draws_lines_and_markers() {
        let frame = RenderAdapter::new(ready_map())
            .frame(&SessionEvent::Snapshot(view()))
            .unwrap();

        assert_eq!(frame.style_url, "https://tiles.example/style.json?api_key=k");
        let ids: Vec<&str> = frame.layers.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["pickup-route"]);
        assert_eq!(frame.markers.len(), 3);
        assert_eq!(frame.camera, None);
    }

    #[test]
    fn focus_moves_the_camera() {
        let frame = RenderAdapter::new(ready_map())
            .frame(&SessionEvent::Focus(FocusRequest {
                target: FocusTarget::Delivery,
                coordinate: Coordinate::new(10.1, 106.1),
            }))
            .unwrap();

        let camera = frame.camera.unwrap();
        assert_eq!(camera.center, Coordinate::new(10.1, 106.1));
        assert!(frame.layers.is_empty());
    }
}
