use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::location::Coordinate;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Receiving,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FocusTarget {
    Driver,
    Pickup,
    Delivery,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FocusRequest {
    pub target: FocusTarget,
    pub coordinate: Coordinate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewModel {
    pub session_id: Uuid,
    pub tracking_code: Option<String>,
    pub driver_name: Option<String>,
    pub connection_state: ConnectionState,
    pub driver_position: Option<Coordinate>,
    pub path: Vec<Coordinate>,
    pub pickup: Option<Coordinate>,
    pub delivery: Option<Coordinate>,
    pub pickup_to_delivery_route: Option<Vec<Coordinate>>,
    pub driver_to_delivery_route: Option<Vec<Coordinate>>,
    pub pending_coordinates: bool,
    pub remaining_km: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data")]
pub enum SessionEvent {
    Snapshot(ViewModel),
    Focus(FocusRequest),
}
