use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::location::Coordinate;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusEntry {
    pub label: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderTrackingData {
    pub order_id: String,
    pub tracking_code: String,
    pub pickup_address: String,
    pub delivery_address: String,
    pub driver_id: String,
    pub driver_name: String,
    #[serde(default)]
    pub status_history: Vec<StatusEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Place {
    pub name: String,
    pub coordinates: Option<Coordinate>,
}

impl Place {
    pub fn unresolved(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            coordinates: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackedOrder {
    pub order_id: String,
    pub tracking_code: String,
    pub pickup: Place,
    pub delivery: Place,
    pub driver_id: String,
    pub driver_name: String,
    pub status_history: Vec<StatusEntry>,
}

impl TrackedOrder {
    pub fn has_driver(&self) -> bool {
        !self.driver_id.trim().is_empty()
    }

    pub fn endpoints(&self) -> Option<(Coordinate, Coordinate)> {
        Some((self.pickup.coordinates?, self.delivery.coordinates?))
    }
}

impl From<OrderTrackingData> for TrackedOrder {
    fn from(data: OrderTrackingData) -> Self {
        Self {
            order_id: data.order_id,
            tracking_code: data.tracking_code,
            pickup: Place::unresolved(data.pickup_address),
            delivery: Place::unresolved(data.delivery_address),
            driver_id: data.driver_id,
            driver_name: data.driver_name,
            status_history: data.status_history,
        }
    }
}
