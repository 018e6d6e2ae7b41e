use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

pub const SUBSCRIBE: &str = "Subscribe";
pub const UNSUBSCRIBE: &str = "Unsubscribe";
pub const RECEIVE_LOCATION: &str = "ReceiveLocation";

#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    ReceiveLocation { entity_id: String, lat: f64, lng: f64 },
    Reconnecting,
    Reconnected,
    Closed { reason: Option<String> },
}

#[async_trait]
pub trait HubConnection: Send + Sync {
    async fn start(&self) -> Result<(), TransportError>;

    async fn invoke(&self, method: &str, entity_id: &str) -> Result<(), TransportError>;

    /// Closes the connection and disables automatic reconnect. Idempotent.
    async fn stop(&self);
}

pub trait LocationTransport: Send + Sync {
    fn open(&self, events: mpsc::Sender<HubEvent>) -> Arc<dyn HubConnection>;
}
