use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::models::view::FocusTarget;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("order has already been completed")]
    OrderCompleted,

    #[error("order is still pending")]
    OrderPending,

    #[error("order is scheduled and not yet on the road")]
    OrderScheduled,

    #[error("order has been shipped")]
    OrderShipped,

    #[error("no order matches this tracking code")]
    NotFound,

    #[error("order backend unavailable: {0}")]
    Unavailable(String),
}

impl LookupError {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "ORDER_COMPLETED" => Some(Self::OrderCompleted),
            "ORDER_PENDING" => Some(Self::OrderPending),
            "ORDER_SCHEDULED" => Some(Self::OrderScheduled),
            "ORDER_SHIPPED" => Some(Self::OrderShipped),
            "NOT_FOUND" => Some(Self::NotFound),
            _ => None,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::OrderCompleted => "OrderCompleted",
            Self::OrderPending => "OrderPending",
            Self::OrderScheduled => "OrderScheduled",
            Self::OrderShipped => "OrderShipped",
            Self::NotFound => "NotFound",
            Self::Unavailable(_) => "Unavailable",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GeocodeError {
    #[error("geocoder request failed: {0}")]
    Request(String),

    #[error("geocoder returned status {0}")]
    Status(u16),

    #[error("no route between the requested points")]
    NoRoute,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("invocation of {method} failed: {reason}")]
    Invoke { method: String, reason: String },

    #[error("connection is not open")]
    NotConnected,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("gave up connecting after {attempts} attempts: {last}")]
    ConnectFailed { attempts: u32, last: TransportError },

    #[error("superseded by a newer start or stop")]
    Superseded,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TrackingError {
    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error("no order is loaded")]
    NoOrderLoaded,

    #[error("no driver is assigned to this order")]
    NoDriver,

    #[error("{0:?} has no known coordinates")]
    PointUnavailable(FocusTarget),

    #[error("a newer load replaced this one")]
    Superseded,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("lookup failed: {0}")]
    Lookup(LookupError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TrackingError> for AppError {
    fn from(err: TrackingError) -> Self {
        match err {
            TrackingError::Lookup(lookup) => AppError::Lookup(lookup),
            TrackingError::NoOrderLoaded => AppError::Conflict(err.to_string()),
            TrackingError::NoDriver => AppError::Conflict(err.to_string()),
            TrackingError::PointUnavailable(_) => AppError::Conflict(err.to_string()),
            TrackingError::Superseded => AppError::Conflict(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message, reason) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone(), None),
            AppError::Lookup(lookup) => {
                let status = match lookup {
                    LookupError::NotFound => StatusCode::NOT_FOUND,
                    LookupError::Unavailable(_) => StatusCode::BAD_GATEWAY,
                    _ => StatusCode::UNPROCESSABLE_ENTITY,
                };
                (status, lookup.to_string(), Some(lookup.reason()))
            }
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), None),
        };

        let body = Json(json!({
            "error": message,
            "reason": reason,
        }));

        (status, body).into_response()
    }
}
