pub mod api;
pub mod clients;
pub mod config;
pub mod error;
pub mod feed;
pub mod geo;
pub mod mock;
pub mod models;
pub mod observability;
pub mod state;
pub mod tracking;
