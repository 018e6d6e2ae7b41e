use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::observability::metrics::Metrics;
use crate::tracking::render::MapService;
use crate::tracking::{SessionDeps, SessionSettings, TrackingSession};

pub struct AppState {
    pub sessions: DashMap<String, TrackingSession>,
    pub deps: SessionDeps,
    pub settings: SessionSettings,
    pub map: Arc<MapService>,
    pub metrics: Metrics,
    pub static_dir: String,
}

impl AppState {
    pub fn new(deps: SessionDeps, settings: SessionSettings, map: Arc<MapService>) -> Self {
        Self {
            sessions: DashMap::new(),
            deps,
            settings,
            map,
            metrics: Metrics::new(),
            static_dir: "static".to_string(),
        }
    }

    pub fn with_static_dir(mut self, static_dir: impl Into<String>) -> Self {
        self.static_dir = static_dir.into();
        self
    }

    pub fn session(&self, tracking_code: &str) -> TrackingSession {
        let session = self
            .sessions
            .entry(tracking_code.to_string())
            .or_insert_with(|| {
                TrackingSession::new(
                    self.deps.clone(),
                    self.settings.clone(),
                    self.metrics.clone(),
                )
            })
            .clone();

        self.metrics.active_sessions.set(self.sessions.len() as i64);
        session
    }

    pub fn existing(&self, tracking_code: &str) -> Option<TrackingSession> {
        self.sessions
            .get(tracking_code)
            .map(|entry| entry.value().clone())
    }

    /// Stops and forgets the session. Returns `false` if there was none.
    pub async fn remove(&self, tracking_code: &str) -> bool {
        let removed = self.sessions.remove(tracking_code);
        self.metrics.active_sessions.set(self.sessions.len() as i64);

        match removed {
            Some((_, session)) => {
                session.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn shutdown(&self) {
        let sessions: Vec<TrackingSession> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.sessions.clear();
        self.metrics.active_sessions.set(0);

        for session in sessions {
            session.stop().await;
        }
        info!("all tracking sessions stopped");
    }
}
