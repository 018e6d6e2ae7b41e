use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub location_events_total: IntCounter,
    pub route_requests_total: IntCounterVec,
    pub stale_route_responses_total: IntCounter,
    pub connect_attempts_total: IntCounterVec,
    pub active_sessions: IntGauge,
    pub route_latency_seconds: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let location_events_total = IntCounter::new(
            "location_events_total",
            "Driver location events applied to tracking sessions",
        )
        .expect("valid location_events_total metric");

        let route_requests_total = IntCounterVec::new(
            Opts::new("route_requests_total", "Route geometry requests by pair and outcome"),
            &["pair", "outcome"],
        )
        .expect("valid route_requests_total metric");

        let stale_route_responses_total = IntCounter::new(
            "stale_route_responses_total",
            "Route responses dropped because a newer request superseded them",
        )
        .expect("valid stale_route_responses_total metric");

        let connect_attempts_total = IntCounterVec::new(
            Opts::new("connect_attempts_total", "Location feed handshake attempts by outcome"),
            &["outcome"],
        )
        .expect("valid connect_attempts_total metric");

        let active_sessions = IntGauge::new("active_sessions", "Tracking sessions currently held")
            .expect("valid active_sessions metric");

        let route_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "route_latency_seconds",
                "Latency of route geometry requests in seconds",
            ),
            &["pair"],
        )
        .expect("valid route_latency_seconds metric");

        registry
            .register(Box::new(location_events_total.clone()))
            .expect("register location_events_total");
        registry
            .register(Box::new(route_requests_total.clone()))
            .expect("register route_requests_total");
        registry
            .register(Box::new(stale_route_responses_total.clone()))
            .expect("register stale_route_responses_total");
        registry
            .register(Box::new(connect_attempts_total.clone()))
            .expect("register connect_attempts_total");
        registry
            .register(Box::new(active_sessions.clone()))
            .expect("register active_sessions");
        registry
            .register(Box::new(route_latency_seconds.clone()))
            .expect("register route_latency_seconds");

        Self {
            registry,
            location_events_total,
            route_requests_total,
            stale_route_responses_total,
            connect_attempts_total,
            active_sessions,
            route_latency_seconds,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
