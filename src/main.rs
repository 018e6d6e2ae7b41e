use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use order_tracker::api;
use order_tracker::clients::geocoder::HttpGeocoder;
use order_tracker::clients::orders::HttpOrderBackend;
use order_tracker::config::{Config, LogFormat};
use order_tracker::error::AppError;
use order_tracker::feed::hub::WsHubTransport;
use order_tracker::feed::RetryPolicy;
use order_tracker::state::AppState;
use order_tracker::tracking::render::{MapConfig, MapService};
use order_tracker::tracking::{SessionDeps, SessionSettings};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false);
    match config.log_format {
        LogFormat::Compact => subscriber.compact().init(),
        LogFormat::Json => subscriber.json().init(),
    }

    let http = reqwest::Client::builder()
        .build()
        .map_err(|err| AppError::Internal(format!("failed to build http client: {err}")))?;

    let deps = SessionDeps {
        orders: Arc::new(HttpOrderBackend::new(http.clone(), &config.order_api_url)),
        geocoder: Arc::new(HttpGeocoder::new(
            http,
            &config.geocoder_url,
            &config.geocoder_api_key,
        )),
        transport: Arc::new(WsHubTransport::new(&config.hub_url)),
    };
    let settings = SessionSettings {
        retry: RetryPolicy {
            attempts: config.connect_attempts,
            delay: config.connect_retry_delay,
        },
        path_history_limit: config.path_history_limit,
        travel_mode: config.travel_mode,
        event_buffer_size: config.event_buffer_size,
    };

    let map = Arc::new(MapService::new());
    match &config.map_style_url {
        Some(style_url) => map
            .init(MapConfig {
                style_url: style_url.clone(),
                api_key: config.map_api_key.clone(),
            })
            .map_err(|err| AppError::Internal(err.to_string()))?,
        None => tracing::warn!("MAP_STYLE_URL not set; render streams will refuse clients"),
    }

    let shared_state =
        Arc::new(AppState::new(deps, settings, map).with_static_dir(config.static_dir.clone()));
    let app = api::rest::router(shared_state.clone());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port = config.http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    shared_state.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
