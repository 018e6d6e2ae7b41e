use std::env;
use std::time::Duration;

use crate::clients::geocoder::TravelMode;
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub event_buffer_size: usize,
    pub order_api_url: String,
    pub geocoder_url: String,
    pub geocoder_api_key: String,
    pub hub_url: String,
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
    pub path_history_limit: usize,
    pub travel_mode: TravelMode,
    pub map_style_url: Option<String>,
    pub map_api_key: Option<String>,
    pub static_dir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format {other}, expected compact/json")),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let connect_retry_delay_ms: u64 = parse_or_default("CONNECT_RETRY_DELAY_MS", 3000)?;
        let connect_attempts: u32 = parse_or_default("CONNECT_ATTEMPTS", 3)?;
        if connect_attempts == 0 {
            return Err(AppError::Internal(
                "invalid CONNECT_ATTEMPTS: must be > 0".to_string(),
            ));
        }

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format: parse_or_default("LOG_FORMAT", LogFormat::Compact)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            order_api_url: required("ORDER_API_URL")?,
            geocoder_url: env::var("GEOCODER_URL")
                .unwrap_or_else(|_| "https://rsapi.goong.io".to_string()),
            geocoder_api_key: required("GEOCODER_API_KEY")?,
            hub_url: required("HUB_URL")?,
            connect_attempts,
            connect_retry_delay: Duration::from_millis(connect_retry_delay_ms),
            path_history_limit: parse_or_default("PATH_HISTORY_LIMIT", 5000)?,
            travel_mode: parse_or_default("TRAVEL_MODE", TravelMode::Car)?,
            map_style_url: env::var("MAP_STYLE_URL").ok(),
            map_api_key: env::var("MAP_API_KEY").ok(),
            static_dir: env::var("STATIC_DIR").unwrap_or_else(|_| "static".to_string()),
        })
    }
}

fn required(key: &str) -> Result<String, AppError> {
    env::var(key).map_err(|_| AppError::Internal(format!("missing {key}")))
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
