use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::warn;

use crate::error::LookupError;
use crate::models::order::OrderTrackingData;

#[async_trait]
pub trait OrderBackend: Send + Sync {
    async fn track_order(&self, tracking_code: &str) -> Result<OrderTrackingData, LookupError>;
}

#[derive(Clone)]
pub struct HttpOrderBackend {
    client: Client,
    base_url: String,
}

impl HttpOrderBackend {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BackendError {
    code: Option<String>,
    message: Option<String>,
}

fn classify_failure(status: StatusCode, body: &str) -> LookupError {
    let parsed = serde_json::from_str::<BackendError>(body).ok();

    if let Some(reason) = parsed
        .as_ref()
        .and_then(|err| err.code.as_deref())
        .and_then(LookupError::from_code)
    {
        return reason;
    }

    if status == StatusCode::NOT_FOUND {
        return LookupError::NotFound;
    }

    let message = parsed
        .and_then(|err| err.message)
        .unwrap_or_else(|| format!("status {status}"));
    LookupError::Unavailable(message)
}

#[async_trait]
impl OrderBackend for HttpOrderBackend {
    async fn track_order(&self, tracking_code: &str) -> Result<OrderTrackingData, LookupError> {
        let url = format!("{}/orders/tracking/{}", self.base_url, tracking_code);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| LookupError::Unavailable(err.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let err = classify_failure(status, &body);
            warn!(tracking_code, status = status.as_u16(), error = %err, "order lookup rejected");
            return Err(err);
        }

        resp.json::<OrderTrackingData>()
            .await
            .map_err(|err| LookupError::Unavailable(format!("malformed order payload: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::classify_failure;
    use crate::error::LookupError;

    #[test]
    fn backend_codes_map_to_typed_reasons() {
        assert_eq!(
            classify_failure(StatusCode::BAD_REQUEST, r#"{"code":"ORDER_COMPLETED"}"#),
            LookupError::OrderCompleted
        );
        assert_eq!(
            classify_failure(StatusCode::CONFLICT, r#"{"code":"ORDER_SCHEDULED","message":"later"}"#),
            LookupError::OrderScheduled
        );
    }

    #[test]
    fn bare_404_is_not_found() {
        assert_eq!(
            classify_failure(StatusCode::NOT_FOUND, "<html>nope</html>"),
            LookupError::NotFound
        );
    }

    #[test]
    fn unknown_failures_are_unavailable() {
        assert_eq!(
            classify_failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                r#"{"code":"DB_DOWN","message":"database offline"}"#
            ),
            LookupError::Unavailable("database offline".to_string())
        );
    }
}
