use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;

use crate::error::{AppError, TrackingError};
use crate::models::view::{FocusRequest, FocusTarget, ViewModel};
use crate::state::AppState;
use crate::tracking::TrackingSession;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/tracking/:code",
            post(load_tracking).get(get_tracking).delete(stop_tracking),
        )
        .route("/tracking/:code/geocode", post(retry_geocoding))
        .route("/tracking/:code/resume", post(resume_tracking))
        .route("/tracking/:code/focus", post(focus))
}

#[derive(Deserialize)]
pub struct FocusBody {
    pub target: FocusTarget,
}

pub(crate) fn validate_code(code: &str) -> Result<(), AppError> {
    let valid = !code.is_empty()
        && code.len() <= 64
        && code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!("invalid tracking code {code:?}")))
    }
}

pub(crate) fn existing_session(state: &AppState, code: &str) -> Result<TrackingSession, AppError> {
    validate_code(code)?;
    state
        .existing(code)
        .ok_or_else(|| AppError::NotFound(format!("no tracking session for {code}")))
}

async fn load_tracking(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<ViewModel>, AppError> {
    validate_code(&code)?;
    match state.session(&code).load(&code).await {
        Ok(view) => Ok(Json(view)),
        Err(err @ TrackingError::Lookup(_)) => {
            state.remove(&code).await;
            Err(err.into())
        }
        Err(err) => Err(err.into()),
    }
}

async fn get_tracking(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<ViewModel>, AppError> {
    let session = existing_session(&state, &code)?;
    Ok(Json(session.view()))
}

async fn stop_tracking(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<StatusCode, AppError> {
    validate_code(&code)?;
    if state.remove(&code).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("no tracking session for {code}")))
    }
}

async fn retry_geocoding(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<ViewModel>, AppError> {
    let session = existing_session(&state, &code)?;
    Ok(Json(session.retry_geocoding().await?))
}

async fn resume_tracking(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<ViewModel>, AppError> {
    let session = existing_session(&state, &code)?;
    Ok(Json(session.resume().await?))
}

async fn focus(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Json(payload): Json<FocusBody>,
) -> Result<Json<FocusRequest>, AppError> {
    let session = existing_session(&state, &code)?;
    Ok(Json(session.focus(payload.target)?))
}

#[cfg(test)]
mod tests {
    use super::validate_code;

    #[test]
    fn tracking_codes_are_url_safe() {
        assert!(validate_code("TRAK_X-01").is_ok());
        assert!(validate_code("").is_err());
        assert!(validate_code("../admin").is_err());
        assert!(validate_code(&"A".repeat(65)).is_err());
    }
}
