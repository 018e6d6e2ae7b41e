use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use serde_json::json;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crate::api::rest::tracking::existing_session;
use crate::error::AppError;
use crate::models::view::SessionEvent;
use crate::state::AppState;
use crate::tracking::render::RenderAdapter;
use crate::tracking::TrackingSession;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(code): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let session = existing_session(&state, &code)?;
    let adapter = RenderAdapter::new(state.map.clone());
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, code, session, adapter)))
}

async fn handle_socket(
    socket: WebSocket,
    code: String,
    session: TrackingSession,
    adapter: RenderAdapter,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(session.subscribe());

    info!(tracking_code = %code, "render client connected");

    let send_task = tokio::spawn(async move {
        let mut next = Some(SessionEvent::Snapshot(session.view()));

        loop {
            let event = match next.take() {
                Some(event) => event,
                None => match events.next().await {
                    Some(Ok(event)) => event,
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        warn!(skipped, "render client lagged; resending current view");
                        SessionEvent::Snapshot(session.view())
                    }
                    None => break,
                },
            };

            let payload = match adapter.frame(&event) {
                Ok(frame) => serde_json::to_string(&frame),
                Err(err) => {
                    let _ = sender
                        .send(Message::Text(json!({ "error": err.to_string() }).to_string()))
                        .await;
                    break;
                }
            };

            let json = match payload {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize render frame");
                    continue;
                }
            };

            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!(tracking_code = %code, "render client disconnected");
}
