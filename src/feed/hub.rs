use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::feed::protocol::{self, HubMessage};
use crate::feed::transport::{HubConnection, HubEvent, LocationTransport, RECEIVE_LOCATION};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Delays before each automatic reconnect attempt after an unrequested close.
pub const RECONNECT_SCHEDULE_MS: [u64; 6] = [0, 2_000, 5_000, 10_000, 15_000, 30_000];

const INVOKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct WsHubTransport {
    url: String,
    reconnect_schedule: Vec<Duration>,
}

impl WsHubTransport {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            reconnect_schedule: RECONNECT_SCHEDULE_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }
}

impl LocationTransport for WsHubTransport {
    fn open(&self, events: mpsc::Sender<HubEvent>) -> Arc<dyn HubConnection> {
        Arc::new(WsHubConnection {
            shared: Arc::new(Shared {
                url: self.url.clone(),
                reconnect_schedule: self.reconnect_schedule.clone(),
                events,
                writer: tokio::sync::Mutex::new(None),
                pending: DashMap::new(),
                next_invocation: AtomicU64::new(1),
                stopping: AtomicBool::new(false),
                reader: Mutex::new(None),
            }),
        })
    }
}

struct WsHubConnection {
    shared: Arc<Shared>,
}

struct Shared {
    url: String,
    reconnect_schedule: Vec<Duration>,
    events: mpsc::Sender<HubEvent>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    pending: DashMap<String, oneshot::Sender<Result<(), String>>>,
    next_invocation: AtomicU64,
    stopping: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn fail_pending(&self, reason: &str) {
        let ids: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, reply)) = self.pending.remove(&id) {
                let _ = reply.send(Err(reason.to_string()));
            }
        }
    }

    async fn emit(&self, event: HubEvent) {
        if self.events.send(event).await.is_err() {
            debug!("hub event receiver dropped");
        }
    }

    /// Returns `Err(reason)` when the server asked to close the connection.
    async fn handle_frame(&self, payload: &str) -> Result<(), Option<String>> {
        let message = match protocol::parse_message(payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "ignoring malformed hub frame");
                return Ok(());
            }
        };

        match message {
            HubMessage::Invocation {
                target, arguments, ..
            } if target == RECEIVE_LOCATION => match protocol::location_arguments(&arguments) {
                Some((entity_id, lat, lng)) => {
                    self.emit(HubEvent::ReceiveLocation {
                        entity_id,
                        lat,
                        lng,
                    })
                    .await;
                }
                None => warn!(?arguments, "malformed ReceiveLocation arguments"),
            },
            HubMessage::Invocation { target, .. } => {
                debug!(target = %target, "ignoring unhandled hub invocation");
            }
            HubMessage::Completion {
                invocation_id,
                error,
            } => {
                if let Some((_, reply)) = self.pending.remove(&invocation_id) {
                    let _ = reply.send(error.map_or(Ok(()), Err));
                }
            }
            HubMessage::Ping => {}
            HubMessage::Close { error } => return Err(error),
            HubMessage::Unsupported(kind) => debug!(kind, "ignoring unsupported hub message"),
        }

        Ok(())
    }

    async fn pump(&self, source: &mut WsSource, leftover: Vec<String>) -> Option<String> {
        for payload in leftover {
            if let Err(reason) = self.handle_frame(&payload).await {
                return reason;
            }
        }

        while let Some(message) = source.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    for payload in protocol::split_frames(text.as_str()) {
                        if let Err(reason) = self.handle_frame(payload).await {
                            return reason;
                        }
                    }
                }
                Ok(Message::Close(frame)) => {
                    return frame.map(|frame| frame.reason.to_string());
                }
                Ok(_) => {}
                Err(err) => return Some(err.to_string()),
            }
        }

        None
    }

    async fn reconnect(&self) -> Option<(WsSink, WsSource, Vec<String>)> {
        self.emit(HubEvent::Reconnecting).await;

        for (attempt, delay) in self.reconnect_schedule.iter().enumerate() {
            sleep(*delay).await;
            if self.stopping.load(Ordering::SeqCst) {
                return None;
            }

            match dial(&self.url).await {
                Ok(connection) => {
                    info!(attempt = attempt + 1, "hub reconnected");
                    return Some(connection);
                }
                Err(err) => warn!(attempt = attempt + 1, error = %err, "hub reconnect failed"),
            }
        }

        None
    }
}

async fn dial(url: &str) -> Result<(WsSink, WsSource, Vec<String>), TransportError> {
    let (stream, _) = connect_async(url)
        .await
        .map_err(|err| TransportError::Connect(err.to_string()))?;
    let (mut sink, mut source) = stream.split();

    sink.send(Message::Text(protocol::frame(protocol::HANDSHAKE_REQUEST).into()))
        .await
        .map_err(|err| TransportError::Handshake(err.to_string()))?;

    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let mut frames = protocol::split_frames(text.as_str()).map(str::to_string);
                let Some(reply) = frames.next() else {
                    continue;
                };
                protocol::parse_handshake(&reply)?;
                return Ok((sink, source, frames.collect()));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => return Err(TransportError::Handshake(err.to_string())),
        }
    }

    Err(TransportError::Handshake(
        "connection closed during handshake".to_string(),
    ))
}

async fn run_reader(shared: Arc<Shared>, mut source: WsSource, mut leftover: Vec<String>) {
    loop {
        let reason = shared.pump(&mut source, std::mem::take(&mut leftover)).await;
        shared.fail_pending("connection lost");
        *shared.writer.lock().await = None;

        if shared.stopping.load(Ordering::SeqCst) {
            return;
        }
        warn!(reason = ?reason, "hub connection lost");

        match shared.reconnect().await {
            Some((sink, next_source, next_leftover)) => {
                *shared.writer.lock().await = Some(sink);
                source = next_source;
                leftover = next_leftover;
                shared.emit(HubEvent::Reconnected).await;
            }
            None => {
                if !shared.stopping.load(Ordering::SeqCst) {
                    shared.emit(HubEvent::Closed { reason }).await;
                }
                return;
            }
        }
    }
}

#[async_trait]
impl HubConnection for WsHubConnection {
    async fn start(&self) -> Result<(), TransportError> {
        self.shared.stopping.store(false, Ordering::SeqCst);
        let (sink, source, leftover) = dial(&self.shared.url).await?;
        *self.shared.writer.lock().await = Some(sink);

        let reader = tokio::spawn(run_reader(self.shared.clone(), source, leftover));
        let previous = self
            .shared
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(reader);
        if let Some(previous) = previous {
            previous.abort();
        }

        info!(url = %self.shared.url, "hub connected");
        Ok(())
    }

    async fn invoke(&self, method: &str, entity_id: &str) -> Result<(), TransportError> {
        let invocation_id = self
            .shared
            .next_invocation
            .fetch_add(1, Ordering::SeqCst)
            .to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.pending.insert(invocation_id.clone(), reply_tx);

        let payload = protocol::invocation(&invocation_id, method, &[json!(entity_id)]);
        let invoke_error = |reason: String| TransportError::Invoke {
            method: method.to_string(),
            reason,
        };

        {
            let mut writer = self.shared.writer.lock().await;
            let Some(sink) = writer.as_mut() else {
                self.shared.pending.remove(&invocation_id);
                return Err(TransportError::NotConnected);
            };
            if let Err(err) = sink.send(Message::Text(payload.into())).await {
                self.shared.pending.remove(&invocation_id);
                return Err(invoke_error(err.to_string()));
            }
        }

        match timeout(INVOKE_TIMEOUT, reply_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(invoke_error(reason)),
            Ok(Err(_)) => Err(invoke_error("completion channel dropped".to_string())),
            Err(_) => {
                self.shared.pending.remove(&invocation_id);
                Err(invoke_error("timed out waiting for completion".to_string()))
            }
        }
    }

    async fn stop(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);

        if let Some(mut sink) = self.shared.writer.lock().await.take() {
            if let Err(err) = sink.close().await {
                debug!(error = %err, "hub close handshake failed");
            }
        }

        let reader = self
            .shared
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }

        self.shared.fail_pending("connection stopped");
    }
}
