//! Bus client - one websocket per endpoint to the worker's bus server.
//!
//! A supervising loop keeps every endpoint connected. Each open socket runs
//! its own receive loop that turns envelopes into [`ClientEvent`]s for the
//! shell. Sends go through a per-socket lock; the connection map is never
//! held across an await.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use shared_types::{
    ConfigUpdate, Endpoint, Envelope, OriginatorId, SelectFilesRequest, STATUS_SELECT_FILES,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::notifications::Notifier;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the shell needs to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The worker wants the user to pick files from an archive.
    SelectFiles {
        task_id: String,
        request: SelectFilesRequest,
    },
    /// A setting changed on the worker side.
    ConfigChanged(ConfigUpdate),
    Error(Envelope),
    /// Status, progress and notification traffic.
    Status { endpoint: Endpoint, envelope: Envelope },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Open,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no open socket for {0}")]
    NotConnected(Endpoint),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("send on {endpoint} failed: {source}")]
    Send {
        endpoint: Endpoint,
        source: tokio_tungstenite::tungstenite::Error,
    },
}

struct Connection {
    sink: Mutex<SplitSink<WsStream, Message>>,
    last_activity: std::sync::Mutex<Instant>,
}

impl Connection {
    fn idle(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }
}

#[derive(Clone)]
pub struct BusClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    id: OriginatorId,
    config: Config,
    connections: DashMap<Endpoint, Arc<Connection>>,
    states: DashMap<Endpoint, LinkState>,
    reconnecting: AtomicBool,
    /// Set once any endpoint has opened; before that there is nothing to lose.
    ever_open: AtomicBool,
    events: mpsc::Sender<ClientEvent>,
    notifier: Arc<dyn Notifier>,
}

impl BusClient {
    pub fn new(config: Config, events: mpsc::Sender<ClientEvent>, notifier: Arc<dyn Notifier>) -> Self {
        let states = Endpoint::ALL
            .into_iter()
            .map(|endpoint| (endpoint, LinkState::Disconnected))
            .collect();
        Self {
            inner: Arc::new(ClientInner {
                id: OriginatorId::generate("desktop-bus"),
                config,
                connections: DashMap::new(),
                states,
                reconnecting: AtomicBool::new(false),
                ever_open: AtomicBool::new(false),
                events,
                notifier,
            }),
        }
    }

    pub fn originator_id(&self) -> &OriginatorId {
        &self.inner.id
    }

    pub fn state(&self, endpoint: Endpoint) -> LinkState {
        self.inner
            .states
            .get(&endpoint)
            .map(|state| *state)
            .unwrap_or(LinkState::Disconnected)
    }

    pub fn is_connected(&self, endpoint: Endpoint) -> bool {
        self.inner.connections.contains_key(&endpoint)
    }

    pub fn connected_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Keep every endpoint connected until `cancel` fires, then close all
    /// sockets.
    pub async fn run(self, port: u16, cancel: CancellationToken) {
        let mut attempt: u32 = 0;
        tracing::info!(port, originator = %self.inner.id, "Bus client starting");

        loop {
            let failures = self.connect_missing(port, &cancel).await;
            let wait = if failures == 0 {
                attempt = 0;
                if self.inner.reconnecting.swap(false, Ordering::SeqCst) {
                    self.inner.notifier.connection_restored();
                }
                self.inner.config.healthy_interval
            } else {
                attempt = attempt.saturating_add(1);
                self.mark_lost();
                self.inner.notifier.reconnect_attempt(attempt);
                self.inner.config.retry_interval
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        self.close_all().await;
        tracing::info!("Bus client stopped");
    }

    /// Connect every endpoint that has no open socket. Returns how many
    /// attempts failed.
    async fn connect_missing(&self, port: u16, cancel: &CancellationToken) -> usize {
        let mut failures = 0;
        for endpoint in Endpoint::ALL {
            if cancel.is_cancelled() {
                break;
            }
            if self.is_connected(endpoint) {
                continue;
            }

            self.set_state(endpoint, LinkState::Connecting);
            let url = format!("ws://127.0.0.1:{port}{}", endpoint.path());
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    let (sink, stream) = ws.split();
                    let connection = Arc::new(Connection {
                        sink: Mutex::new(sink),
                        last_activity: std::sync::Mutex::new(Instant::now()),
                    });
                    self.inner
                        .connections
                        .insert(endpoint, Arc::clone(&connection));
                    self.set_state(endpoint, LinkState::Open);
                    self.inner.ever_open.store(true, Ordering::SeqCst);
                    tracing::debug!(%endpoint, "Bus endpoint connected");

                    tokio::spawn(self.clone().receive_loop(
                        endpoint,
                        stream,
                        connection,
                        cancel.clone(),
                    ));
                }
                Err(e) => {
                    self.set_state(endpoint, LinkState::Disconnected);
                    tracing::warn!(%endpoint, error = %e, "Bus connect failed");
                    failures += 1;
                }
            }
        }
        failures
    }

    async fn receive_loop(
        self,
        endpoint: Endpoint,
        mut stream: SplitStream<WsStream>,
        connection: Arc<Connection>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        connection.touch();
                        if let Some(event) = self.route_inbound(endpoint, &text) {
                            if self.inner.events.send(event).await.is_err() {
                                tracing::debug!(%endpoint, "Event receiver gone");
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!(
                            %endpoint,
                            idle_ms = connection.idle().as_millis() as u64,
                            "Bus endpoint closed"
                        );
                        break;
                    }
                    Some(Ok(_)) => connection.touch(),
                    Some(Err(e)) => {
                        tracing::warn!(%endpoint, error = %e, "Bus receive failed");
                        break;
                    }
                }
            }
        }

        // A newer connection may already have replaced this one.
        self.inner
            .connections
            .remove_if(&endpoint, |_, current| Arc::ptr_eq(current, &connection));
        if !self.is_connected(endpoint) {
            self.set_state(endpoint, LinkState::Disconnected);
        }
        if !cancel.is_cancelled() {
            self.mark_lost();
        }
    }

    /// Decode one text frame received on `endpoint`.
    ///
    /// Returns `None` for malformed frames and for our own messages.
    pub fn route_inbound(&self, endpoint: Endpoint, text: &str) -> Option<ClientEvent> {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(%endpoint, error = %e, "Dropping malformed frame");
                return None;
            }
        };
        if envelope.is_from(&self.inner.id) {
            return None;
        }

        match endpoint {
            Endpoint::Install if envelope.status == STATUS_SELECT_FILES => {
                match envelope.payload::<SelectFilesRequest>() {
                    Ok(request) => Some(ClientEvent::SelectFiles {
                        task_id: envelope.task_id,
                        request,
                    }),
                    Err(e) => {
                        tracing::warn!(task_id = %envelope.task_id, error = %e, "Bad select_files payload");
                        None
                    }
                }
            }
            Endpoint::Config if envelope.is_config_change() => {
                match envelope.payload::<ConfigUpdate>() {
                    Ok(update) => Some(ClientEvent::ConfigChanged(update)),
                    Err(e) => {
                        tracing::warn!(error = %e, "Bad config_update payload");
                        None
                    }
                }
            }
            Endpoint::Error => Some(ClientEvent::Error(envelope)),
            _ => Some(ClientEvent::Status { endpoint, envelope }),
        }
    }

    /// Stamp and send `envelope` on `endpoint`.
    ///
    /// Without an open socket this only logs a warning; nothing is queued.
    pub async fn send_message(&self, envelope: Envelope, endpoint: Endpoint) -> Result<(), ClientError> {
        let Some(connection) = self
            .inner
            .connections
            .get(&endpoint)
            .map(|entry| Arc::clone(entry.value()))
        else {
            tracing::warn!(%endpoint, status = %envelope.status, "Not connected; message dropped");
            return Err(ClientError::NotConnected(endpoint));
        };

        let text = envelope.stamped(&self.inner.id).to_json()?;
        let mut sink = connection.sink.lock().await;
        if let Err(source) = sink.send(Message::Text(text)).await {
            drop(sink);
            tracing::warn!(%endpoint, error = %source, "Bus send failed; dropping socket");
            self.inner
                .connections
                .remove_if(&endpoint, |_, current| Arc::ptr_eq(current, &connection));
            self.set_state(endpoint, LinkState::Disconnected);
            return Err(ClientError::Send { endpoint, source });
        }
        drop(sink);
        connection.touch();
        Ok(())
    }

    async fn close_all(&self) {
        let connections: Vec<_> = self
            .inner
            .connections
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        for (endpoint, connection) in connections {
            let mut sink = connection.sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
            drop(sink);
            self.inner.connections.remove(&endpoint);
            self.set_state(endpoint, LinkState::Disconnected);
        }
    }

    /// Only the first loss of an outage is reported.
    fn mark_lost(&self) {
        if !self.inner.ever_open.load(Ordering::SeqCst) {
            return;
        }
        if !self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            self.inner.notifier.connection_lost();
        }
    }

    fn set_state(&self, endpoint: Endpoint, state: LinkState) {
        self.inner.states.insert(endpoint, state);
    }
}
