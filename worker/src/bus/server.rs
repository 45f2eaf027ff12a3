//! Bus server - accepts peers, fans out broadcasts and routes inbound envelopes.
//!
//! Connection lifecycle:
//! 1. The request path is validated against the endpoint allow-list. Invalid
//!    paths are closed with a policy-violation frame and never registered.
//! 2. Valid sockets join the [`PeerTable`] and run a receive loop until the
//!    peer closes, errors or the server is cancelled.
//! 3. Inbound envelopes stamped with our own originator id are dropped.
//!    Configuration changes are applied to the settings store and relayed to
//!    the other `/config` peers; everything else is forwarded to the pipeline
//!    as an [`InboundMessage`].

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::Uri;
use axum::response::Response;
use axum::Router;
use futures_util::StreamExt;
use shared_types::{ConfigUpdate, Endpoint, Envelope, OriginatorId};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::debounce::ConfigDebouncer;
use super::peers::{PeerId, PeerTable};
use super::Broadcaster;
use crate::settings::{ChangeOrigin, SettingChange, SettingsStore};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);
/// Peers silent for longer than this are reported by housekeeping.
const IDLE_PEER_AFTER: Duration = Duration::from_secs(300);

/// An envelope received from a peer, tagged with the endpoint it came in on.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub endpoint: Endpoint,
    pub envelope: Envelope,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to bind bus server on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// What the server did with one inbound text frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Loopback,
    Malformed,
    ConfigApplied,
    ConfigUnchanged,
    ConfigRejected,
    Forwarded,
    Dropped,
}

#[derive(Clone)]
pub struct BusServer {
    inner: Arc<BusInner>,
}

struct BusInner {
    id: OriginatorId,
    peers: PeerTable,
    debouncer: ConfigDebouncer,
    settings: Arc<SettingsStore>,
    inbound: mpsc::Sender<InboundMessage>,
    bound: Mutex<Option<SocketAddr>>,
    cancel: CancellationToken,
}

impl BusServer {
    pub fn new(
        settings: Arc<SettingsStore>,
        inbound: mpsc::Sender<InboundMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(BusInner {
                id: OriginatorId::generate("worker-bus"),
                peers: PeerTable::new(),
                debouncer: ConfigDebouncer::default(),
                settings,
                inbound,
                bound: Mutex::new(None),
                cancel,
            }),
        }
    }

    pub fn originator_id(&self) -> &OriginatorId {
        &self.inner.id
    }

    pub fn peers(&self) -> &PeerTable {
        &self.inner.peers
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    pub fn peer_count_for(&self, endpoint: Endpoint) -> usize {
        self.inner.peers.count_for(endpoint)
    }

    /// Bind to `127.0.0.1:port` and serve until cancelled.
    ///
    /// Calling this again after a successful start returns the address already
    /// in use without binding a second listener.
    pub async fn start(&self, port: u16) -> Result<SocketAddr, BusError> {
        let mut bound = self.inner.bound.lock().await;
        if let Some(addr) = *bound {
            tracing::debug!(%addr, "Bus server already running");
            return Ok(addr);
        }

        let requested = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(requested)
            .await
            .map_err(|source| BusError::Bind {
                addr: requested,
                source,
            })?;
        let addr = listener.local_addr().map_err(|source| BusError::Bind {
            addr: requested,
            source,
        })?;

        let router = self.router();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(error = %e, "Bus server stopped with error");
            }
            tracing::info!("Bus server stopped");
        });

        tokio::spawn(self.clone().run_housekeeping());

        tracing::info!(%addr, originator = %self.inner.id, "Bus server listening");
        *bound = Some(addr);
        Ok(addr)
    }

    pub fn router(&self) -> Router {
        Router::new()
            .fallback(accept_peer)
            .with_state(self.clone())
    }

    /// Send `envelope` to every peer on `endpoint`.
    ///
    /// Peers whose send fails are removed from the table. Returns the number
    /// of peers the envelope reached.
    pub async fn broadcast_to_endpoint(&self, endpoint: Endpoint, envelope: Envelope) -> usize {
        self.broadcast_except(endpoint, envelope, None).await
    }

    /// Like [`broadcast_to_endpoint`](Self::broadcast_to_endpoint) but skips
    /// the peer `skip`.
    async fn broadcast_except(
        &self,
        endpoint: Endpoint,
        envelope: Envelope,
        skip: Option<PeerId>,
    ) -> usize {
        let text = match envelope.stamped(&self.inner.id).to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, %endpoint, "Failed to serialize broadcast");
                return 0;
            }
        };

        let mut delivered = 0;
        for peer in self.inner.peers.snapshot(endpoint) {
            if Some(peer.id()) == skip {
                continue;
            }
            match peer.send_text(text.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(peer_id = peer.id(), %endpoint, error = %e, "Dropping unreachable peer");
                    self.inner.peers.remove(peer.id());
                }
            }
        }

        tracing::trace!(%endpoint, delivered, "Broadcast sent");
        delivered
    }

    /// Publish a configuration change on `/config`, subject to debouncing.
    ///
    /// `source` is the peer the change came from; it never gets it back.
    pub async fn broadcast_config_change(
        &self,
        key: &str,
        value: serde_json::Value,
        source: Option<PeerId>,
    ) -> usize {
        if !self.inner.debouncer.should_send(key, &value) {
            tracing::debug!(key, "Suppressing duplicate config broadcast");
            return 0;
        }
        match Envelope::config_update(key, value) {
            Ok(envelope) => self.broadcast_except(Endpoint::Config, envelope, source).await,
            Err(e) => {
                tracing::error!(error = %e, key, "Failed to encode config change");
                0
            }
        }
    }

    /// Forward settings changes to `/config` until cancelled.
    ///
    /// Changes received from a peer are relayed to every other `/config` peer.
    pub async fn run_config_forwarder(self, mut changes: broadcast::Receiver<SettingChange>) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                change = changes.recv() => match change {
                    Ok(change) => {
                        let source = match change.origin {
                            ChangeOrigin::Local => None,
                            ChangeOrigin::Remote(peer) => Some(peer),
                        };
                        self.broadcast_config_change(&change.key, change.value, source).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Config forwarder lagged behind settings changes");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    async fn run_housekeeping(self) {
        let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let now = std::time::Instant::now();
                    let pruned = self.inner.debouncer.prune_at(now);
                    if pruned > 0 {
                        tracing::trace!(pruned, "Pruned config debounce entries");
                    }
                    for peer in self.inner.peers.idle_since(now, IDLE_PEER_AFTER) {
                        tracing::debug!(
                            peer_id = peer.id(),
                            endpoint = %peer.endpoint(),
                            idle_secs = now.saturating_duration_since(peer.last_activity()).as_secs(),
                            "Bus peer idle"
                        );
                    }
                }
            }
        }
    }

    async fn handle_socket(self, endpoint: Endpoint, socket: WebSocket) {
        let (sink, mut stream) = socket.split();
        let peer = self.inner.peers.insert(endpoint, sink);
        tracing::info!(peer_id = peer.id(), %endpoint, "Bus peer connected");

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        peer.touch();
                        self.dispatch_inbound(endpoint, peer.id(), text.as_str()).await;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => peer.touch(),
                    Some(Ok(Message::Binary(_))) => {
                        tracing::debug!(peer_id = peer.id(), "Ignoring binary frame");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::warn!(peer_id = peer.id(), %endpoint, error = %e, "Bus peer receive error");
                        break;
                    }
                }
            }
        }

        if let Some(peer) = self.inner.peers.remove(peer.id()) {
            peer.close(None).await;
        }
        tracing::info!(peer_id = peer.id(), %endpoint, "Bus peer disconnected");
    }

    /// Route one inbound text frame received from peer `from`.
    pub async fn dispatch_inbound(
        &self,
        endpoint: Endpoint,
        from: PeerId,
        text: &str,
    ) -> InboundOutcome {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(%endpoint, error = %e, "Discarding malformed envelope");
                return InboundOutcome::Malformed;
            }
        };

        if envelope.is_from(&self.inner.id) {
            return InboundOutcome::Loopback;
        }

        if envelope.is_config_change() {
            return self.apply_remote_config(&envelope, from);
        }

        let message = InboundMessage { endpoint, envelope };
        match self.inner.inbound.send(message).await {
            Ok(()) => InboundOutcome::Forwarded,
            Err(_) => {
                tracing::debug!(%endpoint, "Inbound channel closed; dropping message");
                InboundOutcome::Dropped
            }
        }
    }

    fn apply_remote_config(&self, envelope: &Envelope, from: PeerId) -> InboundOutcome {
        let update: ConfigUpdate = match envelope.payload() {
            Ok(update) => update,
            Err(e) => {
                tracing::warn!(error = %e, "Config change without a valid payload");
                return InboundOutcome::Malformed;
            }
        };

        match self
            .inner
            .settings
            .apply(&update.key, update.value, ChangeOrigin::Remote(from))
        {
            Ok(true) => InboundOutcome::ConfigApplied,
            Ok(false) => InboundOutcome::ConfigUnchanged,
            Err(e) => {
                tracing::warn!(key = %update.key, error = %e, "Rejected remote config change");
                InboundOutcome::ConfigRejected
            }
        }
    }
}

#[async_trait]
impl Broadcaster for BusServer {
    async fn broadcast(&self, endpoint: Endpoint, envelope: Envelope) -> usize {
        self.broadcast_to_endpoint(endpoint, envelope).await
    }
}

async fn accept_peer(
    State(server): State<BusServer>,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    match Endpoint::parse(uri.path()) {
        Ok(endpoint) => ws.on_upgrade(move |socket| server.handle_socket(endpoint, socket)),
        Err(e) => {
            tracing::warn!(error = %e, "Refusing bus connection");
            ws.on_upgrade(|mut socket| async move {
                let frame = CloseFrame {
                    code: close_code::POLICY,
                    reason: "endpoint not allowed".into(),
                };
                let _ = socket.send(Message::Close(Some(frame))).await;
            })
        }
    }
}
