//! Live peer table for the bus server.
//!
//! Each accepted socket gets a [`Peer`] holding its endpoint and the sending
//! half of the socket. Sends to one peer are serialized by that peer's own
//! lock; the table itself is never locked while a send is in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use dashmap::DashMap;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use shared_types::Endpoint;
use tokio::sync::Mutex;

pub type PeerId = u64;

type PeerSink = SplitSink<WebSocket, Message>;

pub struct Peer {
    id: PeerId,
    endpoint: Endpoint,
    sink: Mutex<PeerSink>,
    last_activity: std::sync::Mutex<Instant>,
}

impl Peer {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn last_activity(&self) -> Instant {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }

    pub async fn send_text(&self, text: String) -> Result<(), axum::Error> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text.into())).await?;
        drop(sink);
        self.touch();
        Ok(())
    }

    /// Best effort; the socket may already be gone.
    pub async fn close(&self, frame: Option<CloseFrame>) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(frame)).await;
        let _ = sink.close().await;
    }
}

#[derive(Default)]
pub struct PeerTable {
    next_id: AtomicU64,
    peers: DashMap<PeerId, Arc<Peer>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, endpoint: Endpoint, sink: PeerSink) -> Arc<Peer> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let peer = Arc::new(Peer {
            id,
            endpoint,
            sink: Mutex::new(sink),
            last_activity: std::sync::Mutex::new(Instant::now()),
        });
        self.peers.insert(id, Arc::clone(&peer));
        peer
    }

    pub fn remove(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.remove(&id).map(|(_, peer)| peer)
    }

    /// Peers currently registered on `endpoint`.
    ///
    /// The returned handles outlive the table's shard locks, so callers can
    /// await sends without blocking inserts or removals.
    pub fn snapshot(&self, endpoint: Endpoint) -> Vec<Arc<Peer>> {
        self.peers
            .iter()
            .filter(|entry| entry.value().endpoint == endpoint)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Peers with no traffic in either direction for at least `idle`.
    pub fn idle_since(&self, now: Instant, idle: Duration) -> Vec<Arc<Peer>> {
        self.peers
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.value().last_activity()) >= idle)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn count_for(&self, endpoint: Endpoint) -> usize {
        self.peers
            .iter()
            .filter(|entry| entry.value().endpoint == endpoint)
            .count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
