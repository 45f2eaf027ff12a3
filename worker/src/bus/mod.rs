//! Message bus - local WebSocket server multiplexing named endpoints
//!
//! One server per worker, bound to loopback on the rendezvous port handed out
//! by the launcher. Peers connect to one of the allow-listed endpoints in
//! [`shared_types::Endpoint`] and exchange JSON [`shared_types::Envelope`]s.

pub mod debounce;
pub mod peers;
pub mod server;

use async_trait::async_trait;
use shared_types::{Endpoint, Envelope};

pub use debounce::ConfigDebouncer;
pub use peers::{PeerId, PeerTable};
pub use server::{BusError, BusServer, InboundMessage};

/// Anything that can fan an envelope out to the peers of one endpoint.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Returns how many peers the envelope reached.
    async fn broadcast(&self, endpoint: Endpoint, envelope: Envelope) -> usize;
}
