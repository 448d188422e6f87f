//! Transport / Session component (§4.6): owns the per-peer session-state
//! map, the matching conversation with the signaling collaborator, and
//! the live data channels. Grounded on the teacher's
//! `TransportCoordinator` (one coordinator owning many concrete
//! connections plus a session-lifecycle manager).

pub mod channel;
pub mod keepalive;
pub mod matching;
pub mod session;
pub mod signaling;

pub use channel::PeerChannel;
pub use matching::MatchingService;
pub use session::{ManagedSession, SessionManager, SessionManagerConfig};
pub use signaling::{MatchRole, SignalingClient, SignalingMessage, WebSocketSignalingClient};
pub use state::SessionState;

pub mod state;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::error::{Error, Result};
use crate::message::PeerMessage;

/// Holds the live `PeerChannel`s alongside the `SessionManager`'s state
/// tracking. Channels and session state are split (teacher idiom: state
/// machine separate from the concrete connection) so the dispatcher can
/// query state without touching socket internals.
pub struct TransportCoordinator {
    pub sessions: SessionManager,
    channels: RwLock<HashMap<String, Arc<PeerChannel>>>,
    inbound_tx: mpsc::Sender<(String, PeerMessage)>,
    missed_pings: RwLock<HashMap<String, u32>>,
}

impl TransportCoordinator {
    /// `inbound_tx` is the dispatcher's single inbound queue; every
    /// channel's reader pump feeds into it so inbound messages across
    /// all peers interleave in arrival order at one point (§4.7).
    pub fn new(config: SessionManagerConfig, inbound_tx: mpsc::Sender<(String, PeerMessage)>) -> Self {
        Self {
            sessions: SessionManager::new(config),
            channels: RwLock::new(HashMap::new()),
            inbound_tx,
            missed_pings: RwLock::new(HashMap::new()),
        }
    }

    /// Register a freshly matched+handshaken connection as `peer_id_hash`'s
    /// data channel, driving the session through the legal transition
    /// sequence so `is_connected`/`peer_is_connected` reflect reality
    /// (§4.6). A peer resuming from `Reconnecting` steps straight to
    /// `Connected`; a brand-new or closed peer walks the full
    /// Matching→Handshaking→Connected sequence.
    pub async fn adopt(&self, peer_id_hash: &str, stream: tokio::net::TcpStream) -> Result<()> {
        self.sessions.create_session(peer_id_hash).await?;
        match self.sessions.state_of(peer_id_hash).await {
            Some(SessionState::Connected) => {}
            Some(SessionState::Reconnecting) => {
                self.sessions.transition(peer_id_hash, SessionState::Connected).await?;
            }
            _ => {
                self.sessions.transition(peer_id_hash, SessionState::Matching).await?;
                self.sessions.transition(peer_id_hash, SessionState::Handshaking).await?;
                self.sessions.transition(peer_id_hash, SessionState::Connected).await?;
            }
        }
        self.missed_pings.write().await.insert(peer_id_hash.to_string(), 0);

        let channel = PeerChannel::spawn(peer_id_hash.to_string(), stream, self.inbound_tx.clone());
        self.channels
            .write()
            .await
            .insert(peer_id_hash.to_string(), Arc::new(channel));
        Ok(())
    }

    /// Send a keepalive `Ping` to every connected peer, incrementing its
    /// missed-ack counter first (reset to 0 by `record_pong`). Returns the
    /// peers whose counter has reached `keepalive::MISSED_ACKS_BEFORE_DISCONNECT`
    /// so the caller can disconnect and hand them to the reconnect
    /// supervisor (§4.6).
    pub async fn tick_keepalive(&self) -> Vec<String> {
        let connected = self.sessions.connected_peers().await;
        let mut exhausted = Vec::new();
        for peer_id_hash in connected {
            let ts = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64;
            if self.send(&peer_id_hash, PeerMessage::Ping { ts }).await.is_err() {
                continue;
            }
            let missed = {
                let mut missed_pings = self.missed_pings.write().await;
                let counter = missed_pings.entry(peer_id_hash.clone()).or_insert(0);
                *counter += 1;
                *counter
            };
            if missed >= keepalive::MISSED_ACKS_BEFORE_DISCONNECT {
                exhausted.push(peer_id_hash);
            }
        }
        exhausted
    }

    /// Record a `Pong` from `peer_id_hash`, resetting its missed-ack count.
    pub async fn record_pong(&self, peer_id_hash: &str) {
        self.missed_pings.write().await.insert(peer_id_hash.to_string(), 0);
    }

    /// Drop the data channel but leave the session in `Reconnecting` rather
    /// than `Closed`, so the reconnect supervisor picks it up (§4.6).
    pub async fn enter_reconnecting(&self, peer_id_hash: &str) {
        self.channels.write().await.remove(peer_id_hash);
        self.missed_pings.write().await.remove(peer_id_hash);
        self.sessions
            .transition(peer_id_hash, SessionState::Reconnecting)
            .await
            .ok();
    }

    pub async fn send(&self, peer_id_hash: &str, message: PeerMessage) -> Result<()> {
        let channels = self.channels.read().await;
        let channel = channels.get(peer_id_hash).ok_or(Error::ChannelClosed)?;
        let result = channel.send(message).await;
        let sent = result.is_ok() as u64;
        drop(channels);
        self.sessions.record_activity(peer_id_hash, sent, 0).await;
        if result.is_err() {
            self.sessions.transition(peer_id_hash, SessionState::Reconnecting).await.ok();
        }
        result
    }

    pub async fn disconnect(&self, peer_id_hash: &str) {
        self.channels.write().await.remove(peer_id_hash);
        self.missed_pings.write().await.remove(peer_id_hash);
        self.sessions.terminate_session(peer_id_hash).await;
    }

    pub async fn is_connected(&self, peer_id_hash: &str) -> bool {
        self.sessions.state_of(peer_id_hash).await == Some(SessionState::Connected)
    }
}
