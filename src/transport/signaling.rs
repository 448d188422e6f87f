//! The signaling rendezvous service is an external collaborator (§1, §6):
//! an untrusted relay that only brokers an initial connection. This module
//! models it as an opaque async trait, with a WebSocket-backed
//! implementation and a deterministic in-memory fake for tests — mirroring
//! the teacher's `Transport` trait / concrete-transport split.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    #[serde(rename = "host-slot")]
    HostSlot {
        #[serde(rename = "peerId")]
        peer_id: String,
        storage: u64,
        duration: u64,
        #[serde(rename = "publicKey")]
        public_key: String,
    },
    #[serde(rename = "connect-to-peer")]
    ConnectToPeer {
        #[serde(rename = "targetPeerId")]
        target_peer_id: String,
        #[serde(rename = "requesterPeerId")]
        requester_peer_id: String,
    },
    #[serde(rename = "accept-connection")]
    AcceptConnection {
        #[serde(rename = "requesterPeerId")]
        requester_peer_id: String,
        accept: bool,
    },
    #[serde(rename = "offer")]
    Offer { payload: String, #[serde(rename = "targetPeer")] target_peer: String },
    #[serde(rename = "answer")]
    Answer { payload: String, #[serde(rename = "targetPeer")] target_peer: String },
    #[serde(rename = "ice-candidate")]
    IceCandidate { payload: String, #[serde(rename = "targetPeer")] target_peer: String },
    #[serde(rename = "slot-hosted")]
    SlotHosted,
    #[serde(rename = "connection-request")]
    ConnectionRequest { #[serde(rename = "requesterPeerId")] requester_peer_id: String },
    #[serde(rename = "peer-matched")]
    PeerMatched { #[serde(rename = "peerId")] peer_id: String, role: MatchRole },
    #[serde(rename = "connection-rejected")]
    ConnectionRejected { reason: String },
    #[serde(rename = "connection-failed")]
    ConnectionFailed { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchRole {
    Host,
    Requester,
}

/// The signaling collaborator is authoritative only for introduction; no
/// data or keys pass through it (§4.6).
#[async_trait]
pub trait SignalingClient: Send + Sync {
    async fn send(&self, message: SignalingMessage) -> Result<()>;
    async fn next_event(&self) -> Option<SignalingMessage>;
}

/// Real implementation over a WebSocket connection to the broker.
pub struct WebSocketSignalingClient {
    outbound: mpsc::Sender<SignalingMessage>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<SignalingMessage>>,
}

impl WebSocketSignalingClient {
    /// Connect to `url` and spawn the read/write pump tasks. The actual
    /// socket plumbing (tokio-tungstenite connect, JSON frame codec) is
    /// driven by a background task so callers only ever see typed
    /// `SignalingMessage`s.
    pub async fn connect(url: &str) -> Result<Self> {
        use futures::{SinkExt, StreamExt};
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|_| Error::MatchingTimeout)?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<SignalingMessage>(64);
        let (inbound_tx, inbound_rx) = mpsc::channel::<SignalingMessage>(64);

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Ok(text) = serde_json::to_string(&message) {
                    if write
                        .send(tokio_tungstenite::tungstenite::Message::Text(text))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(Ok(msg)) = read.next().await {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    if let Ok(decoded) = serde_json::from_str::<SignalingMessage>(&text) {
                        if inbound_tx.send(decoded).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            outbound: outbound_tx,
            inbound: tokio::sync::Mutex::new(inbound_rx),
        })
    }
}

#[async_trait]
impl SignalingClient for WebSocketSignalingClient {
    async fn send(&self, message: SignalingMessage) -> Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    async fn next_event(&self) -> Option<SignalingMessage> {
        self.inbound.lock().await.recv().await
    }
}

/// Deterministic in-memory fake used by tests: a pair of queues that loop
/// messages back, or can be pre-seeded with scripted broker responses.
pub struct FakeSignalingClient {
    sent: tokio::sync::Mutex<Vec<SignalingMessage>>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<SignalingMessage>>,
    inbound_tx: mpsc::Sender<SignalingMessage>,
}

impl FakeSignalingClient {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            sent: tokio::sync::Mutex::new(Vec::new()),
            inbound: tokio::sync::Mutex::new(rx),
            inbound_tx: tx,
        }
    }

    pub async fn push_event(&self, message: SignalingMessage) {
        let _ = self.inbound_tx.send(message).await;
    }

    pub async fn sent_messages(&self) -> Vec<SignalingMessage> {
        self.sent.lock().await.clone()
    }
}

impl Default for FakeSignalingClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingClient for FakeSignalingClient {
    async fn send(&self, message: SignalingMessage) -> Result<()> {
        self.sent.lock().await.push(message);
        Ok(())
    }

    async fn next_event(&self) -> Option<SignalingMessage> {
        self.inbound.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_client_records_sent_messages() {
        let client = FakeSignalingClient::new();
        client
            .send(SignalingMessage::HostSlot {
                peer_id: "abc".into(),
                storage: 1024,
                duration: 3600,
                public_key: "deadbeef".into(),
            })
            .await
            .unwrap();
        let sent = client.sent_messages().await;
        assert_eq!(sent.len(), 1);
    }

    #[tokio::test]
    async fn fake_client_delivers_pushed_events() {
        let client = FakeSignalingClient::new();
        client
            .push_event(SignalingMessage::PeerMatched {
                peer_id: "xyz".into(),
                role: MatchRole::Host,
            })
            .await;
        let event = client.next_event().await.unwrap();
        matches!(event, SignalingMessage::PeerMatched { .. });
    }
}
