//! Connection establishment (§4.6): turns the signaling broker's
//! introductions into real, authenticated `TcpStream`s handed off to the
//! `TransportCoordinator`. Grounded on the teacher's WebRTC signaling dance
//! (`SignalingMessage::{Offer,Answer}` exchanged through an untrusted
//! relay), adapted for a plain TCP transport: since there is no browser
//! NAT-traversal layer to target, the `offer`/`answer` payload carries the
//! host's dialable `ip:port` instead of SDP. This is a deliberate
//! simplification of the original WebRTC flow, not a protocol change —
//! the relay still only ever sees an address, never key material.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::crypto::Crypto;
use crate::error::{Error, Result};
use crate::message::PeerMessage;
use crate::transport::signaling::{MatchRole, SignalingClient, SignalingMessage};
use crate::transport::TransportCoordinator;

/// How long an accepted or dialed socket has to complete the identity
/// handshake before it is abandoned (mirrors `SessionManagerConfig`'s
/// handshake timeout).
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the listening socket and the signaling event loop that together
/// produce real sessions. One instance per running peer.
pub struct MatchingService {
    crypto: Arc<Crypto>,
    transport: Arc<TransportCoordinator>,
    signaling: Arc<dyn SignalingClient>,
    listen_port: u16,
}

impl MatchingService {
    pub fn new(
        crypto: Arc<Crypto>,
        transport: Arc<TransportCoordinator>,
        signaling: Arc<dyn SignalingClient>,
        listen_port: u16,
    ) -> Self {
        Self {
            crypto,
            transport,
            signaling,
            listen_port,
        }
    }

    /// Bind the listener, announce a host slot, and spawn the accept loop
    /// and the signaling event loop as background tasks. Returns once both
    /// are running; they live for the process's lifetime.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.listen_port)).await?;
        let local_addr = listener.local_addr()?;

        self.signaling
            .send(SignalingMessage::HostSlot {
                peer_id: self.crypto.peer_id_hash().to_string(),
                storage: 0,
                duration: 0,
                public_key: hex::encode(self.crypto.public_signing_key()),
            })
            .await?;

        let acceptor = self.clone();
        tokio::spawn(async move { acceptor.accept_loop(listener).await });

        let signaler = self.clone();
        tokio::spawn(async move { signaler.signaling_loop(local_addr).await });

        Ok(())
    }

    /// Re-enter the matching conversation for `peer_id_hash`, used by the
    /// reconnect supervisor when a connected peer drops (§4.6). The broker
    /// relays this to the peer the same way it does for a first-time match.
    pub async fn request_connection(&self, peer_id_hash: &str) -> Result<()> {
        self.signaling
            .send(SignalingMessage::ConnectToPeer {
                target_peer_id: peer_id_hash.to_string(),
                requester_peer_id: self.crypto.peer_id_hash().to_string(),
            })
            .await
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept loop error");
                    continue;
                }
            };
            let service = self.clone();
            tokio::spawn(async move {
                if let Err(e) = service.handshake(stream, false).await {
                    tracing::warn!(peer_addr = %peer_addr, error = %e, "inbound handshake failed");
                }
            });
        }
    }

    /// Drive the broker conversation: accept inbound connection requests by
    /// advertising our dial address, and dial out when the broker matches us
    /// to a peer as the requester (§4.6).
    async fn signaling_loop(self: Arc<Self>, local_addr: SocketAddr) {
        while let Some(event) = self.signaling.next_event().await {
            match event {
                SignalingMessage::ConnectionRequest { requester_peer_id } => {
                    if let Err(e) = self
                        .signaling
                        .send(SignalingMessage::AcceptConnection {
                            requester_peer_id: requester_peer_id.clone(),
                            accept: true,
                        })
                        .await
                    {
                        tracing::warn!(peer = %requester_peer_id, error = %e, "failed to accept connection request");
                        continue;
                    }
                    let offer = SignalingMessage::Offer {
                        payload: local_addr.to_string(),
                        target_peer: requester_peer_id,
                    };
                    if let Err(e) = self.signaling.send(offer).await {
                        tracing::warn!(error = %e, "failed to send offer");
                    }
                }
                SignalingMessage::PeerMatched { peer_id, role: MatchRole::Requester } => {
                    let request = SignalingMessage::ConnectToPeer {
                        target_peer_id: peer_id,
                        requester_peer_id: self.crypto.peer_id_hash().to_string(),
                    };
                    if let Err(e) = self.signaling.send(request).await {
                        tracing::warn!(error = %e, "failed to request connection to matched peer");
                    }
                }
                SignalingMessage::PeerMatched { role: MatchRole::Host, .. } => {}
                SignalingMessage::Offer { payload, .. } | SignalingMessage::Answer { payload, .. } => {
                    let Ok(addr) = payload.parse::<SocketAddr>() else {
                        tracing::warn!(payload = %payload, "signaling payload is not a dialable address");
                        continue;
                    };
                    let service = self.clone();
                    tokio::spawn(async move {
                        match TcpStream::connect(addr).await {
                            Ok(stream) => {
                                if let Err(e) = service.handshake(stream, true).await {
                                    tracing::warn!(addr = %addr, error = %e, "outbound handshake failed");
                                }
                            }
                            Err(e) => tracing::warn!(addr = %addr, error = %e, "outbound dial failed"),
                        }
                    });
                }
                SignalingMessage::ConnectionRejected { reason } => {
                    tracing::info!(reason = %reason, "connection request rejected by peer");
                }
                SignalingMessage::ConnectionFailed { error } => {
                    tracing::warn!(error = %error, "signaling reported a connection failure");
                }
                SignalingMessage::HostSlot { .. } | SignalingMessage::SlotHosted => {}
                SignalingMessage::AcceptConnection { .. } | SignalingMessage::IceCandidate { .. } => {}
                SignalingMessage::ConnectToPeer { .. } => {}
            }
        }
    }

    /// Exchange `PeerIdentity` frames over the raw stream and verify the
    /// counterparty (§4.1(g)) before handing the stream to the transport
    /// coordinator. The dialing side writes first to break the symmetry.
    async fn handshake(&self, mut stream: TcpStream, write_first: bool) -> Result<()> {
        let peer_id_hash = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            exchange_identity(&self.crypto, &mut stream, write_first),
        )
        .await
        .map_err(|_| Error::MatchingTimeout)??;

        self.transport.adopt(&peer_id_hash, stream).await
    }
}

async fn exchange_identity(crypto: &Crypto, stream: &mut TcpStream, write_first: bool) -> Result<String> {
    let fingerprint = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let identity = crypto.sign_identity(Vec::new());
    let session_proof = crypto.generate_session_proof(fingerprint);
    let outbound = PeerMessage::PeerIdentity { identity, session_proof };

    let (read_half, mut write_half) = stream.split();
    let mut lines = BufReader::new(read_half).lines();

    if write_first {
        send_line(&mut write_half, &outbound).await?;
    }

    let line = lines
        .next_line()
        .await
        .map_err(|_| Error::MatchingTimeout)?
        .ok_or(Error::MatchingTimeout)?;
    let inbound = crate::message::decode_frame(&line)?;
    let PeerMessage::PeerIdentity { identity: peer_identity, session_proof: peer_proof } = inbound else {
        return Err(Error::Malformed("expected peer_identity as the first handshake frame".into()));
    };

    if !write_first {
        send_line(&mut write_half, &outbound).await?;
    }

    let verified = Crypto::verify_identity(&peer_identity)?;
    Crypto::verify_session_proof(&peer_proof, &verified.public_key)?;
    Ok(verified.peer_id_hash)
}

async fn send_line(write_half: &mut tokio::net::tcp::WriteHalf<'_>, message: &PeerMessage) -> Result<()> {
    let frame = crate::message::encode_frame(message)?;
    write_half.write_all(frame.as_bytes()).await.map_err(|_| Error::MatchingTimeout)?;
    write_half.write_all(b"\n").await.map_err(|_| Error::MatchingTimeout)?;
    write_half.flush().await.map_err(|_| Error::MatchingTimeout)
}
