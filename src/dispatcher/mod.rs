//! Dispatcher (§4.7): the single inbound message path. Every decoded
//! frame from every peer channel passes through one ordered queue and is
//! routed by kind, gated by the rate limiter and the peer's ban state.
//! Grounded on the teacher's single-consumer mesh-event loop.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::allocation::AllocationLedger;
use crate::crypto::Crypto;
use crate::error::Result;
use crate::message::PeerMessage;
use crate::rate_limit::{RateLimitResult, RateLimiter};
use crate::reputation::{ReputationEngine, ReputationEvent};
use crate::store::Store;
use crate::transfer::TransferPipeline;
use crate::transport::{SessionState, TransportCoordinator};
use crate::verification::VerificationEngine;

/// Everything the dispatcher needs to route and handle one inbound
/// message, gathered so the loop itself stays a thin router (§4.7).
pub struct Dispatcher {
    crypto: Arc<Crypto>,
    store: Arc<Store>,
    rate_limiter: Arc<RateLimiter>,
    reputation: Arc<ReputationEngine>,
    allocation: Arc<AllocationLedger>,
    transport: Arc<TransportCoordinator>,
    transfer: Arc<TransferPipeline>,
    verification: Arc<VerificationEngine>,
    dropped_count: std::sync::atomic::AtomicU64,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        crypto: Arc<Crypto>,
        store: Arc<Store>,
        rate_limiter: Arc<RateLimiter>,
        reputation: Arc<ReputationEngine>,
        allocation: Arc<AllocationLedger>,
        transport: Arc<TransportCoordinator>,
        transfer: Arc<TransferPipeline>,
        verification: Arc<VerificationEngine>,
    ) -> Self {
        Self {
            crypto,
            store,
            rate_limiter,
            reputation,
            allocation,
            transport,
            transfer,
            verification,
            dropped_count: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn drop_message(&self, reason: &str, peer_id_hash: &str) {
        self.dropped_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::warn!(peer = %peer_id_hash, reason, "dropping inbound message");
    }

    /// Run the dispatcher loop until `inbound` closes. This is the single
    /// consumer for every adopted `PeerChannel`'s reader pump (§4.7, §5).
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<(String, PeerMessage)>) {
        while let Some((peer_id_hash, message)) = inbound.recv().await {
            self.dispatch_one(&peer_id_hash, message).await;
        }
    }

    /// Route exactly one message, per §4.7's ordered steps.
    pub async fn dispatch_one(&self, peer_id_hash: &str, message: PeerMessage) {
        // Step 2/3: rate limiting (also covers the ban check).
        match self.rate_limiter.check(peer_id_hash, message.kind()) {
            RateLimitResult::Allowed => {}
            RateLimitResult::Blocked(reason) => {
                self.drop_message(&format!("{reason:?}"), peer_id_hash);
                return;
            }
        }

        // Step 4: directly-handled kinds.
        match &message {
            PeerMessage::Ping { ts } => {
                let _ = self
                    .transport
                    .send(peer_id_hash, PeerMessage::Pong { original_ts: *ts, peer_id_hash: self.crypto.peer_id_hash().to_string() })
                    .await;
                return;
            }
            PeerMessage::Pong { .. } => {
                self.transport.record_pong(peer_id_hash).await;
                self.reputation.record(peer_id_hash, ReputationEvent::Connection { success: true, response_time_ms: 0 });
                return;
            }
            PeerMessage::PeerIdentity { .. } => {
                // Identity/session-proof verification happens during the
                // handshaking transition, which owns the session-state
                // machine; a PeerIdentity arriving afterward is a no-op
                // re-announcement.
                return;
            }
            _ => {}
        }

        // Step 5/6: transfer and verification routing.
        if message.is_transfer_kind() {
            self.handle_transfer(peer_id_hash, message).await;
            return;
        }
        if message.is_verification_kind() {
            self.handle_verification(peer_id_hash, message).await;
            return;
        }

        // Step 7: unroutable kind.
        tracing::warn!(peer = %peer_id_hash, kind = message.kind(), "unhandled message kind");
    }

    async fn handle_transfer(&self, peer_id_hash: &str, message: PeerMessage) {
        match message {
            PeerMessage::FileStart { transfer_id, file_name, file_size, total_chunks, file_hash, .. } => {
                let Some(public_key) = self.peer_public_key(peer_id_hash) else {
                    return;
                };
                if !self.allocation.may_accept(peer_id_hash, file_size) {
                    return;
                }
                self.allocation.record_offer_accepted(peer_id_hash, file_size);
                let ack = self.transfer.on_file_start(&transfer_id, &file_name, total_chunks, &file_hash, peer_id_hash, public_key);
                let _ = self.transport.send(peer_id_hash, ack).await;
            }
            PeerMessage::FileChunk { transfer_id, chunk_index, ciphertext_base64, chunk_hash, .. } => {
                let ack = self
                    .transfer
                    .on_file_chunk(&self.crypto, &transfer_id, chunk_index, &ciphertext_base64, &chunk_hash);
                let _ = self.transport.send(peer_id_hash, ack).await;
            }
            PeerMessage::ChunkAck { transfer_id, chunk_index, result } => {
                if let Err(e) = self.transfer.apply_chunk_ack(&transfer_id, chunk_index, &result) {
                    tracing::warn!(peer = %peer_id_hash, transfer_id, error = %e, "failed to apply chunk ack");
                }
            }
            PeerMessage::FileComplete { transfer_id } => match self.transfer.on_file_complete(&transfer_id).await {
                Ok(ack) => {
                    let _ = self.transport.send(peer_id_hash, ack).await;
                }
                Err(e) => {
                    tracing::warn!(peer = %peer_id_hash, error = %e, "file complete failed");
                }
            },
            _ => {}
        }
    }

    async fn handle_verification(&self, peer_id_hash: &str, message: PeerMessage) {
        match message {
            PeerMessage::StorageCommitment { .. } => {
                match crate::verification::commitment_from_message(peer_id_hash, &message) {
                    Ok(commitment) => match crate::verification::verify_commitment(&commitment) {
                        Ok(()) => {
                            if let Err(e) = self.store.upsert_storage_commitment(&commitment) {
                                tracing::warn!(peer = %peer_id_hash, error = %e, "failed to persist storage commitment");
                            }
                        }
                        Err(e) => {
                            self.drop_message(&format!("invalid commitment: {e}"), peer_id_hash);
                        }
                    },
                    Err(e) => self.drop_message(&format!("malformed commitment: {e}"), peer_id_hash),
                }
            }
            PeerMessage::StorageChallenge { id, backup_id, kind, sample_indices, nonce, issued_at, .. } => {
                let nonce_bytes: Option<[u8; 32]> = nonce.and_then(|n| hex::decode(n).ok()).and_then(|b| b.try_into().ok());
                let proof = match crate::verification::build_proof_data(
                    &self.store,
                    &backup_id,
                    kind,
                    &sample_indices,
                    nonce_bytes.as_ref(),
                    issued_at,
                ) {
                    Ok(data) => crate::message::PeerMessage::StorageProof {
                        challenge_id: id,
                        result: crate::message::ProofResult::Ok { data },
                    },
                    Err(e) => crate::message::PeerMessage::StorageProof {
                        challenge_id: id,
                        result: crate::message::ProofResult::Error { reason: e.to_string() },
                    },
                };
                let _ = self.transport.send(peer_id_hash, proof).await;
            }
            PeerMessage::StorageProof { challenge_id, result } => {
                let _ = self
                    .verification
                    .verify_proof(&self.store, &challenge_id, &result, &self.reputation, peer_id_hash);
            }
            _ => {}
        }
    }

    fn peer_public_key(&self, peer_id_hash: &str) -> Option<[u8; 32]> {
        self.store
            .get_cached_peer_connection(peer_id_hash)
            .ok()
            .flatten()
            .map(|c| c.public_key)
    }

    /// Whether `peer_id_hash` currently has a connected session; used by
    /// handlers that should only act while the peer channel is live.
    pub async fn peer_is_connected(&self, peer_id_hash: &str) -> bool {
        self.transport.sessions.state_of(peer_id_hash).await == Some(SessionState::Connected)
    }
}
