//! The peer channel wire format (§6): a closed tagged union decoded once
//! at the dispatcher boundary (§9 — "dynamic-typed JSON messages on the
//! wire"). Every variant here is a message kind named in §4.6–§4.9.

use serde::{Deserialize, Serialize};

use crate::crypto::{SessionProof, SignedIdentity};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PeerMessage {
    #[serde(rename = "peer_identity")]
    PeerIdentity {
        identity: SignedIdentity,
        session_proof: SessionProof,
    },
    #[serde(rename = "ping")]
    Ping { ts: u64 },
    #[serde(rename = "pong")]
    Pong { original_ts: u64, peer_id_hash: String },

    #[serde(rename = "storage_commitment")]
    StorageCommitment {
        bytes_offered: u64,
        availability_terms: String,
        retention_period_ms: u64,
        created_at: u64,
        expires_at: u64,
        encryption_public_key: String,
        signing_public_key: String,
        signature: String,
    },
    #[serde(rename = "storage_challenge")]
    StorageChallenge {
        id: String,
        backup_id: String,
        kind: ChallengeKind,
        /// Chunk indices to hash for `RandomBlocks`; empty for the other
        /// two kinds.
        sample_indices: Vec<u32>,
        /// Nonce mixed into the proof hash, hex-encoded; present for
        /// `FileHash` and `MetadataProof`, absent for `RandomBlocks`.
        nonce: Option<String>,
        issued_at: u64,
        expires_at: u64,
    },
    #[serde(rename = "storage_proof")]
    StorageProof {
        challenge_id: String,
        result: ProofResult,
    },

    #[serde(rename = "backup_start")]
    BackupStart { backup_id: String, file_count: u32 },
    #[serde(rename = "file_start")]
    FileStart {
        transfer_id: String,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
        chunk_size: u32,
        file_hash: String,
        resume_from_chunk: u32,
    },
    #[serde(rename = "file_start_ack")]
    FileStartAck { transfer_id: String, ready: bool },
    #[serde(rename = "file_chunk")]
    FileChunk {
        transfer_id: String,
        chunk_index: u32,
        chunk_size: u32,
        ciphertext_base64: String,
        chunk_hash: String,
    },
    #[serde(rename = "chunk_ack")]
    ChunkAck {
        transfer_id: String,
        chunk_index: u32,
        result: ChunkAckResult,
    },
    #[serde(rename = "file_complete")]
    FileComplete { transfer_id: String },
    #[serde(rename = "file_complete_ack")]
    FileCompleteAck {
        transfer_id: String,
        result: FileCompleteResult,
    },
    #[serde(rename = "backup_complete")]
    BackupComplete { backup_id: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    RandomBlocks,
    FileHash,
    MetadataProof,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome")]
pub enum ProofResult {
    #[serde(rename = "ok")]
    Ok { data: serde_json::Value },
    #[serde(rename = "error")]
    Error { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome")]
pub enum ChunkAckResult {
    #[serde(rename = "received")]
    Received,
    #[serde(rename = "error")]
    Error { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome")]
pub enum FileCompleteResult {
    #[serde(rename = "success")]
    Success { relative_name: String },
    #[serde(rename = "error")]
    Error { reason: String },
}

impl PeerMessage {
    /// The `type` discriminant, used by the rate limiter's per-message-type
    /// caps (§4.3) and by dispatcher routing (§4.7).
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::PeerIdentity { .. } => "peer_identity",
            PeerMessage::Ping { .. } => "ping",
            PeerMessage::Pong { .. } => "pong",
            PeerMessage::StorageCommitment { .. } => "storage_commitment",
            PeerMessage::StorageChallenge { .. } => "storage_challenge",
            PeerMessage::StorageProof { .. } => "storage_proof",
            PeerMessage::BackupStart { .. } => "backup_start",
            PeerMessage::FileStart { .. } => "file_start",
            PeerMessage::FileStartAck { .. } => "file_start_ack",
            PeerMessage::FileChunk { .. } => "file_chunk",
            PeerMessage::ChunkAck { .. } => "chunk_ack",
            PeerMessage::FileComplete { .. } => "file_complete",
            PeerMessage::FileCompleteAck { .. } => "file_complete_ack",
            PeerMessage::BackupComplete { .. } => "backup_complete",
        }
    }

    pub fn is_transfer_kind(&self) -> bool {
        matches!(
            self,
            PeerMessage::BackupStart { .. }
                | PeerMessage::FileStart { .. }
                | PeerMessage::FileStartAck { .. }
                | PeerMessage::FileChunk { .. }
                | PeerMessage::ChunkAck { .. }
                | PeerMessage::FileComplete { .. }
                | PeerMessage::FileCompleteAck { .. }
                | PeerMessage::BackupComplete { .. }
        )
    }

    pub fn is_verification_kind(&self) -> bool {
        matches!(
            self,
            PeerMessage::StorageCommitment { .. }
                | PeerMessage::StorageChallenge { .. }
                | PeerMessage::StorageProof { .. }
        )
    }
}

/// Decode one newline-delimited JSON frame. An unknown `type` or malformed
/// payload is a `ProtocolError` (§7, §9).
pub fn decode_frame(line: &str) -> crate::error::Result<PeerMessage> {
    serde_json::from_str(line).map_err(|e| crate::error::Error::Malformed(e.to_string()))
}

pub fn encode_frame(message: &PeerMessage) -> crate::error::Result<String> {
    serde_json::to_string(message).map_err(crate::error::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_round_trips_through_json() {
        let msg = PeerMessage::Ping { ts: 12345 };
        let encoded = encode_frame(&msg).unwrap();
        let decoded = decode_frame(&encoded).unwrap();
        assert_eq!(decoded.kind(), "ping");
    }

    #[test]
    fn unknown_type_is_a_protocol_error() {
        let result = decode_frame(r#"{"type":"not_a_real_kind"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn file_chunk_is_classified_as_a_transfer_kind() {
        let msg = PeerMessage::FileChunk {
            transfer_id: "t1".into(),
            chunk_index: 0,
            chunk_size: 10,
            ciphertext_base64: "".into(),
            chunk_hash: "".into(),
        };
        assert!(msg.is_transfer_kind());
        assert!(!msg.is_verification_kind());
    }
}
