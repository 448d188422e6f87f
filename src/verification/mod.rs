//! Verification Protocol (§4.9): storage commitments exchanged on
//! connect, periodic challenge/proof rounds, and the rolling accounting
//! that feeds the reputation engine. Grounded on the teacher's
//! proof-of-relay challenge/response scaffolding, re-targeted at storage
//! custodianship instead of mesh relay credit.

use rand::seq::SliceRandom;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::crypto::Crypto;
use crate::error::{Error, Result};
use crate::message::{ChallengeKind, PeerMessage, ProofResult};
use crate::reputation::{ReputationEngine, ReputationEvent};
use crate::store::models::StorageCommitment;
use crate::store::Store;

const CHALLENGE_EXPIRY: Duration = Duration::from_secs(5 * 60);
const ROLLING_HISTORY_CAP: usize = 100;
const RANDOM_BLOCKS_SAMPLE: usize = 1000;
const RANDOM_BLOCKS_PICKS: usize = 10;
const FILE_HASH_PICKS: usize = 3;
const MIN_CHALLENGE_SPACING: Duration = Duration::from_secs(1);

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone)]
pub struct ChallengeOutcome {
    pub success: bool,
    pub response_time_ms: u64,
}

/// A challenge we issued and are waiting on, or one a peer issued to us
/// that we must answer.
#[derive(Debug, Clone)]
struct PendingChallenge {
    backup_id: String,
    kind: ChallengeKind,
    sample_indices: Vec<u32>,
    nonce: Option<[u8; 32]>,
    issued_at: u64,
    expires_at: u64,
}

/// Build a fresh storage commitment for `bytes_offered` (§3, §4.9
/// commitment exchange). The caller persists and sends it.
pub fn build_commitment(
    crypto: &Crypto,
    bytes_offered: u64,
    availability_terms: String,
    retention_period_ms: u64,
) -> StorageCommitment {
    let created_at = now_secs();
    let expires_at = created_at + retention_period_ms / 1000;
    let mut payload = Vec::new();
    payload.extend_from_slice(crypto.peer_id_hash().as_bytes());
    payload.extend_from_slice(&bytes_offered.to_be_bytes());
    payload.extend_from_slice(availability_terms.as_bytes());
    let signature = crypto.sign_bytes(&payload);
    StorageCommitment {
        peer_id_hash: crypto.peer_id_hash().to_string(),
        encryption_public_key: crypto.public_encryption_key().to_bytes(),
        bytes_offered,
        availability_terms,
        retention_period_ms,
        created_at,
        expires_at,
        signing_public_key: crypto.public_signing_key(),
        signature,
    }
}

/// Encode a `StorageCommitment` as the wire `storage_commitment` message
/// (hex fixed-width fields) (§3, §6).
pub fn commitment_to_message(commitment: &StorageCommitment) -> PeerMessage {
    PeerMessage::StorageCommitment {
        bytes_offered: commitment.bytes_offered,
        availability_terms: commitment.availability_terms.clone(),
        retention_period_ms: commitment.retention_period_ms,
        created_at: commitment.created_at,
        expires_at: commitment.expires_at,
        encryption_public_key: hex::encode(commitment.encryption_public_key),
        signing_public_key: hex::encode(commitment.signing_public_key),
        signature: hex::encode(commitment.signature),
    }
}

/// Decode a wire `storage_commitment` message back into a `StorageCommitment`
/// for a known `peer_id_hash`. Malformed hex or the wrong byte length is a
/// protocol error (§6, §9).
pub fn commitment_from_message(peer_id_hash: &str, message: &PeerMessage) -> Result<StorageCommitment> {
    let PeerMessage::StorageCommitment {
        bytes_offered,
        availability_terms,
        retention_period_ms,
        created_at,
        expires_at,
        encryption_public_key,
        signing_public_key,
        signature,
    } = message
    else {
        return Err(Error::Malformed("expected a storage_commitment message".into()));
    };

    let decode_fixed = |hex_str: &str, field: &'static str| -> Result<Vec<u8>> {
        hex::decode(hex_str).map_err(|_| Error::Malformed(format!("{field} is not valid hex")))
    };
    let encryption_public_key: [u8; 32] = decode_fixed(encryption_public_key, "encryption_public_key")?
        .try_into()
        .map_err(|_| Error::Malformed("encryption_public_key has the wrong length".into()))?;
    let signing_public_key: [u8; 32] = decode_fixed(signing_public_key, "signing_public_key")?
        .try_into()
        .map_err(|_| Error::Malformed("signing_public_key has the wrong length".into()))?;
    let signature: [u8; 64] = decode_fixed(signature, "signature")?
        .try_into()
        .map_err(|_| Error::Malformed("signature has the wrong length".into()))?;

    Ok(StorageCommitment {
        peer_id_hash: peer_id_hash.to_string(),
        encryption_public_key,
        bytes_offered: *bytes_offered,
        availability_terms: availability_terms.clone(),
        retention_period_ms: *retention_period_ms,
        created_at: *created_at,
        expires_at: *expires_at,
        signing_public_key,
        signature,
    })
}

/// Verify a peer's commitment signature and structural bounds (§3).
pub fn verify_commitment(commitment: &StorageCommitment) -> Result<()> {
    commitment.validate_bounds(now_secs())?;
    let mut payload = Vec::new();
    payload.extend_from_slice(commitment.peer_id_hash.as_bytes());
    payload.extend_from_slice(&commitment.bytes_offered.to_be_bytes());
    payload.extend_from_slice(commitment.availability_terms.as_bytes());

    use ed25519_dalek::{Signature, Verifier, VerifyingKey};
    let verifying_key = VerifyingKey::from_bytes(&commitment.signing_public_key)
        .map_err(|_| Error::IdentityKeyLength)?;
    let signature = Signature::from_bytes(&commitment.signature);
    verifying_key
        .verify(&payload, &signature)
        .map_err(|_| Error::SignatureInvalid)
}

/// Canonical metadata-proof hash: `SHA-256(canonical(backup_id ||
/// timestamp || file_count || nonce))` (§4.9).
pub fn metadata_proof_hash(backup_id: &str, timestamp: u64, file_count: u32, nonce: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(backup_id.as_bytes());
    hasher.update(timestamp.to_be_bytes());
    hasher.update(file_count.to_be_bytes());
    hasher.update(nonce);
    hasher.finalize().into()
}

/// Build the proof payload for `backup_id`/`kind` from this peer's own
/// locally known records (§4.9). Both the challenger (comparing against
/// its own copy of the backup it sent) and the custodian (answering from
/// the copy it received) call this with the same inputs, so a faithful
/// custodian's response always structurally matches the challenger's
/// expectation.
pub fn build_proof_data(
    store: &Store,
    backup_id: &str,
    kind: ChallengeKind,
    sample_indices: &[u32],
    nonce: Option<&[u8; 32]>,
    issued_at: u64,
) -> Result<serde_json::Value> {
    match kind {
        ChallengeKind::RandomBlocks => {
            let chunks = store.chunk_states_by_indices(backup_id, sample_indices)?;
            let chunk_hashes: std::collections::BTreeMap<String, String> = chunks
                .into_iter()
                .map(|c| (c.chunk_index.to_string(), c.chunk_hash))
                .collect();
            Ok(serde_json::json!({ "chunk_hashes": chunk_hashes }))
        }
        ChallengeKind::FileHash => {
            let backup = store.get_backup(backup_id)?.ok_or(Error::UnknownChallenge)?;
            let file_hashes: std::collections::BTreeMap<String, String> = sample_indices
                .iter()
                .filter_map(|&idx| backup.files.get(idx as usize).map(|f| (idx.to_string(), f.sha256.clone())))
                .collect();
            Ok(serde_json::json!({ "file_hashes": file_hashes }))
        }
        ChallengeKind::MetadataProof => {
            let backup = store.get_backup(backup_id)?.ok_or(Error::UnknownChallenge)?;
            let nonce = nonce.ok_or_else(|| Error::Malformed("metadata-proof challenge is missing its nonce".into()))?;
            let hash = metadata_proof_hash(backup_id, issued_at, backup.file_count, nonce);
            Ok(serde_json::json!({ "hash": hex::encode(hash) }))
        }
    }
}

pub struct VerificationEngine {
    /// Challenges we issued, awaiting a response.
    outstanding: parking_lot::Mutex<HashMap<String, PendingChallenge>>,
    /// Rolling accounting per peer, newest-last, capped at 100 (§4.9).
    history: parking_lot::Mutex<HashMap<String, VecDeque<ChallengeOutcome>>>,
}

impl VerificationEngine {
    pub fn new() -> Self {
        Self {
            outstanding: parking_lot::Mutex::new(HashMap::new()),
            history: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Construct a `random-blocks` challenge against a backup with
    /// `file_count` files/chunks, sampling up to 1000 candidate indices
    /// and picking 10 (§4.9).
    pub fn issue_random_blocks(&self, backup_id: &str) -> PeerMessage {
        let sample_space = RANDOM_BLOCKS_SAMPLE.min(u32::MAX as usize) as u32;
        let mut rng = rand::thread_rng();
        let mut indices: Vec<u32> = (0..sample_space).collect();
        indices.shuffle(&mut rng);
        indices.truncate(RANDOM_BLOCKS_PICKS);

        let id = uuid::Uuid::new_v4().to_string();
        let issued_at = now_secs();
        let expires_at = issued_at + CHALLENGE_EXPIRY.as_secs();
        self.outstanding.lock().insert(
            id.clone(),
            PendingChallenge {
                backup_id: backup_id.to_string(),
                kind: ChallengeKind::RandomBlocks,
                sample_indices: indices.clone(),
                nonce: None,
                issued_at,
                expires_at,
            },
        );
        PeerMessage::StorageChallenge {
            id,
            backup_id: backup_id.to_string(),
            kind: ChallengeKind::RandomBlocks,
            sample_indices: indices,
            nonce: None,
            issued_at,
            expires_at,
        }
    }

    /// Construct a `file-hash` challenge, sampling file indices bounded by
    /// the backup's own `file_count` so the custodian can actually answer
    /// (§4.9). Returns `None` if the backup is unknown or has no files.
    pub fn issue_file_hash(&self, store: &Store, backup_id: &str) -> Option<PeerMessage> {
        let backup = store.get_backup(backup_id).ok()??;
        if backup.file_count == 0 {
            return None;
        }
        let mut rng = rand::thread_rng();
        let picks: Vec<u32> = (0..FILE_HASH_PICKS as u32)
            .map(|_| rng.gen_range(0..backup.file_count))
            .collect();
        let id = uuid::Uuid::new_v4().to_string();
        let issued_at = now_secs();
        let expires_at = issued_at + CHALLENGE_EXPIRY.as_secs();
        self.outstanding.lock().insert(
            id.clone(),
            PendingChallenge {
                backup_id: backup_id.to_string(),
                kind: ChallengeKind::FileHash,
                sample_indices: picks.clone(),
                nonce: None,
                issued_at,
                expires_at,
            },
        );
        Some(PeerMessage::StorageChallenge {
            id,
            backup_id: backup_id.to_string(),
            kind: ChallengeKind::FileHash,
            sample_indices: picks,
            nonce: None,
            issued_at,
            expires_at,
        })
    }

    pub fn issue_metadata_proof(&self, backup_id: &str) -> PeerMessage {
        let mut nonce = [0u8; 32];
        rand::thread_rng().fill(&mut nonce);
        let id = uuid::Uuid::new_v4().to_string();
        let issued_at = now_secs();
        let expires_at = issued_at + CHALLENGE_EXPIRY.as_secs();
        self.outstanding.lock().insert(
            id.clone(),
            PendingChallenge {
                backup_id: backup_id.to_string(),
                kind: ChallengeKind::MetadataProof,
                sample_indices: Vec::new(),
                nonce: Some(nonce),
                issued_at,
                expires_at,
            },
        );
        PeerMessage::StorageChallenge {
            id,
            backup_id: backup_id.to_string(),
            kind: ChallengeKind::MetadataProof,
            sample_indices: Vec::new(),
            nonce: Some(hex::encode(nonce)),
            issued_at,
            expires_at,
        }
    }

    /// Verify a `storage_proof` against the pending challenge we issued,
    /// building the expected payload from our own store record for the
    /// same backup via `build_proof_data` (§4.9) rather than trusting a
    /// caller-supplied value.
    pub fn verify_proof(
        &self,
        store: &Store,
        challenge_id: &str,
        result: &ProofResult,
        reputation: &ReputationEngine,
        peer_id_hash: &str,
    ) -> Result<()> {
        let pending = self
            .outstanding
            .lock()
            .remove(challenge_id)
            .ok_or(Error::UnknownChallenge)?;

        let now = now_secs();
        let response_time_ms = now.saturating_sub(pending.issued_at) * 1000;

        if now > pending.expires_at {
            self.record_outcome(reputation, peer_id_hash, false, response_time_ms);
            return Err(Error::ChallengeExpired);
        }

        let expected = build_proof_data(
            store,
            &pending.backup_id,
            pending.kind,
            &pending.sample_indices,
            pending.nonce.as_ref(),
            pending.issued_at,
        )?;

        let success = match result {
            ProofResult::Error { .. } => false,
            ProofResult::Ok { data } => *data == expected,
        };

        self.record_outcome(reputation, peer_id_hash, success, response_time_ms);
        if success {
            Ok(())
        } else {
            Err(Error::ProofMismatch)
        }
    }

    /// A challenge we issued that was never answered before expiry: an
    /// accounted failure, distinct from an explicit error reply.
    pub fn expire_stale(&self, reputation: &ReputationEngine, peer_id_hash: &str) {
        let now = now_secs();
        let mut outstanding = self.outstanding.lock();
        let expired: Vec<String> = outstanding
            .iter()
            .filter(|(_, c)| now > c.expires_at)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            outstanding.remove(&id);
            drop(outstanding);
            self.record_outcome(reputation, peer_id_hash, false, CHALLENGE_EXPIRY.as_millis() as u64);
            outstanding = self.outstanding.lock();
        }
    }

    fn record_outcome(&self, reputation: &ReputationEngine, peer_id_hash: &str, success: bool, response_time_ms: u64) {
        let mut history = self.history.lock();
        let entry = history.entry(peer_id_hash.to_string()).or_default();
        if entry.len() == ROLLING_HISTORY_CAP {
            entry.pop_front();
        }
        entry.push_back(ChallengeOutcome { success, response_time_ms });
        drop(history);

        reputation.record(
            peer_id_hash,
            ReputationEvent::Verification { success, response_time_ms },
        );
    }

    pub fn history_for(&self, peer_id_hash: &str) -> Vec<ChallengeOutcome> {
        self.history
            .lock()
            .get(peer_id_hash)
            .cloned()
            .map(Vec::from)
            .unwrap_or_default()
    }
}

impl Default for VerificationEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Background scheduling cadence helper (§4.9): spacing successive
/// challenge issuances by at least 1 s within one sweep of sent backups.
pub fn challenge_spacing() -> Duration {
    MIN_CHALLENGE_SPACING
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_blocks_challenge_samples_ten_distinct_indices() {
        let engine = VerificationEngine::new();
        let message = engine.issue_random_blocks("backup1");
        match message {
            PeerMessage::StorageChallenge { kind, .. } => {
                assert!(matches!(kind, ChallengeKind::RandomBlocks));
            }
            _ => panic!("expected a StorageChallenge"),
        }
        let pending = engine.outstanding.lock();
        let (_, challenge) = pending.iter().next().unwrap();
        assert_eq!(challenge.sample_indices.len(), RANDOM_BLOCKS_PICKS);
        let unique: std::collections::HashSet<_> = challenge.sample_indices.iter().collect();
        assert_eq!(unique.len(), RANDOM_BLOCKS_PICKS);
    }

    #[test]
    fn unknown_challenge_id_is_rejected() {
        let engine = VerificationEngine::new();
        let store = Store::open_in_memory(b"test-seed").unwrap();
        let reputation = ReputationEngine::new(crate::config::ReputationConfig::default());
        let result = engine.verify_proof(
            &store,
            "does-not-exist",
            &ProofResult::Ok { data: serde_json::json!({}) },
            &reputation,
            "peer1",
        );
        assert!(matches!(result, Err(Error::UnknownChallenge)));
    }

    #[test]
    fn matching_proof_succeeds_and_feeds_reputation() {
        use crate::store::models::{Backup, BackupDirection};

        let engine = VerificationEngine::new();
        let store = Store::open_in_memory(b"test-seed").unwrap();
        let backup = Backup::new("backup1".into(), "b".into(), BackupDirection::Sent, "0123456789abcdef".into(), 0).unwrap();
        store.insert_backup(&backup).unwrap();
        let reputation = ReputationEngine::new(crate::config::ReputationConfig::default());
        let message = engine.issue_metadata_proof("backup1");
        let (id, issued_at, nonce_hex) = match message {
            PeerMessage::StorageChallenge { id, issued_at, nonce, .. } => (id, issued_at, nonce.unwrap()),
            _ => panic!(),
        };
        let nonce_bytes: Vec<u8> = hex::decode(&nonce_hex).unwrap();
        let nonce: [u8; 32] = nonce_bytes.try_into().unwrap();
        let hash = metadata_proof_hash("backup1", issued_at, 0, &nonce);
        let expected = serde_json::json!({ "hash": hex::encode(hash) });
        let result = engine.verify_proof(
            &store,
            &id,
            &ProofResult::Ok { data: expected },
            &reputation,
            "peer1",
        );
        assert!(result.is_ok());
        assert_eq!(reputation.get("peer1").unwrap().successful_challenges, 1);
    }

    #[test]
    fn metadata_proof_hash_is_deterministic() {
        let nonce = [7u8; 32];
        let a = metadata_proof_hash("backup1", 1000, 5, &nonce);
        let b = metadata_proof_hash("backup1", 1000, 5, &nonce);
        assert_eq!(a, b);
        let c = metadata_proof_hash("backup1", 1001, 5, &nonce);
        assert_ne!(a, c);
    }
}
