//! Record types for the persistent store (§3, §4.2). Constructors
//! validate their invariants and return a typed error rather than
//! panicking, following the teacher's validating-model-constructor idiom.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupDirection {
    Sent,
    Received,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Pending,
    Transferring,
    Completed,
    Failed,
    Verified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkStateKind {
    Pending,
    Transferring,
    Completed,
    Failed,
    Verified,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub relative_path: String,
    pub size: u64,
    pub sha256: String,
    pub chunk_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub name: String,
    pub direction: BackupDirection,
    pub counterparty_peer_id_hash: String,
    pub created_at: u64,
    pub status: BackupStatus,
    pub file_count: u32,
    pub total_bytes: u64,
    pub files: Vec<FileEntry>,
}

impl Backup {
    pub fn new(
        id: String,
        name: String,
        direction: BackupDirection,
        counterparty_peer_id_hash: String,
        created_at: u64,
    ) -> Result<Self> {
        if id.is_empty() {
            return Err(Error::StoreSchema("backup id must not be empty".into()));
        }
        if counterparty_peer_id_hash.len() != 16 {
            return Err(Error::StoreSchema(
                "counterparty peer-id-hash must be 16 hex characters".into(),
            ));
        }
        Ok(Self {
            id,
            name,
            direction,
            counterparty_peer_id_hash,
            created_at,
            status: BackupStatus::Active,
            file_count: 0,
            total_bytes: 0,
            files: Vec::new(),
        })
    }

    /// A completed backup is immutable (§3): further chunk-state mutation
    /// on it is a caller bug, guarded here defensively.
    pub fn is_immutable(&self) -> bool {
        self.status == BackupStatus::Completed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupFile {
    pub backup_id: String,
    pub relative_path: String,
    pub size: u64,
    pub sha256: String,
    pub chunk_count: u32,
    pub transfer_status: TransferStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkState {
    pub backup_id: String,
    pub chunk_index: u32,
    pub chunk_hash: String,
    pub chunk_size: u32,
    pub state: ChunkStateKind,
    pub attempt_count: u32,
    pub last_attempt: Option<u64>,
    pub error_message: Option<String>,
}

impl ChunkState {
    pub fn new(backup_id: String, chunk_index: u32, chunk_hash: String, chunk_size: u32) -> Self {
        Self {
            backup_id,
            chunk_index,
            chunk_hash,
            chunk_size,
            state: ChunkStateKind::Pending,
            attempt_count: 0,
            last_attempt: None,
            error_message: None,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            self.state,
            ChunkStateKind::Completed | ChunkStateKind::Verified
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageCommitment {
    pub peer_id_hash: String,
    pub encryption_public_key: [u8; 32],
    pub bytes_offered: u64,
    pub availability_terms: String,
    pub retention_period_ms: u64,
    pub created_at: u64,
    pub expires_at: u64,
    pub signing_public_key: [u8; 32],
    pub signature: [u8; 64],
}

pub const MIN_BYTES_OFFERED: u64 = 1024 * 1024; // 1 MiB
pub const MAX_BYTES_OFFERED: u64 = 1024 * 1024 * 1024 * 1024; // 1 TiB

impl StorageCommitment {
    /// Validate the structural bounds from §3; signature verification is
    /// performed separately by the verification component with access to
    /// the peer's declared signing key.
    pub fn validate_bounds(&self, now: u64) -> Result<()> {
        if self.bytes_offered < MIN_BYTES_OFFERED || self.bytes_offered > MAX_BYTES_OFFERED {
            return Err(Error::AllocationCapacityExhausted);
        }
        if self.expires_at <= now {
            return Err(Error::ChallengeExpired);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedPeerConnection {
    pub peer_id_hash: String,
    pub public_key: [u8; 32],
    pub session_resumption_blob: Vec<u8>,
    pub last_seen: u64,
    pub trust_level: String,
    pub total_attempts: u64,
    pub successful_attempts: u64,
    pub last_success_at: Option<u64>,
}

impl CachedPeerConnection {
    pub fn record_attempt(&mut self, success: bool, at: u64) {
        self.total_attempts += 1;
        if success {
            self.successful_attempts += 1;
            self.last_success_at = Some(at);
        }
        self.last_seen = at;
        debug_assert!(self.successful_attempts <= self.total_attempts);
    }
}
