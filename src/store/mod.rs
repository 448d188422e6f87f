//! Persistent Store (§4.2): durable records for backups, peers, cached
//! sessions, and chunk states, with field-level encryption of sensitive
//! columns. Backed by SQLite; the single connection is guarded by one
//! mutex per §5's single-writer discipline (concurrent reads are
//! permitted by WAL mode).

pub mod field_crypto;
pub mod models;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use field_crypto::FieldCipher;
use models::{
    Backup, BackupDirection, BackupStatus, CachedPeerConnection, ChunkState, ChunkStateKind,
    StorageCommitment,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backups (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    direction TEXT NOT NULL,
    counterparty_peer_id_hash TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    status TEXT NOT NULL,
    file_count INTEGER NOT NULL,
    total_bytes INTEGER NOT NULL,
    metadata TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_backups_peer ON backups(counterparty_peer_id_hash);
CREATE INDEX IF NOT EXISTS idx_backups_status ON backups(status);

CREATE TABLE IF NOT EXISTS transfer_chunk_states (
    backup_id TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    chunk_hash TEXT NOT NULL,
    chunk_size INTEGER NOT NULL,
    state TEXT NOT NULL,
    attempt_count INTEGER NOT NULL,
    last_attempt INTEGER,
    error_message TEXT,
    PRIMARY KEY (backup_id, chunk_index)
);
CREATE INDEX IF NOT EXISTS idx_chunk_states_backup ON transfer_chunk_states(backup_id);

CREATE TABLE IF NOT EXISTS peers (
    peer_id_hash TEXT PRIMARY KEY,
    public_key BLOB,
    metadata BLOB,
    trust_level TEXT NOT NULL,
    last_seen INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_peers_trust ON peers(trust_level);

CREATE TABLE IF NOT EXISTS cached_peer_connections (
    peer_id_hash TEXT PRIMARY KEY,
    public_key BLOB NOT NULL,
    session_blob BLOB,
    metadata BLOB,
    last_seen INTEGER NOT NULL,
    trust_level TEXT NOT NULL,
    total_attempts INTEGER NOT NULL,
    successful_attempts INTEGER NOT NULL,
    last_success_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_cached_peer_last_seen ON cached_peer_connections(last_seen);

CREATE TABLE IF NOT EXISTS storage_commitments (
    peer_id_hash TEXT PRIMARY KEY,
    encryption_public_key BLOB NOT NULL,
    bytes_offered INTEGER NOT NULL,
    availability_terms TEXT NOT NULL,
    retention_period_ms INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    signing_public_key BLOB NOT NULL,
    signature BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_commitments_expires ON storage_commitments(expires_at);

CREATE TABLE IF NOT EXISTS verification_challenges (
    id TEXT PRIMARY KEY,
    backup_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    issued_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    challenge_data BLOB,
    response_data BLOB,
    completed INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_challenges_backup ON verification_challenges(backup_id);
CREATE INDEX IF NOT EXISTS idx_challenges_issued ON verification_challenges(issued_at);

CREATE TABLE IF NOT EXISTS transfer_sessions (
    id TEXT PRIMARY KEY,
    backup_id TEXT NOT NULL,
    peer_id_hash TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transfer_sessions_backup ON transfer_sessions(backup_id);

CREATE TABLE IF NOT EXISTS sync_schedules (
    peer_id_hash TEXT PRIMARY KEY,
    next_sync_time INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sync_schedules_next ON sync_schedules(next_sync_time);
"#;

pub struct StoreStats {
    pub total_backups: u64,
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub peers_by_trust: Vec<(String, u64)>,
}

pub struct Store {
    conn: Mutex<Connection>,
    field_cipher: FieldCipher,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn status_str(s: BackupStatus) -> &'static str {
    match s {
        BackupStatus::Active => "active",
        BackupStatus::Completed => "completed",
        BackupStatus::Failed => "failed",
        BackupStatus::Cancelled => "cancelled",
        BackupStatus::Paused => "paused",
    }
}

fn status_from_str(s: &str) -> BackupStatus {
    match s {
        "completed" => BackupStatus::Completed,
        "failed" => BackupStatus::Failed,
        "cancelled" => BackupStatus::Cancelled,
        "paused" => BackupStatus::Paused,
        _ => BackupStatus::Active,
    }
}

fn direction_str(d: BackupDirection) -> &'static str {
    match d {
        BackupDirection::Sent => "sent",
        BackupDirection::Received => "received",
    }
}

fn chunk_state_str(s: ChunkStateKind) -> &'static str {
    match s {
        ChunkStateKind::Pending => "pending",
        ChunkStateKind::Transferring => "transferring",
        ChunkStateKind::Completed => "completed",
        ChunkStateKind::Failed => "failed",
        ChunkStateKind::Verified => "verified",
    }
}

fn chunk_state_from_str(s: &str) -> ChunkStateKind {
    match s {
        "transferring" => ChunkStateKind::Transferring,
        "completed" => ChunkStateKind::Completed,
        "failed" => ChunkStateKind::Failed,
        "verified" => ChunkStateKind::Verified,
        _ => ChunkStateKind::Pending,
    }
}

impl Store {
    pub fn open(path: &Path, field_key_seed: &[u8]) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            field_cipher: FieldCipher::derive(field_key_seed, b"backup-peer-store-salt-v1"),
        })
    }

    pub fn open_in_memory(field_key_seed: &[u8]) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            field_cipher: FieldCipher::derive(field_key_seed, b"backup-peer-store-salt-v1"),
        })
    }

    pub fn insert_backup(&self, backup: &Backup) -> Result<()> {
        let metadata = serde_json::to_string(&backup.files)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO backups (id, name, direction, counterparty_peer_id_hash, created_at, status, file_count, total_bytes, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                backup.id,
                backup.name,
                direction_str(backup.direction),
                backup.counterparty_peer_id_hash,
                backup.created_at as i64,
                status_str(backup.status),
                backup.file_count,
                backup.total_bytes as i64,
                metadata,
            ],
        )?;
        Ok(())
    }

    pub fn update_backup_status(&self, backup_id: &str, status: BackupStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE backups SET status = ?1 WHERE id = ?2",
            params![status_str(status), backup_id],
        )?;
        Ok(())
    }

    pub fn get_backup(&self, backup_id: &str) -> Result<Option<Backup>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, name, direction, counterparty_peer_id_hash, created_at, status, file_count, total_bytes, metadata
                 FROM backups WHERE id = ?1",
                params![backup_id],
                |row| {
                    let files_json: String = row.get(8)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, u32>(6)?,
                        row.get::<_, i64>(7)?,
                        files_json,
                    ))
                },
            )
            .optional()?;

        Ok(match row {
            None => None,
            Some((id, name, direction, counterparty, created_at, status, file_count, total_bytes, files_json)) => {
                let files = serde_json::from_str(&files_json)?;
                Some(Backup {
                    id,
                    name,
                    direction: if direction == "sent" {
                        BackupDirection::Sent
                    } else {
                        BackupDirection::Received
                    },
                    counterparty_peer_id_hash: counterparty,
                    created_at: created_at as u64,
                    status: status_from_str(&status),
                    file_count,
                    total_bytes: total_bytes as u64,
                    files,
                })
            }
        })
    }

    pub fn list_backups_by_status(&self, status: BackupStatus, direction: BackupDirection) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM backups WHERE status = ?1 AND direction = ?2",
        )?;
        let ids = stmt
            .query_map(params![status_str(status), direction_str(direction)], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    pub fn upsert_chunk_state(&self, chunk: &ChunkState) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO transfer_chunk_states (backup_id, chunk_index, chunk_hash, chunk_size, state, attempt_count, last_attempt, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(backup_id, chunk_index) DO UPDATE SET
               chunk_hash = excluded.chunk_hash,
               chunk_size = excluded.chunk_size,
               state = excluded.state,
               attempt_count = excluded.attempt_count,
               last_attempt = excluded.last_attempt,
               error_message = excluded.error_message",
            params![
                chunk.backup_id,
                chunk.chunk_index,
                chunk.chunk_hash,
                chunk.chunk_size,
                chunk_state_str(chunk.state),
                chunk.attempt_count,
                chunk.last_attempt.map(|v| v as i64),
                chunk.error_message,
            ],
        )?;
        Ok(())
    }

    /// Every chunk whose state is not in {completed, verified}, ordered by
    /// index (§4.8 Resumption).
    pub fn incomplete_chunks(&self, backup_id: &str) -> Result<Vec<ChunkState>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT backup_id, chunk_index, chunk_hash, chunk_size, state, attempt_count, last_attempt, error_message
             FROM transfer_chunk_states
             WHERE backup_id = ?1 AND state NOT IN ('completed', 'verified')
             ORDER BY chunk_index ASC",
        )?;
        let rows = stmt
            .query_map(params![backup_id], |row| {
                Ok(ChunkState {
                    backup_id: row.get(0)?,
                    chunk_index: row.get(1)?,
                    chunk_hash: row.get(2)?,
                    chunk_size: row.get(3)?,
                    state: chunk_state_from_str(&row.get::<_, String>(4)?),
                    attempt_count: row.get(5)?,
                    last_attempt: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
                    error_message: row.get(7)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn upsert_cached_peer_connection(&self, cached: &CachedPeerConnection) -> Result<()> {
        let public_key = self.field_cipher.encrypt(&cached.public_key)?;
        let session_blob = self.field_cipher.encrypt(&cached.session_resumption_blob)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO cached_peer_connections (peer_id_hash, public_key, session_blob, metadata, last_seen, trust_level, total_attempts, successful_attempts, last_success_at)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(peer_id_hash) DO UPDATE SET
               public_key = excluded.public_key,
               session_blob = excluded.session_blob,
               last_seen = excluded.last_seen,
               trust_level = excluded.trust_level,
               total_attempts = excluded.total_attempts,
               successful_attempts = excluded.successful_attempts,
               last_success_at = excluded.last_success_at",
            params![
                cached.peer_id_hash,
                public_key,
                session_blob,
                cached.last_seen as i64,
                cached.trust_level,
                cached.total_attempts as i64,
                cached.successful_attempts as i64,
                cached.last_success_at.map(|v| v as i64),
            ],
        )?;
        Ok(())
    }

    pub fn get_cached_peer_connection(&self, peer_id_hash: &str) -> Result<Option<CachedPeerConnection>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT peer_id_hash, public_key, session_blob, last_seen, trust_level, total_attempts, successful_attempts, last_success_at
                 FROM cached_peer_connections WHERE peer_id_hash = ?1",
                params![peer_id_hash],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, Option<i64>>(7)?,
                    ))
                },
            )
            .optional()?;
        drop(conn);

        Ok(match row {
            None => None,
            Some((peer_id_hash, public_key_enc, session_blob_enc, last_seen, trust_level, total, success, last_success)) => {
                let public_key_bytes = self.field_cipher.decrypt(&public_key_enc)?;
                let public_key: [u8; 32] = public_key_bytes
                    .try_into()
                    .map_err(|_| crate::error::Error::StoreFieldDecrypt)?;
                let session_resumption_blob = self.field_cipher.decrypt(&session_blob_enc)?;
                Some(CachedPeerConnection {
                    peer_id_hash,
                    public_key,
                    session_resumption_blob,
                    last_seen: last_seen as u64,
                    trust_level,
                    total_attempts: total as u64,
                    successful_attempts: success as u64,
                    last_success_at: last_success.map(|v| v as u64),
                })
            }
        })
    }

    /// Chunk states at specific indices, in any state — used to build
    /// proof data for an incoming `random_blocks`/`file_hash` challenge
    /// (§4.9), as opposed to `incomplete_chunks` which is send-side only.
    pub fn chunk_states_by_indices(&self, backup_id: &str, indices: &[u32]) -> Result<Vec<ChunkState>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT backup_id, chunk_index, chunk_hash, chunk_size, state, attempt_count, last_attempt, error_message
             FROM transfer_chunk_states
             WHERE backup_id = ?1 AND chunk_index = ?2",
        )?;
        let mut out = Vec::with_capacity(indices.len());
        for index in indices {
            let row = stmt
                .query_row(params![backup_id, index], |row| {
                    Ok(ChunkState {
                        backup_id: row.get(0)?,
                        chunk_index: row.get(1)?,
                        chunk_hash: row.get(2)?,
                        chunk_size: row.get(3)?,
                        state: chunk_state_from_str(&row.get::<_, String>(4)?),
                        attempt_count: row.get(5)?,
                        last_attempt: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
                        error_message: row.get(7)?,
                    })
                })
                .optional()?;
            if let Some(chunk) = row {
                out.push(chunk);
            }
        }
        Ok(out)
    }

    /// Persist a peer's reputation snapshot (§4.5 auto-flush). `public_key`
    /// is `None` when the reputation engine has not yet learned it; an
    /// existing row's key is preserved rather than overwritten with NULL.
    pub fn upsert_peer_reputation(&self, peer_id_hash: &str, trust_level: &str, last_seen: u64, metadata_json: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO peers (peer_id_hash, public_key, metadata, trust_level, last_seen)
             VALUES (?1, NULL, ?2, ?3, ?4)
             ON CONFLICT(peer_id_hash) DO UPDATE SET
               metadata = excluded.metadata,
               trust_level = excluded.trust_level,
               last_seen = excluded.last_seen",
            params![peer_id_hash, metadata_json.as_bytes(), trust_level, last_seen as i64],
        )?;
        Ok(())
    }

    pub fn get_peer_reputation_metadata(&self, peer_id_hash: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let metadata: Option<Vec<u8>> = conn
            .query_row(
                "SELECT metadata FROM peers WHERE peer_id_hash = ?1",
                params![peer_id_hash],
                |r| r.get(0),
            )
            .optional()?
            .flatten();
        Ok(metadata.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Persist a peer's storage commitment (§3, §4.9 commitment exchange).
    /// `signature` is field-encrypted at rest like other sensitive columns.
    pub fn upsert_storage_commitment(&self, commitment: &StorageCommitment) -> Result<()> {
        let signature = self.field_cipher.encrypt(&commitment.signature)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO storage_commitments (peer_id_hash, encryption_public_key, bytes_offered, availability_terms, retention_period_ms, created_at, expires_at, signing_public_key, signature)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(peer_id_hash) DO UPDATE SET
               encryption_public_key = excluded.encryption_public_key,
               bytes_offered = excluded.bytes_offered,
               availability_terms = excluded.availability_terms,
               retention_period_ms = excluded.retention_period_ms,
               created_at = excluded.created_at,
               expires_at = excluded.expires_at,
               signing_public_key = excluded.signing_public_key,
               signature = excluded.signature",
            params![
                commitment.peer_id_hash,
                commitment.encryption_public_key.to_vec(),
                commitment.bytes_offered as i64,
                commitment.availability_terms,
                commitment.retention_period_ms as i64,
                commitment.created_at as i64,
                commitment.expires_at as i64,
                commitment.signing_public_key.to_vec(),
                signature,
            ],
        )?;
        Ok(())
    }

    pub fn get_storage_commitment(&self, peer_id_hash: &str) -> Result<Option<StorageCommitment>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT peer_id_hash, encryption_public_key, bytes_offered, availability_terms, retention_period_ms, created_at, expires_at, signing_public_key, signature
                 FROM storage_commitments WHERE peer_id_hash = ?1",
                params![peer_id_hash],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, Vec<u8>>(7)?,
                        row.get::<_, Vec<u8>>(8)?,
                    ))
                },
            )
            .optional()?;
        drop(conn);

        Ok(match row {
            None => None,
            Some((peer_id_hash, enc_pub, bytes_offered, terms, retention, created_at, expires_at, sign_pub, signature_enc)) => {
                let signature_bytes = self.field_cipher.decrypt(&signature_enc)?;
                Some(StorageCommitment {
                    peer_id_hash,
                    encryption_public_key: enc_pub.try_into().map_err(|_| Error::StoreFieldDecrypt)?,
                    bytes_offered: bytes_offered as u64,
                    availability_terms: terms,
                    retention_period_ms: retention as u64,
                    created_at: created_at as u64,
                    expires_at: expires_at as u64,
                    signing_public_key: sign_pub.try_into().map_err(|_| Error::StoreFieldDecrypt)?,
                    signature: signature_bytes.try_into().map_err(|_| Error::StoreFieldDecrypt)?,
                })
            }
        })
    }

    /// Journal a challenge we issued, for audit and the periodic purge
    /// (§4.2, §4.9). `challenge_data` is the serialized `sample_indices`/
    /// `nonce` we sent, for later reference.
    pub fn insert_verification_challenge(&self, id: &str, backup_id: &str, kind: &str, issued_at: u64, expires_at: u64, challenge_data: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO verification_challenges (id, backup_id, kind, issued_at, expires_at, challenge_data, response_data, completed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, 0)",
            params![id, backup_id, kind, issued_at as i64, expires_at as i64, challenge_data],
        )?;
        Ok(())
    }

    pub fn complete_verification_challenge(&self, id: &str, response_data: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE verification_challenges SET response_data = ?1, completed = 1 WHERE id = ?2",
            params![response_data, id],
        )?;
        Ok(())
    }

    pub fn insert_transfer_session(&self, id: &str, backup_id: &str, peer_id_hash: &str, status: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO transfer_sessions (id, backup_id, peer_id_hash, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status",
            params![id, backup_id, peer_id_hash, status, now_secs() as i64],
        )?;
        Ok(())
    }

    pub fn update_transfer_session_status(&self, id: &str, status: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE transfer_sessions SET status = ?1 WHERE id = ?2",
            params![status, id],
        )?;
        Ok(())
    }

    /// Whether `peer_id_hash` is due for another challenge round, per the
    /// per-peer schedule row (§4.9 Scheduling). A peer with no row yet is
    /// always due.
    pub fn is_due_for_sync(&self, peer_id_hash: &str, now: u64) -> Result<bool> {
        let conn = self.conn.lock();
        let next: Option<i64> = conn
            .query_row(
                "SELECT next_sync_time FROM sync_schedules WHERE peer_id_hash = ?1",
                params![peer_id_hash],
                |r| r.get(0),
            )
            .optional()?;
        Ok(next.map(|t| now as i64 >= t).unwrap_or(true))
    }

    pub fn upsert_sync_schedule(&self, peer_id_hash: &str, next_sync_time: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_schedules (peer_id_hash, next_sync_time)
             VALUES (?1, ?2)
             ON CONFLICT(peer_id_hash) DO UPDATE SET next_sync_time = excluded.next_sync_time",
            params![peer_id_hash, next_sync_time as i64],
        )?;
        Ok(())
    }

    /// Periodic maintenance purge (§4.2): old challenges, completed
    /// transfer sessions, stale cached peers, and settled chunk states.
    pub fn purge_expired(&self) -> Result<()> {
        let now = now_secs() as i64;
        let one_year = 365 * 24 * 3600;
        let thirty_days = 30 * 24 * 3600;
        let seven_days = 7 * 24 * 3600;

        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM verification_challenges WHERE issued_at < ?1",
            params![now - one_year],
        )?;
        conn.execute("DELETE FROM transfer_sessions WHERE status = 'completed'", [])?;
        conn.execute(
            "DELETE FROM cached_peer_connections WHERE last_seen < ?1",
            params![now - thirty_days],
        )?;
        conn.execute(
            "DELETE FROM transfer_chunk_states WHERE state IN ('completed', 'verified') AND last_attempt < ?1",
            params![now - seven_days],
        )?;
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock();
        let total_backups: i64 = conn.query_row("SELECT COUNT(*) FROM backups", [], |r| r.get(0))?;
        let sent_bytes: i64 = conn.query_row(
            "SELECT COALESCE(SUM(total_bytes), 0) FROM backups WHERE direction = 'sent'",
            [],
            |r| r.get(0),
        )?;
        let received_bytes: i64 = conn.query_row(
            "SELECT COALESCE(SUM(total_bytes), 0) FROM backups WHERE direction = 'received'",
            [],
            |r| r.get(0),
        )?;
        let mut stmt = conn.prepare("SELECT trust_level, COUNT(*) FROM peers GROUP BY trust_level")?;
        let peers_by_trust = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)))?
            .filter_map(|r| r.ok())
            .collect();

        Ok(StoreStats {
            total_backups: total_backups as u64,
            sent_bytes: sent_bytes as u64,
            received_bytes: received_bytes as u64,
            peers_by_trust,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::BackupDirection;

    fn store() -> Store {
        Store::open_in_memory(b"test-seed").unwrap()
    }

    #[test]
    fn insert_and_fetch_backup_round_trips() {
        let store = store();
        let backup = Backup::new(
            "b1".into(),
            "my backup".into(),
            BackupDirection::Sent,
            "0123456789abcdef".into(),
            1000,
        )
        .unwrap();
        store.insert_backup(&backup).unwrap();

        let fetched = store.get_backup("b1").unwrap().unwrap();
        assert_eq!(fetched.id, "b1");
        assert_eq!(fetched.status, BackupStatus::Active);
    }

    #[test]
    fn incomplete_chunks_excludes_completed_and_verified() {
        let store = store();
        for (i, state) in [
            ChunkStateKind::Completed,
            ChunkStateKind::Pending,
            ChunkStateKind::Failed,
            ChunkStateKind::Verified,
        ]
        .into_iter()
        .enumerate()
        {
            let mut chunk = ChunkState::new("b1".into(), i as u32, format!("hash{i}"), 64);
            chunk.state = state;
            store.upsert_chunk_state(&chunk).unwrap();
        }

        let incomplete = store.incomplete_chunks("b1").unwrap();
        let indices: Vec<u32> = incomplete.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![1, 2]);
    }

    #[test]
    fn cached_peer_connection_fields_are_encrypted_at_rest() {
        let store = store();
        let cached = CachedPeerConnection {
            peer_id_hash: "0123456789abcdef".into(),
            public_key: [5u8; 32],
            session_resumption_blob: b"opaque blob".to_vec(),
            last_seen: 100,
            trust_level: "trusted".into(),
            total_attempts: 3,
            successful_attempts: 2,
            last_success_at: Some(99),
        };
        store.upsert_cached_peer_connection(&cached).unwrap();

        let raw: Vec<u8> = store
            .conn
            .lock()
            .query_row(
                "SELECT public_key FROM cached_peer_connections WHERE peer_id_hash = ?1",
                params!["0123456789abcdef"],
                |r| r.get(0),
            )
            .unwrap();
        assert_ne!(raw, cached.public_key.to_vec());

        let fetched = store
            .get_cached_peer_connection("0123456789abcdef")
            .unwrap()
            .unwrap();
        assert_eq!(fetched.public_key, cached.public_key);
    }
}
