//! Transfer Pipeline (§4.8): chunked, resumable file transfer over a
//! single peer channel. Send path reads plaintext, hashes, persists
//! chunk state, encrypts, and streams; receive path decrypts, verifies,
//! and reassembles into a quarantined staging area before an atomic
//! move into the received tree.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use base64::Engine as _;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::crypto::Crypto;
use crate::error::{Error, Result};
use crate::message::{ChunkAckResult, FileCompleteResult, PeerMessage};
use crate::store::models::{ChunkState, ChunkStateKind};
use crate::store::Store;

/// Per-chunk retry cap (§4.8, §9 — "3 attempts per chunk, no mandated
/// inter-attempt delay").
pub const MAX_CHUNK_ATTEMPTS: u32 = 3;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute size, SHA-256, and chunk count for a file about to be sent.
pub async fn file_send_metadata(path: &Path, chunk_size: usize) -> Result<(u64, String, u32)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 16];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    let total_chunks = if size == 0 { 0 } else { size.div_ceil(chunk_size as u64) as u32 };
    Ok((size, hex::encode(hasher.finalize()), total_chunks))
}

/// Tracks an in-flight outbound file transfer.
pub struct OutboundFileTransfer {
    pub transfer_id: String,
    pub backup_id: String,
    pub source_path: PathBuf,
    pub peer_id_hash: String,
    pub peer_public_key: [u8; 32],
    pub chunk_size: usize,
    pub total_chunks: u32,
}

/// Tracks an in-flight inbound file transfer's receive buffer.
struct InboundFileTransfer {
    file_name: String,
    total_chunks: u32,
    file_hash: String,
    chunks: HashMap<u32, Vec<u8>>,
    sender_peer_id_hash: String,
    sender_public_key: [u8; 32],
}

pub struct TransferPipeline {
    store: std::sync::Arc<Store>,
    received_chunks_dir: PathBuf,
    received_dir: PathBuf,
    inbound: parking_lot::Mutex<HashMap<String, InboundFileTransfer>>,
    /// Maps an outbound `transfer_id` to the `backup_id` it belongs to, so
    /// an inbound `chunk_ack` (keyed only by `transfer_id` on the wire) can
    /// be applied to the right backup's chunk-state rows (§4.8 step 6).
    outbound: parking_lot::Mutex<HashMap<String, String>>,
}

impl TransferPipeline {
    pub fn new(store: std::sync::Arc<Store>, received_dir: PathBuf, received_chunks_dir: PathBuf) -> Self {
        Self {
            store,
            received_chunks_dir,
            received_dir,
            inbound: parking_lot::Mutex::new(HashMap::new()),
            outbound: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Build the `file_start` message and persist the initial
    /// `transferring` chunk states for a fresh or resumed send.
    pub async fn begin_send(&self, transfer: &OutboundFileTransfer, file_name: &str, resume_from_chunk: u32) -> Result<PeerMessage> {
        let (file_size, file_hash, total_chunks) = file_send_metadata(&transfer.source_path, transfer.chunk_size).await?;
        self.outbound
            .lock()
            .insert(transfer.transfer_id.clone(), transfer.backup_id.clone());
        self.store.insert_transfer_session(
            &transfer.transfer_id,
            &transfer.backup_id,
            &transfer.peer_id_hash,
            "active",
        )?;
        Ok(PeerMessage::FileStart {
            transfer_id: transfer.transfer_id.clone(),
            file_name: file_name.to_string(),
            file_size,
            total_chunks,
            chunk_size: transfer.chunk_size as u32,
            file_hash,
            resume_from_chunk,
        })
    }

    /// Read, hash, persist, encrypt, and return the `file_chunk` message
    /// for one chunk index (§4.8 send path steps 1-5). The caller sends
    /// the returned message and awaits the `chunk_ack`.
    pub async fn prepare_chunk(
        &self,
        crypto: &Crypto,
        transfer: &OutboundFileTransfer,
        chunk_index: u32,
    ) -> Result<PeerMessage> {
        let offset = chunk_index as u64 * transfer.chunk_size as u64;
        let mut file = tokio::fs::File::open(&transfer.source_path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; transfer.chunk_size];
        let n = file.read(&mut buf).await?;
        buf.truncate(n);
        let chunk_hash = sha256_hex(&buf);

        let mut existing = self
            .store
            .incomplete_chunks(&transfer.backup_id)?
            .into_iter()
            .find(|c| c.chunk_index == chunk_index)
            .unwrap_or_else(|| ChunkState::new(transfer.backup_id.clone(), chunk_index, chunk_hash.clone(), n as u32));

        if existing.attempt_count >= MAX_CHUNK_ATTEMPTS {
            return Err(Error::RetryExhausted);
        }
        existing.chunk_hash = chunk_hash.clone();
        existing.chunk_size = n as u32;
        existing.state = ChunkStateKind::Transferring;
        existing.attempt_count += 1;
        existing.last_attempt = Some(now_secs());
        self.store.upsert_chunk_state(&existing)?;

        let ciphertext = crypto.encrypt_for_peer(&transfer.peer_id_hash, &transfer.peer_public_key, &buf)?;

        Ok(PeerMessage::FileChunk {
            transfer_id: transfer.transfer_id.clone(),
            chunk_index,
            chunk_size: n as u32,
            ciphertext_base64: base64::engine::general_purpose::STANDARD.encode(&ciphertext),
            chunk_hash,
        })
    }

    /// Apply a `chunk_ack` to the persisted chunk state (§4.8 step 6).
    /// `transfer_id` is resolved to its owning `backup_id` via the map
    /// populated in `begin_send`; an ack for an unknown transfer is a
    /// no-op rather than an error (the send loop may have already finished
    /// or this process may have restarted since the transfer began).
    pub fn apply_chunk_ack(&self, transfer_id: &str, chunk_index: u32, result: &ChunkAckResult) -> Result<()> {
        let Some(backup_id) = self.outbound.lock().get(transfer_id).cloned() else {
            return Ok(());
        };
        let mut states = self.store.incomplete_chunks(&backup_id)?;
        let Some(mut chunk) = states.iter_mut().find(|c| c.chunk_index == chunk_index).cloned() else {
            return Ok(());
        };
        chunk.state = match result {
            ChunkAckResult::Received => ChunkStateKind::Completed,
            ChunkAckResult::Error { reason } => {
                chunk.error_message = Some(reason.clone());
                ChunkStateKind::Failed
            }
        };
        self.store.upsert_chunk_state(&chunk)
    }

    /// Re-verify, before a resend, that the stored chunk hash still
    /// matches the live file content at `chunk_index` (§4.8 Resumption —
    /// a mismatch means the source file changed underneath us).
    pub async fn verify_chunk_unchanged(&self, source_path: &Path, chunk_size: usize, chunk: &ChunkState) -> Result<()> {
        let offset = chunk.chunk_index as u64 * chunk_size as u64;
        let mut file = tokio::fs::File::open(source_path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; chunk.chunk_size as usize];
        file.read_exact(&mut buf).await.map_err(|_| Error::SourceChanged)?;
        if sha256_hex(&buf) != chunk.chunk_hash {
            return Err(Error::SourceChanged);
        }
        Ok(())
    }

    // --- Receive path (§4.8) ---

    /// On `file_start`: allocate a receive buffer and return the ack.
    pub fn on_file_start(
        &self,
        transfer_id: &str,
        file_name: &str,
        total_chunks: u32,
        file_hash: &str,
        sender_peer_id_hash: &str,
        sender_public_key: [u8; 32],
    ) -> PeerMessage {
        self.inbound.lock().insert(
            transfer_id.to_string(),
            InboundFileTransfer {
                file_name: file_name.to_string(),
                total_chunks,
                file_hash: file_hash.to_string(),
                chunks: HashMap::new(),
                sender_peer_id_hash: sender_peer_id_hash.to_string(),
                sender_public_key,
            },
        );
        if let Err(e) = self.store.insert_transfer_session(transfer_id, transfer_id, sender_peer_id_hash, "active") {
            tracing::warn!(transfer_id, error = %e, "failed to journal inbound transfer session");
        }
        PeerMessage::FileStartAck {
            transfer_id: transfer_id.to_string(),
            ready: true,
        }
    }

    /// On `file_chunk`: decrypt, verify hash, store by index (§4.8). The
    /// receiver NEVER acks a chunk whose hash or decryption fails.
    pub fn on_file_chunk(
        &self,
        crypto: &Crypto,
        transfer_id: &str,
        chunk_index: u32,
        ciphertext_base64: &str,
        chunk_hash: &str,
    ) -> PeerMessage {
        let ack_error = |reason: &str| PeerMessage::ChunkAck {
            transfer_id: transfer_id.to_string(),
            chunk_index,
            result: ChunkAckResult::Error { reason: reason.to_string() },
        };

        let mut inbound = self.inbound.lock();
        let Some(transfer) = inbound.get_mut(transfer_id) else {
            return ack_error("unknown transfer");
        };

        let Ok(ciphertext) = base64::engine::general_purpose::STANDARD.decode(ciphertext_base64) else {
            return ack_error("bad base64");
        };

        let plaintext = match crypto.decrypt_from_peer(&transfer.sender_peer_id_hash, &transfer.sender_public_key, &ciphertext) {
            Ok(p) => p,
            Err(_) => return ack_error("decryption failed"),
        };

        if sha256_hex(&plaintext) != chunk_hash {
            return ack_error("chunk hash mismatch");
        }

        transfer.chunks.insert(chunk_index, plaintext);
        PeerMessage::ChunkAck {
            transfer_id: transfer_id.to_string(),
            chunk_index,
            result: ChunkAckResult::Received,
        }
    }

    /// On `file_complete`: require all chunks present, reassemble in
    /// order into a quarantined directory, verify the file-level hash,
    /// then atomically move into the received tree (§4.8).
    pub async fn on_file_complete(&self, transfer_id: &str) -> Result<PeerMessage> {
        let transfer = {
            let mut inbound = self.inbound.lock();
            inbound.remove(transfer_id)
        };
        let Some(transfer) = transfer else {
            return Ok(PeerMessage::FileCompleteAck {
                transfer_id: transfer_id.to_string(),
                result: FileCompleteResult::Error { reason: "unknown transfer".to_string() },
            });
        };

        if transfer.chunks.len() as u32 != transfer.total_chunks {
            return Ok(PeerMessage::FileCompleteAck {
                transfer_id: transfer_id.to_string(),
                result: FileCompleteResult::Error { reason: "missing chunks".to_string() },
            });
        }

        tokio::fs::create_dir_all(&self.received_chunks_dir).await?;
        let quarantine_path = self.received_chunks_dir.join(format!("{transfer_id}.part"));
        let mut assembled = Vec::new();
        {
            let mut file = tokio::fs::File::create(&quarantine_path).await?;
            for index in 0..transfer.total_chunks {
                let Some(chunk) = transfer.chunks.get(&index) else {
                    return Ok(PeerMessage::FileCompleteAck {
                        transfer_id: transfer_id.to_string(),
                        result: FileCompleteResult::Error { reason: "missing chunk index".to_string() },
                    });
                };
                file.write_all(chunk).await?;
                assembled.extend_from_slice(chunk);
            }
            file.flush().await?;
        }

        if sha256_hex(&assembled) != transfer.file_hash {
            let _ = tokio::fs::remove_file(&quarantine_path).await;
            return Err(Error::FileIntegrity);
        }

        tokio::fs::create_dir_all(&self.received_dir).await?;
        let final_path = self.received_dir.join(&transfer.file_name);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&quarantine_path, &final_path).await?;
        if let Err(e) = self.store.update_transfer_session_status(transfer_id, "completed") {
            tracing::warn!(transfer_id, error = %e, "failed to mark transfer session completed");
        }

        Ok(PeerMessage::FileCompleteAck {
            transfer_id: transfer_id.to_string(),
            result: FileCompleteResult::Success { relative_name: transfer.file_name },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> std::sync::Arc<Store> {
        std::sync::Arc::new(Store::open_in_memory(b"test-seed").unwrap())
    }

    #[tokio::test]
    async fn single_file_round_trips_across_sender_and_receiver() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let crypto_a = Crypto::load_or_generate(dir_a.path()).unwrap();
        let crypto_b = Crypto::load_or_generate(dir_b.path()).unwrap();
        let a_pub = crypto_a.public_encryption_key().to_bytes();
        let b_pub = crypto_b.public_encryption_key().to_bytes();

        let source_dir = tempdir().unwrap();
        let source_path = source_dir.path().join("data.bin");
        let contents = vec![7u8; 160 * 1024];
        tokio::fs::write(&source_path, &contents).await.unwrap();

        let received_root = tempdir().unwrap();
        let pipeline = TransferPipeline::new(
            store(),
            received_root.path().join("received"),
            received_root.path().join("received/chunks"),
        );

        let transfer = OutboundFileTransfer {
            transfer_id: "t1".into(),
            backup_id: "b1".into(),
            source_path: source_path.clone(),
            peer_id_hash: crypto_b.peer_id_hash().to_string(),
            peer_public_key: b_pub,
            chunk_size: 65536,
            total_chunks: 3,
        };

        let start = pipeline.begin_send(&transfer, "data.bin", 0).await.unwrap();
        let (file_hash, total_chunks) = match &start {
            PeerMessage::FileStart { file_hash, total_chunks, .. } => (file_hash.clone(), *total_chunks),
            _ => panic!(),
        };
        assert_eq!(total_chunks, 3);

        pipeline.on_file_start("t1", "data.bin", total_chunks, &file_hash, crypto_a.peer_id_hash(), a_pub);

        for index in 0..total_chunks {
            let chunk_msg = pipeline.prepare_chunk(&crypto_a, &transfer, index).await.unwrap();
            let (ciphertext_base64, chunk_hash) = match &chunk_msg {
                PeerMessage::FileChunk { ciphertext_base64, chunk_hash, .. } => (ciphertext_base64.clone(), chunk_hash.clone()),
                _ => panic!(),
            };
            let ack = pipeline.on_file_chunk(&crypto_b, "t1", index, &ciphertext_base64, &chunk_hash);
            assert!(matches!(ack, PeerMessage::ChunkAck { result: ChunkAckResult::Received, .. }));
        }

        let complete = pipeline.on_file_complete("t1").await.unwrap();
        match complete {
            PeerMessage::FileCompleteAck { result: FileCompleteResult::Success { relative_name }, .. } => {
                assert_eq!(relative_name, "data.bin");
                let written = tokio::fs::read(received_root.path().join("received").join("data.bin")).await.unwrap();
                assert_eq!(written, contents);
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn tampered_chunk_hash_is_never_acked() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let crypto_a = Crypto::load_or_generate(dir_a.path()).unwrap();
        let crypto_b = Crypto::load_or_generate(dir_b.path()).unwrap();
        let a_pub = crypto_a.public_encryption_key().to_bytes();

        let received_root = tempdir().unwrap();
        let pipeline = TransferPipeline::new(
            store(),
            received_root.path().join("received"),
            received_root.path().join("received/chunks"),
        );
        pipeline.on_file_start("t1", "f.bin", 1, "deadbeef", crypto_a.peer_id_hash(), a_pub);

        let ciphertext = crypto_a
            .encrypt_for_peer(crypto_b.peer_id_hash(), &crypto_b.public_encryption_key().to_bytes(), b"hello")
            .unwrap();
        let ciphertext_base64 = base64::engine::general_purpose::STANDARD.encode(&ciphertext);

        let ack = pipeline.on_file_chunk(&crypto_b, "t1", 0, &ciphertext_base64, "wrong-hash");
        assert!(matches!(ack, PeerMessage::ChunkAck { result: ChunkAckResult::Error { .. }, .. }));
    }
}
