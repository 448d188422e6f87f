//! Crypto component (§4.1): key lifecycle, peer identity, shared-secret
//! derivation, authenticated channel encryption, hashing, and session
//! proofs. This is the only owner of private key material in the process
//! (§5) — every other component calls into `Crypto`, never holds keys
//! itself.

pub mod encryption;
pub mod identity;
pub mod keystore;
pub mod session_proof;

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::path::Path;
use x25519_dalek::PublicKey;

pub use identity::{peer_id_hash, SignedIdentity, VerifiedIdentity};
pub use session_proof::SessionProof;

use crate::error::Result;
use keystore::Keystore;

const SHARED_SECRET_CACHE_CAPACITY: usize = 512;

/// Facade used by the rest of the peer core. Shared secrets are derived
/// once per counterparty and cached by peer-id-hash, with an explicit LRU
/// eviction policy (§9 — "ad-hoc in-memory maps with no lifetime").
pub struct Crypto {
    keystore: Keystore,
    shared_secrets: Mutex<LruCache<String, [u8; 32]>>,
}

impl Crypto {
    pub fn load_or_generate(key_dir: &Path) -> Result<Self> {
        let keystore = Keystore::load_or_generate(key_dir)?;
        Ok(Self {
            keystore,
            shared_secrets: Mutex::new(LruCache::new(
                NonZeroUsize::new(SHARED_SECRET_CACHE_CAPACITY).unwrap(),
            )),
        })
    }

    pub fn peer_id_hash(&self) -> &str {
        self.keystore.peer_id_hash()
    }

    pub fn public_signing_key(&self) -> [u8; 32] {
        self.keystore.public_signing_key()
    }

    pub fn public_encryption_key(&self) -> PublicKey {
        self.keystore.public_encryption_key()
    }

    pub fn sign_identity(&self, capabilities: Vec<String>) -> SignedIdentity {
        self.keystore.sign_identity(capabilities)
    }

    pub fn verify_identity(identity: &SignedIdentity) -> Result<VerifiedIdentity> {
        identity::verify_identity(identity)
    }

    pub fn generate_session_proof(&self, fingerprint: impl Into<String>) -> SessionProof {
        self.keystore.generate_session_proof(fingerprint)
    }

    pub fn verify_session_proof(proof: &SessionProof, public_key: &[u8; 32]) -> Result<()> {
        session_proof::verify(proof, public_key)
    }

    pub fn sign_bytes(&self, data: &[u8]) -> [u8; 64] {
        self.keystore.sign_bytes(data)
    }

    /// Derive (or fetch the cached) shared secret for `peer_id_hash`.
    pub fn shared_secret_for(&self, peer_id_hash: &str, peer_public_key: &[u8; 32]) -> [u8; 32] {
        let mut cache = self.shared_secrets.lock();
        if let Some(key) = cache.get(peer_id_hash) {
            return *key;
        }
        let remote = PublicKey::from(*peer_public_key);
        let key = encryption::derive_shared_key(self.keystore.encryption_secret(), &remote);
        cache.put(peer_id_hash.to_string(), key);
        key
    }

    pub fn encrypt_for_peer(&self, peer_id_hash: &str, peer_public_key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.shared_secret_for(peer_id_hash, peer_public_key);
        encryption::encrypt(&key, plaintext)
    }

    pub fn decrypt_from_peer(&self, peer_id_hash: &str, peer_public_key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>> {
        let key = self.shared_secret_for(peer_id_hash, peer_public_key);
        encryption::decrypt(&key, sealed)
    }

    /// SHA-256 of arbitrary data (§4.1(f)).
    pub fn hash(data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    pub fn hash_hex(data: &[u8]) -> String {
        hex::encode(Self::hash(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn two_peers_derive_the_same_shared_secret() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let a = Crypto::load_or_generate(dir_a.path()).unwrap();
        let b = Crypto::load_or_generate(dir_b.path()).unwrap();

        let a_pub = a.public_encryption_key().to_bytes();
        let b_pub = b.public_encryption_key().to_bytes();

        let secret_a = a.shared_secret_for(b.peer_id_hash(), &b_pub);
        let secret_b = b.shared_secret_for(a.peer_id_hash(), &a_pub);
        assert_eq!(secret_a, secret_b);
    }

    #[test]
    fn encrypted_payload_round_trips_between_peers() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let a = Crypto::load_or_generate(dir_a.path()).unwrap();
        let b = Crypto::load_or_generate(dir_b.path()).unwrap();
        let a_pub = a.public_encryption_key().to_bytes();
        let b_pub = b.public_encryption_key().to_bytes();

        let sealed = a
            .encrypt_for_peer(b.peer_id_hash(), &b_pub, b"chunk payload")
            .unwrap();
        let recovered = b
            .decrypt_from_peer(a.peer_id_hash(), &a_pub, &sealed)
            .unwrap();
        assert_eq!(recovered, b"chunk payload");
    }
}
