//! Session proofs: a fresh signed artifact binding a connection instance to
//! time and a random nonce (§3, §4.1(g)). Accepted only within a
//! ±5-minute window around the verifier's clock.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

const ACCEPTANCE_WINDOW_SECS: i64 = 5 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionProof {
    /// ICE candidate fingerprint, or a fixed placeholder when the transport
    /// does not expose one.
    pub fingerprint: String,
    pub timestamp: u64,
    #[serde(with = "hex32")]
    pub nonce: [u8; 32],
    #[serde(with = "hex32")]
    pub hash: [u8; 32],
    #[serde(with = "hex64")]
    pub signature: [u8; 64],
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn canonical_hash(fingerprint: &str, timestamp: u64, nonce: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    hasher.update(timestamp.to_be_bytes());
    hasher.update(nonce);
    hasher.finalize().into()
}

pub fn generate(signing_key: &SigningKey, fingerprint: impl Into<String>) -> SessionProof {
    let fingerprint = fingerprint.into();
    let timestamp = now_secs();
    let mut nonce = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let hash = canonical_hash(&fingerprint, timestamp, &nonce);
    let signature: Signature = signing_key.sign(&hash);

    SessionProof {
        fingerprint,
        timestamp,
        nonce,
        hash,
        signature: signature.to_bytes(),
    }
}

pub fn verify(proof: &SessionProof, public_key: &[u8; 32]) -> Result<()> {
    let expected_hash = canonical_hash(&proof.fingerprint, proof.timestamp, &proof.nonce);
    if expected_hash != proof.hash {
        return Err(Error::CryptoHashMismatch);
    }

    let now = now_secs() as i64;
    let delta = now - proof.timestamp as i64;
    if delta.abs() > ACCEPTANCE_WINDOW_SECS {
        return Err(Error::IdentityExpired);
    }

    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| Error::IdentityKeyLength)?;
    let signature = Signature::from_bytes(&proof.signature);
    verifying_key
        .verify(&proof.hash, &signature)
        .map_err(|_| Error::SignatureInvalid)
}

mod hex32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s)
            .map_err(serde::de::Error::custom)?
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

mod hex64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s)
            .map_err(serde::de::Error::custom)?
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 64 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn fresh_proof_verifies() {
        let key = SigningKey::generate(&mut OsRng);
        let proof = generate(&key, "fp:1234");
        verify(&proof, &key.verifying_key().to_bytes()).unwrap();
    }

    #[test]
    fn stale_proof_is_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let mut proof = generate(&key, "fp:1234");
        proof.timestamp -= ACCEPTANCE_WINDOW_SECS as u64 + 1;
        // Re-sign over the original hash is impossible without recomputing;
        // the hash itself binds the original timestamp so tampering the
        // timestamp after signing invalidates the hash check first.
        let err = verify(&proof, &key.verifying_key().to_bytes()).unwrap_err();
        assert_eq!(err.code(), "crypto.hash_mismatch");
    }

    #[test]
    fn tampered_nonce_fails_hash_check() {
        let key = SigningKey::generate(&mut OsRng);
        let mut proof = generate(&key, "fp:1234");
        proof.nonce[0] ^= 0xFF;
        let err = verify(&proof, &key.verifying_key().to_bytes()).unwrap_err();
        assert_eq!(err.code(), "crypto.hash_mismatch");
    }
}
