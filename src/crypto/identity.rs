//! Peer identity: long-term signing keypair, peer-id-hash derivation, and
//! the signed-identity bundle exchanged during handshaking (§3, §4.1).

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

pub const PROTOCOL_VERSION: u32 = 1;
const IDENTITY_MAX_AGE_SECS: u64 = 3600;

/// The stable, compact handle derived from a signing public key: the lower
/// 16 hex characters of SHA-256(public_key).
pub fn peer_id_hash(public_key: &[u8; 32]) -> String {
    let digest = Sha256::digest(public_key);
    let full = hex::encode(digest);
    full[full.len() - 16..].to_string()
}

/// A signed peer identity, as exchanged on the wire during handshaking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedIdentity {
    pub peer_id_hash: String,
    #[serde(with = "hex_bytes")]
    pub signature: [u8; 64],
    #[serde(with = "hex_bytes32")]
    pub public_key: [u8; 32],
    pub issued_at: u64,
    pub protocol_version: u32,
    pub capabilities: Vec<String>,
}

/// Outcome of verifying a `SignedIdentity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub peer_id_hash: String,
    pub public_key: [u8; 32],
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Build a signed identity from a local signing key.
pub fn sign_identity(signing_key: &SigningKey, capabilities: Vec<String>) -> SignedIdentity {
    let public_key = signing_key.verifying_key().to_bytes();
    let hash = peer_id_hash(&public_key);
    let signature: Signature = signing_key.sign(hash.as_bytes());
    SignedIdentity {
        peer_id_hash: hash,
        signature: signature.to_bytes(),
        public_key,
        issued_at: now_secs(),
        protocol_version: PROTOCOL_VERSION,
        capabilities,
    }
}

/// Verify a signed identity per §4.1(c): hash must match the embedded key,
/// signature must verify, version must be supported, and the timestamp must
/// be no older than one hour.
pub fn verify_identity(identity: &SignedIdentity) -> Result<VerifiedIdentity> {
    if identity.protocol_version != PROTOCOL_VERSION {
        return Err(Error::VersionUnsupported);
    }

    let expected_hash = peer_id_hash(&identity.public_key);
    if expected_hash != identity.peer_id_hash {
        return Err(Error::IdentityHashMismatch);
    }

    let now = now_secs();
    if identity.issued_at + IDENTITY_MAX_AGE_SECS < now {
        return Err(Error::IdentityExpired);
    }

    let verifying_key = VerifyingKey::from_bytes(&identity.public_key)
        .map_err(|_| Error::IdentityKeyLength)?;
    let signature = Signature::from_bytes(&identity.signature);
    verifying_key
        .verify(identity.peer_id_hash.as_bytes(), &signature)
        .map_err(|_| Error::SignatureInvalid)?;

    Ok(VerifiedIdentity {
        peer_id_hash: identity.peer_id_hash.clone(),
        public_key: identity.public_key,
    })
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let s = String::deserialize(d)?;
        let v = hex::decode(&s).map_err(serde::de::Error::custom)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("expected 64 bytes"))
    }
}

mod hex_bytes32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let v = hex::decode(&s).map_err(serde::de::Error::custom)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn identity_round_trip() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let expected_hash = peer_id_hash(&signing_key.verifying_key().to_bytes());

        let identity = sign_identity(&signing_key, vec!["backup/1".into()]);
        assert_eq!(identity.peer_id_hash, expected_hash);

        let verified = verify_identity(&identity).unwrap();
        assert_eq!(verified.peer_id_hash, expected_hash);
        assert_eq!(verified.public_key, signing_key.verifying_key().to_bytes());
    }

    #[test]
    fn flipped_signature_byte_is_rejected() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let mut identity = sign_identity(&signing_key, vec![]);
        identity.signature[0] ^= 0xFF;

        let err = verify_identity(&identity).unwrap_err();
        assert_eq!(err.code(), "crypto.signature_invalid");
    }

    #[test]
    fn tampered_public_key_fails_hash_check() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let mut identity = sign_identity(&signing_key, vec![]);
        let other = SigningKey::generate(&mut OsRng);
        identity.public_key = other.verifying_key().to_bytes();

        let err = verify_identity(&identity).unwrap_err();
        assert_eq!(err.code(), "identity.hash_mismatch");
    }

    #[test]
    fn expired_identity_is_rejected() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let mut identity = sign_identity(&signing_key, vec![]);
        identity.issued_at = 0;

        let err = verify_identity(&identity).unwrap_err();
        assert_eq!(err.code(), "identity.expired");
    }
}
