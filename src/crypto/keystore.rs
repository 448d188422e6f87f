//! Key lifecycle: load persisted signing/encryption keypairs from the
//! configured home directory, generating new ones atomically on first use
//! with restrictive permissions on private material (§4.1(a)).

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use std::fs;
use std::path::{Path, PathBuf};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::identity::{self, SignedIdentity};
use crate::crypto::session_proof::{self, SessionProof};
use crate::error::{Error, Result};

/// Owns the node's long-term private key material. Private key bytes are
/// never exposed by reference outside this module; operations take inputs
/// and return outputs (§5, "keys ... are never handed out").
pub struct Keystore {
    signing_key: SigningKey,
    encryption_secret: StaticSecret,
    peer_id_hash: String,
}

impl Keystore {
    /// Load keys from `dir`, generating and persisting them on first use.
    pub fn load_or_generate(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let signing_path = dir.join("signing_private.key");
        let encryption_path = dir.join("private.key");

        let signing_key = if signing_path.exists() {
            let bytes = fs::read(&signing_path)?;
            let arr: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::IdentityKeyLength)?;
            SigningKey::from_bytes(&arr)
        } else {
            let key = SigningKey::generate(&mut OsRng);
            write_private(&signing_path, key.to_bytes().as_slice())?;
            write_public(
                &dir.join("signing_public.key"),
                key.verifying_key().to_bytes().as_slice(),
            )?;
            key
        };

        let encryption_secret = if encryption_path.exists() {
            let bytes = fs::read(&encryption_path)?;
            let arr: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::IdentityKeyLength)?;
            StaticSecret::from(arr)
        } else {
            let secret = StaticSecret::random_from_rng(OsRng);
            write_private(&encryption_path, secret.to_bytes().as_slice())?;
            write_public(
                &dir.join("public.key"),
                PublicKey::from(&secret).as_bytes().as_slice(),
            )?;
            secret
        };

        let peer_id_hash = identity::peer_id_hash(&signing_key.verifying_key().to_bytes());

        Ok(Self {
            signing_key,
            encryption_secret,
            peer_id_hash,
        })
    }

    pub fn peer_id_hash(&self) -> &str {
        &self.peer_id_hash
    }

    pub fn public_signing_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn public_encryption_key(&self) -> PublicKey {
        PublicKey::from(&self.encryption_secret)
    }

    pub fn encryption_secret(&self) -> &StaticSecret {
        &self.encryption_secret
    }

    pub fn sign_identity(&self, capabilities: Vec<String>) -> SignedIdentity {
        identity::sign_identity(&self.signing_key, capabilities)
    }

    pub fn generate_session_proof(&self, fingerprint: impl Into<String>) -> SessionProof {
        session_proof::generate(&self.signing_key, fingerprint)
    }

    pub fn sign_bytes(&self, data: &[u8]) -> [u8; 64] {
        use ed25519_dalek::Signer;
        self.signing_key.sign(data).to_bytes()
    }
}

#[cfg(unix)]
fn write_private(path: &PathBuf, bytes: &[u8]) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::write(path, bytes)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &PathBuf, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes)?;
    Ok(())
}

#[cfg(unix)]
fn write_public(path: &PathBuf, bytes: &[u8]) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::write(path, bytes)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_public(path: &PathBuf, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generates_and_reloads_the_same_identity() {
        let dir = tempdir().unwrap();
        let first = Keystore::load_or_generate(dir.path()).unwrap();
        let hash_first = first.peer_id_hash().to_string();
        drop(first);

        let second = Keystore::load_or_generate(dir.path()).unwrap();
        assert_eq!(second.peer_id_hash(), hash_first);
    }

    #[cfg(unix)]
    #[test]
    fn private_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let _ks = Keystore::load_or_generate(dir.path()).unwrap();
        let meta = fs::metadata(dir.path().join("signing_private.key")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
