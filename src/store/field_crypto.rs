//! Field-level encryption for sensitive store columns (§4.2). The key is
//! derived once at startup via PBKDF2-HMAC-SHA256 (≥100,000 iterations)
//! from a deployment-specific seed, distinct from the per-peer channel
//! keys owned by `crate::crypto`.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{Error, Result};

const PBKDF2_ITERATIONS: u32 = 100_000;
const NONCE_LEN: usize = 12;

pub struct FieldCipher {
    key: [u8; 32],
}

impl FieldCipher {
    /// Derive the at-rest field key from a deployment seed. The seed is
    /// typically the signing private key material or an operator-supplied
    /// secret; it is never logged.
    pub fn derive(seed: &[u8], salt: &[u8]) -> Self {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(seed, salt, PBKDF2_ITERATIONS, &mut key);
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new((&self.key).into());
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::StoreFieldDecrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(Error::StoreFieldDecrypt);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new((&self.key).into());
        let nonce = Nonce::from_slice(nonce_bytes);
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::StoreFieldDecrypt)
    }

    pub fn encrypt_string(&self, plaintext: &str) -> Result<Vec<u8>> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_string(&self, sealed: &[u8]) -> Result<String> {
        let bytes = self.decrypt(sealed)?;
        String::from_utf8(bytes).map_err(|_| Error::StoreFieldDecrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_field() {
        let cipher = FieldCipher::derive(b"deployment-seed", b"backup-peer-store-salt");
        let sealed = cipher.encrypt_string("peer public key material").unwrap();
        let recovered = cipher.decrypt_string(&sealed).unwrap();
        assert_eq!(recovered, "peer public key material");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let a = FieldCipher::derive(b"seed-a", b"salt");
        let b = FieldCipher::derive(b"seed-b", b"salt");
        let sealed = a.encrypt_string("secret").unwrap();
        assert!(b.decrypt_string(&sealed).is_err());
    }
}
