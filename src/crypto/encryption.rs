//! Authenticated channel encryption: X25519 key agreement, HKDF expansion,
//! and ChaCha20-Poly1305 sealing with a fresh nonce prepended to the
//! ciphertext (§4.1(d), §4.1(e)).

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;

/// Derive a 256-bit symmetric key from an X25519 shared secret via
/// HKDF-SHA256, domain-separated for this protocol.
pub fn derive_shared_key(local_secret: &StaticSecret, remote_public: &PublicKey) -> [u8; 32] {
    let shared = local_secret.diffie_hellman(remote_public);
    let hk = Hkdf::<Sha256>::new(Some(b"backup-peer/channel-key/v1"), shared.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(b"channel", &mut key)
        .expect("32 is a valid HKDF output length");
    key
}

/// Encrypt `plaintext` under `key`, returning `nonce || ciphertext`.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| Error::DecryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a buffer produced by `encrypt`. A corrupted tag, truncated
/// buffer, or wrong key is a fatal `DecryptionFailed` for the caller.
pub fn decrypt(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(Error::DecryptionFailed);
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| Error::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn shared_key_is_symmetric_between_both_sides() {
        let a = StaticSecret::random_from_rng(OsRng);
        let b = StaticSecret::random_from_rng(OsRng);
        let a_pub = PublicKey::from(&a);
        let b_pub = PublicKey::from(&b);

        let key_a = derive_shared_key(&a, &b_pub);
        let key_b = derive_shared_key(&b, &a_pub);
        assert_eq!(key_a, key_b);
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = [7u8; 32];
        let plaintext = b"the rain in spain falls mainly on the plain";
        let sealed = encrypt(&key, plaintext).unwrap();
        let recovered = decrypt(&key, &sealed).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let key = [9u8; 32];
        let mut sealed = encrypt(&key, b"hello peer").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(decrypt(&key, &sealed).is_err());
    }

    #[test]
    fn each_encryption_uses_a_fresh_nonce() {
        let key = [3u8; 32];
        let a = encrypt(&key, b"same plaintext").unwrap();
        let b = encrypt(&key, b"same plaintext").unwrap();
        assert_ne!(a[..12], b[..12]);
    }
}
