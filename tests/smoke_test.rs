//! Basic smoke tests verifying the core modules compile together and
//! the crypto/store primitives behave as expected end to end.

use backup_peer::crypto::Crypto;
use backup_peer::store::models::{Backup, BackupDirection, BackupStatus};
use backup_peer::store::Store;
use backup_peer::Result;

#[test]
fn crypto_round_trips_an_encrypted_payload_between_two_identities() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = Crypto::load_or_generate(dir_a.path()).unwrap();
    let b = Crypto::load_or_generate(dir_b.path()).unwrap();

    let ciphertext = a
        .encrypt_for_peer(b.peer_id_hash(), &b.public_encryption_key().to_bytes(), b"hello backup peer")
        .unwrap();
    let plaintext = b
        .decrypt_from_peer(a.peer_id_hash(), &a.public_encryption_key().to_bytes(), &ciphertext)
        .unwrap();
    assert_eq!(plaintext, b"hello backup peer");
}

#[test]
fn store_persists_and_reloads_a_backup_record() {
    let crypto = Crypto::load_or_generate(tempfile::tempdir().unwrap().path()).unwrap();
    let store = Store::open_in_memory(&crypto.public_signing_key()).unwrap();

    let backup = Backup::new(
        "backup-1".to_string(),
        "nightly archive".to_string(),
        BackupDirection::Sent,
        "abcdef0123456789".to_string(),
        1_700_000_000,
    )
    .unwrap();
    store.insert_backup(&backup).unwrap();

    let loaded = store.get_backup("backup-1").unwrap().expect("backup round-trips");
    assert_eq!(loaded.counterparty_peer_id_hash, "abcdef0123456789");
    assert_eq!(loaded.status, BackupStatus::Active);
}

#[test]
fn result_type_propagates_errors_through_question_mark() {
    fn fails() -> Result<()> {
        std::fs::read("/definitely/does/not/exist")?;
        Ok(())
    }
    assert!(fails().is_err());
}
