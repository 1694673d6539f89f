use bluekey::cryptography::keys::PassphraseKeyResolver;
use bluekey::cryptography::primitives::{parse_header, KdfParams, HEADER_LEN, HEADER_MAGIC};
use bluekey::filesystem::store::{FileByteStore, MemoryByteStore};
use bluekey::vault::codec::RonCodec;
use bluekey::vault::models::{PasswordEntry, Revision, StoredEntry, VaultSnapshot};
use bluekey::vault::persistence::{EncryptedStorage, SealedFile};
use bluekey::vault::ports::{ByteStore, StorageBackend};
use secrecy::SecretString;
use std::sync::Arc;
use tempfile::tempdir;
use uuid::Uuid;

fn fast() -> KdfParams {
    KdfParams {
        m_cost_kib: 8,
        t_cost: 1,
        p_lanes: 1,
    }
}

fn storage(bytes: Arc<dyn ByteStore>, password: &str) -> EncryptedStorage {
    let keys = Arc::new(PassphraseKeyResolver::new(SecretString::from(
        password.to_string(),
    )));
    EncryptedStorage::new(SealedFile::new(bytes, keys, fast()), Arc::new(RonCodec))
}

fn sample() -> VaultSnapshot {
    let id = Uuid::new_v4();
    let mut snapshot = VaultSnapshot::default();
    snapshot.entries.push(StoredEntry {
        id,
        entry: PasswordEntry::new("mail", "jimmy", "very-secret-password"),
        revision: Revision(2),
        conflict_of: None,
    });
    snapshot.sync.pending_local_changes.insert(id);
    snapshot
}

#[test]
fn nothing_written_loads_as_none() {
    let s = storage(Arc::new(MemoryByteStore::new()), "pw");
    assert!(s.load().unwrap().is_none());
}

#[test]
fn saved_snapshot_is_sealed_and_reloads() {
    let bytes = Arc::new(MemoryByteStore::new());
    let s = storage(bytes.clone(), "pw");
    let snapshot = sample();
    s.save(&snapshot).unwrap();

    let raw = bytes.contents();
    assert!(raw.starts_with(HEADER_MAGIC));
    assert!(raw.len() > HEADER_LEN);
    let text = String::from_utf8_lossy(&raw);
    assert!(!text.contains("very-secret-password"));
    assert!(!text.contains("mail"));

    assert_eq!(storage(bytes, "pw").load().unwrap(), Some(snapshot));
}

#[test]
fn resealing_keeps_salt_and_changes_nonce() {
    let bytes = Arc::new(MemoryByteStore::new());
    let s = storage(bytes.clone(), "pw");
    s.save(&sample()).unwrap();
    let (first, _) = parse_header(&bytes.contents()).unwrap();
    s.save(&sample()).unwrap();
    let (second, _) = parse_header(&bytes.contents()).unwrap();
    assert_eq!(first.salt, second.salt);
    assert_ne!(first.nonce, second.nonce);
    assert_eq!(second.params, fast());
}

#[test]
fn wrong_password_fails_to_load() {
    let bytes = Arc::new(MemoryByteStore::new());
    storage(bytes.clone(), "right").save(&sample()).unwrap();
    let err = storage(bytes, "wrong").load().unwrap_err();
    assert!(format!("{err:#}").contains("wrong password"));
}

#[test]
fn tampering_is_detected() {
    let bytes = Arc::new(MemoryByteStore::new());
    storage(bytes.clone(), "pw").save(&sample()).unwrap();

    let mut body = bytes.contents();
    let last = body.len() - 1;
    body[last] ^= 0x01;
    bytes.write(&body).unwrap();
    assert!(storage(bytes.clone(), "pw").load().is_err());

    // Header bytes are authenticated too.
    storage(bytes.clone(), "pw").save(&sample()).unwrap();
    let mut hdr = bytes.contents();
    hdr[HEADER_LEN - 1] ^= 0x01;
    bytes.write(&hdr).unwrap();
    assert!(storage(bytes, "pw").load().is_err());
}

#[test]
fn plaintext_file_is_rejected() {
    let bytes = Arc::new(MemoryByteStore::new());
    bytes.write(b"(entries: [], sync: ())").unwrap();
    let err = storage(bytes, "pw").load().unwrap_err();
    assert!(format!("{err:#}").contains("plaintext is not allowed"));
}

#[test]
fn rekey_switches_password_and_salt() {
    let bytes = Arc::new(MemoryByteStore::new());
    let old = storage(bytes.clone(), "old");
    let snapshot = sample();
    old.save(&snapshot).unwrap();
    let (before, _) = parse_header(&bytes.contents()).unwrap();

    let new_keys = Arc::new(PassphraseKeyResolver::new(SecretString::from("new".to_string())));
    let rekeyed = old
        .rekey(SealedFile::new(bytes.clone(), new_keys, fast()), &snapshot)
        .unwrap();
    let (after, _) = parse_header(&bytes.contents()).unwrap();
    assert_ne!(before.salt, after.salt);

    assert_eq!(rekeyed.load().unwrap(), Some(snapshot.clone()));
    assert!(storage(bytes.clone(), "old").load().is_err());
    assert_eq!(storage(bytes, "new").load().unwrap(), Some(snapshot));
}

#[cfg(unix)]
#[test]
fn vault_file_is_owner_only_with_rotating_backups() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempdir().unwrap();
    let path = dir.path().join("vault.blk");
    let bytes = Arc::new(FileByteStore::new(path.clone(), 2));
    let s = storage(bytes, "pw");
    for _ in 0..3 {
        s.save(&sample()).unwrap();
    }
    let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
    for n in 1..=2 {
        let backup = std::path::PathBuf::from(format!("{}.{n}", path.display()));
        let raw = std::fs::read(&backup).unwrap();
        assert!(raw.starts_with(HEADER_MAGIC), "backups stay encrypted");
    }
    assert!(!std::path::PathBuf::from(format!("{}.3", path.display())).exists());
}
