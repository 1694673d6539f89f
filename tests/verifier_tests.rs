use bluekey::cryptography::primitives::KdfParams;
use bluekey::cryptography::verifier::{
    Argon2Verifier, CredentialVerifier, LockoutVerifier, VaultCredential,
};
use bluekey::error::VaultError;
use bluekey::filesystem::credentials::{credential_path, FileCredentialStore, MemoryCredentialStore};
use bluekey::vault::ports::CredentialStore;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn fast() -> KdfParams {
    KdfParams {
        m_cost_kib: 8,
        t_cost: 1,
        p_lanes: 1,
    }
}

fn pw(s: &str) -> SecretString {
    SecretString::from(s.to_string())
}

fn verifier() -> (Arc<MemoryCredentialStore>, Argon2Verifier) {
    let store = Arc::new(MemoryCredentialStore::new());
    (store.clone(), Argon2Verifier::new(store, fast()))
}

#[test]
fn verify_accepts_only_the_last_credential_set() {
    let (_, v) = verifier();
    v.set_credential("alice", pw("first-pass")).unwrap();
    assert!(v.verify("alice", &pw("first-pass")).unwrap());
    assert!(!v.verify("alice", &pw("wrong")).unwrap());
    assert!(!v.verify("bob", &pw("first-pass")).unwrap());

    v.set_credential("alice", pw("second-pass")).unwrap();
    assert!(!v.verify("alice", &pw("first-pass")).unwrap());
    assert!(v.verify("alice", &pw("second-pass")).unwrap());
}

#[test]
fn unset_credential_answers_false() {
    let (_, v) = verifier();
    assert!(!v.has_credential().unwrap());
    assert!(!v.verify("anyone", &pw("anything")).unwrap());
}

#[test]
fn stored_record_never_contains_the_password() {
    let (store, v) = verifier();
    v.set_credential("alice", pw("plain-text-pass")).unwrap();
    let cred = store.load().unwrap().unwrap();
    assert_eq!(cred.username, "alice");
    assert!(!cred.password_hash.contains("plain-text-pass"));
    assert_eq!(cred.password_hash.len(), 64);

    // A second credential with the same password gets a fresh salt.
    v.set_credential("alice", pw("plain-text-pass")).unwrap();
    let again = store.load().unwrap().unwrap();
    assert_ne!(again.salt, cred.salt);
    assert_ne!(again.password_hash, cred.password_hash);
}

#[test]
fn blank_master_password_is_rejected() {
    let (_, v) = verifier();
    let err = v.set_credential("alice", pw("   ")).unwrap_err();
    assert!(matches!(err, VaultError::ValidationFailure(_)));
}

#[test]
fn corrupted_hash_state_is_reported() {
    let (store, v) = verifier();
    v.set_credential("alice", pw("pass")).unwrap();
    let good = store.load().unwrap().unwrap();

    let bad_hex = VaultCredential {
        password_hash: "zz-not-hex".into(),
        ..good.clone()
    };
    store.save(&bad_hex).unwrap();
    assert!(matches!(
        v.verify("alice", &pw("pass")),
        Err(VaultError::CorruptCredentialStore(_))
    ));

    let short_hash = VaultCredential {
        password_hash: "abcd".into(),
        ..good.clone()
    };
    store.save(&short_hash).unwrap();
    assert!(matches!(
        v.verify("alice", &pw("pass")),
        Err(VaultError::CorruptCredentialStore(_))
    ));

    let bad_costs = VaultCredential {
        kdf: KdfParams {
            m_cost_kib: 0,
            t_cost: 0,
            p_lanes: 0,
        },
        ..good
    };
    store.save(&bad_costs).unwrap();
    assert!(matches!(
        v.verify("alice", &pw("pass")),
        Err(VaultError::CorruptCredentialStore(_))
    ));
}

#[test]
fn credential_file_round_trips_and_malformed_file_is_corrupt() {
    let dir = tempdir().unwrap();
    let vault_path = dir.path().join("vault.blk");
    let path = credential_path(&vault_path);
    assert_eq!(path, dir.path().join("vault.blk.cred"));

    let store = Arc::new(FileCredentialStore::for_vault(&vault_path));
    let v = Argon2Verifier::new(store, fast());
    v.set_credential("alice", pw("pass")).unwrap();
    assert!(path.exists());
    assert!(v.verify("alice", &pw("pass")).unwrap());

    std::fs::write(&path, "this is not ron (").unwrap();
    assert!(matches!(
        v.verify("alice", &pw("pass")),
        Err(VaultError::CorruptCredentialStore(_))
    ));
}

#[test]
fn base_verifier_has_no_lockout() {
    let (_, v) = verifier();
    assert!(!v.supports_lockout());
}

#[test]
fn lockout_engages_after_threshold_and_expires() {
    let (_, base) = verifier();
    base.set_credential("alice", pw("pass")).unwrap();
    let v = LockoutVerifier::new(base, 2, Duration::from_millis(150));
    assert!(v.supports_lockout());

    assert!(!v.verify("alice", &pw("nope")).unwrap());
    assert_eq!(v.failed_attempts(), 1);
    assert!(!v.verify("alice", &pw("nope")).unwrap());
    assert!(v.is_locked_out());

    // Correct credentials are refused while locked out.
    assert!(!v.verify("alice", &pw("pass")).unwrap());

    std::thread::sleep(Duration::from_millis(200));
    assert!(!v.is_locked_out());
    assert!(v.verify("alice", &pw("pass")).unwrap());
    assert_eq!(v.failed_attempts(), 0);
}
