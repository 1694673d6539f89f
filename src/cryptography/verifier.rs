//! Master-credential verification.
//!
//! The reference credential is an Argon2id hash of the master password
//! under a per-credential random salt. Verification re-derives the hash and
//! compares in constant time; a wrong username, a wrong password and an
//! unset credential all cost one derivation and all answer `false`.

use crate::cryptography::primitives::{derive_key_argon2id, random_salt, KdfParams, KEY_LEN};
use crate::error::{VaultError, VaultResult};
use crate::vault::ports::CredentialStore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

const DUMMY_SALT: &[u8; 16] = b"bluekey-no-cred!";

/// Persisted master credential. Hash and salt are hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultCredential {
    pub username: String,
    pub password_hash: String,
    pub salt: String,
    #[serde(default)]
    pub kdf: KdfParams,
}

pub trait CredentialVerifier: Send + Sync {
    /// `Ok(false)` for any mismatch; `Err` only when the stored reference is unusable.
    fn verify(&self, username: &str, password: &SecretString) -> VaultResult<bool>;

    /// Replace the reference credential. The plaintext is dropped (and wiped) on return.
    fn set_credential(&self, username: &str, password: SecretString) -> VaultResult<()>;

    fn supports_lockout(&self) -> bool {
        false
    }
}

pub struct Argon2Verifier {
    store: Arc<dyn CredentialStore>,
    params: KdfParams,
}

impl Argon2Verifier {
    pub fn new(store: Arc<dyn CredentialStore>, params: KdfParams) -> Self {
        Self { store, params }
    }

    pub fn has_credential(&self) -> VaultResult<bool> {
        Ok(self
            .store
            .load()
            .map_err(VaultError::from_storage)?
            .is_some())
    }
}

fn corrupt(msg: impl Into<String>) -> VaultError {
    VaultError::CorruptCredentialStore(msg.into())
}

impl CredentialVerifier for Argon2Verifier {
    fn verify(&self, username: &str, password: &SecretString) -> VaultResult<bool> {
        let Some(cred) = self.store.load().map_err(VaultError::from_storage)? else {
            // Same cost as a real check so an unset credential is not observable.
            let mut dummy = derive_key_argon2id(password.expose_secret(), DUMMY_SALT, self.params)
                .map_err(|e| VaultError::Crypto(e.to_string()))?;
            dummy.zeroize();
            tracing::debug!("verification attempted with no credential set");
            return Ok(false);
        };

        let salt = hex::decode(&cred.salt).map_err(|e| corrupt(format!("salt: {e}")))?;
        let expected =
            hex::decode(&cred.password_hash).map_err(|e| corrupt(format!("hash: {e}")))?;
        if expected.len() != KEY_LEN {
            return Err(corrupt(format!(
                "hash length {} (expected {KEY_LEN})",
                expected.len()
            )));
        }
        if salt.len() < 8 {
            return Err(corrupt("salt shorter than 8 bytes"));
        }

        let mut computed = derive_key_argon2id(password.expose_secret(), &salt, cred.kdf)
            .map_err(|e| corrupt(e.to_string()))?;
        let hash_ok = computed.as_slice().ct_eq(expected.as_slice());
        let user_ok = username.as_bytes().ct_eq(cred.username.as_bytes());
        computed.zeroize();

        let accepted: bool = (hash_ok & user_ok).into();
        tracing::debug!(accepted, "master credential verified");
        Ok(accepted)
    }

    fn set_credential(&self, username: &str, password: SecretString) -> VaultResult<()> {
        if password.expose_secret().trim().is_empty() {
            return Err(VaultError::ValidationFailure(
                "master password must not be blank".into(),
            ));
        }
        let salt = random_salt().map_err(|e| VaultError::Crypto(e.to_string()))?;
        let mut hash = derive_key_argon2id(password.expose_secret(), &salt, self.params)
            .map_err(|e| VaultError::Crypto(e.to_string()))?;
        drop(password);
        let cred = VaultCredential {
            username: username.to_string(),
            password_hash: hex::encode(hash),
            salt: hex::encode(salt),
            kdf: self.params,
        };
        hash.zeroize();
        self.store.save(&cred).map_err(VaultError::from_storage)?;
        tracing::info!("master credential updated");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LockoutState {
    failures: u32,
    locked_until: Option<Instant>,
}

/// Counts consecutive failures and refuses every attempt for `cooldown`
/// once `max_failures` is reached. A success resets the counter.
pub struct LockoutVerifier<V> {
    inner: V,
    max_failures: u32,
    cooldown: Duration,
    state: Mutex<LockoutState>,
}

impl<V: CredentialVerifier> LockoutVerifier<V> {
    pub fn new(inner: V, max_failures: u32, cooldown: Duration) -> Self {
        Self {
            inner,
            max_failures: max_failures.max(1),
            cooldown,
            state: Mutex::new(LockoutState::default()),
        }
    }

    pub fn failed_attempts(&self) -> u32 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .failures
    }

    pub fn is_locked_out(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .locked_until
            .is_some_and(|until| Instant::now() < until)
    }
}

impl<V: CredentialVerifier> CredentialVerifier for LockoutVerifier<V> {
    fn verify(&self, username: &str, password: &SecretString) -> VaultResult<bool> {
        if self.is_locked_out() {
            tracing::warn!("verification refused during lockout");
            return Ok(false);
        }
        let accepted = self.inner.verify(username, password)?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if accepted {
            *state = LockoutState::default();
        } else {
            state.failures = state.failures.saturating_add(1);
            if state.failures >= self.max_failures {
                state.locked_until = Some(Instant::now() + self.cooldown);
                state.failures = 0;
            }
        }
        Ok(accepted)
    }

    fn set_credential(&self, username: &str, password: SecretString) -> VaultResult<()> {
        self.inner.set_credential(username, password)?;
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = LockoutState::default();
        Ok(())
    }

    fn supports_lockout(&self) -> bool {
        true
    }
}
