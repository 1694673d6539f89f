use crate::cryptography::primitives::{
    derive_key_argon2id, ContainerHeader, KdfParams, NONCE_LEN, SALT_LEN,
};
use crate::vault::ports::{DerivedKey, KeyResolver};
use anyhow::Result;
use secrecy::{ExposeSecret, SecretBox, SecretString};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Derives container keys from the master password held for the session.
///
/// Keys are cached in memory by header fingerprint, so re-sealing the same
/// container (same salt and costs, new nonce) does not pay for Argon2 again.
pub struct PassphraseKeyResolver {
    passphrase: SecretString,
    cache: Mutex<HashMap<String, SecretBox<Vec<u8>>>>,
}

impl PassphraseKeyResolver {
    pub fn new(passphrase: SecretString) -> Self {
        Self {
            passphrase,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn resolve(&self, fingerprint: String, params: KdfParams, salt: &[u8]) -> Result<DerivedKey> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(key) = cache.get(&fingerprint) {
            return Ok(DerivedKey {
                key: SecretBox::new(Box::new(key.expose_secret().clone())),
            });
        }
        tracing::debug!(fingerprint = %&fingerprint[..12], "deriving container key");
        let key_arr = derive_key_argon2id(self.passphrase.expose_secret(), salt, params)?;
        let key_vec = key_arr.to_vec();
        cache.insert(
            fingerprint,
            SecretBox::new(Box::new(key_vec.clone())),
        );
        Ok(DerivedKey {
            key: SecretBox::new(Box::new(key_vec)),
        })
    }
}

impl KeyResolver for PassphraseKeyResolver {
    fn resolve_for_header(&self, hdr: &ContainerHeader) -> Result<DerivedKey> {
        self.resolve(hdr.fingerprint(), hdr.params, &hdr.salt)
    }

    fn resolve_for_new(&self, params: KdfParams, salt: [u8; SALT_LEN]) -> Result<DerivedKey> {
        let hdr = ContainerHeader::new(params, salt, [0u8; NONCE_LEN]);
        self.resolve(hdr.fingerprint(), params, &salt)
    }
}

impl core::fmt::Debug for PassphraseKeyResolver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PassphraseKeyResolver")
            .field("passphrase", &"<REDACTED>")
            .finish()
    }
}
