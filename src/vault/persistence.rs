use crate::cryptography::memlock::with_locked_key;
use crate::cryptography::primitives::{open_with_key, parse_header, random_salt, seal_with_key, KdfParams};
use crate::vault::models::VaultSnapshot;
use crate::vault::ports::{ByteStore, KeyResolver, StorageBackend, VaultCodec};
use anyhow::{anyhow, Context, Result};
use secrecy::ExposeSecret;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// A byte store whose contents are always an encrypted container.
///
/// Re-sealing keeps the existing salt and costs (new nonce each write), so
/// the derived key stays cached for the lifetime of the resolver.
pub struct SealedFile {
    bytes: Arc<dyn ByteStore>,
    keys: Arc<dyn KeyResolver>,
    params: KdfParams,
}

impl SealedFile {
    pub fn new(bytes: Arc<dyn ByteStore>, keys: Arc<dyn KeyResolver>, params: KdfParams) -> Self {
        Self {
            bytes,
            keys,
            params,
        }
    }

    /// Decrypted contents, or `None` when nothing has been written yet.
    pub fn read_plain(&self) -> Result<Option<Vec<u8>>> {
        let raw = self.bytes.read()?;
        if raw.is_empty() {
            return Ok(None);
        }
        let (hdr, _off) = parse_header(&raw).map_err(|e| {
            anyhow!("unsupported vault format: {e} (plaintext is not allowed)")
        })?;
        let dk = self.keys.resolve_for_header(&hdr)?;
        let plain = with_locked_key(dk.key.expose_secret(), |key| open_with_key(&raw, key))
            .context("Failed to decrypt vault (wrong password?)")?;
        Ok(Some(plain))
    }

    pub fn write_plain(&self, plain: &[u8]) -> Result<()> {
        let raw = self.bytes.read()?;
        if raw.is_empty() {
            return self.write_fresh(plain);
        }
        let (hdr, _off) = parse_header(&raw).map_err(|e| anyhow!("invalid header: {e}"))?;
        let dk = self.keys.resolve_for_header(&hdr)?;
        let sealed = with_locked_key(dk.key.expose_secret(), |key| {
            seal_with_key(plain, hdr.params, hdr.salt, key)
        })?;
        self.bytes.write(&sealed)
    }

    /// Seal under a new random salt and the configured costs, ignoring any
    /// existing header. Used for new containers and master-password changes.
    pub fn write_fresh(&self, plain: &[u8]) -> Result<()> {
        let salt = random_salt()?;
        let dk = self.keys.resolve_for_new(self.params, salt)?;
        let sealed = with_locked_key(dk.key.expose_secret(), |key| {
            seal_with_key(plain, self.params, salt, key)
        })?;
        self.bytes.write(&sealed)
    }
}

/// Storage backend: codec-encoded snapshot inside a sealed container.
pub struct EncryptedStorage {
    file: SealedFile,
    codec: Arc<dyn VaultCodec>,
}

impl EncryptedStorage {
    pub fn new(file: SealedFile, codec: Arc<dyn VaultCodec>) -> Self {
        Self { file, codec }
    }

    /// Re-encrypt `snapshot` under a fresh salt and whatever key `file` resolves.
    pub fn rekey(&self, file: SealedFile, snapshot: &VaultSnapshot) -> Result<EncryptedStorage> {
        let plain = self.codec.encode(snapshot)?;
        file.write_fresh(&plain)?;
        Ok(EncryptedStorage {
            file,
            codec: self.codec.clone(),
        })
    }
}

impl StorageBackend for EncryptedStorage {
    fn save(&self, snapshot: &VaultSnapshot) -> Result<()> {
        let plain = self.codec.encode(snapshot)?;
        self.file.write_plain(&plain)?;
        tracing::debug!(entries = snapshot.entries.len(), "vault snapshot saved");
        Ok(())
    }

    fn load(&self) -> Result<Option<VaultSnapshot>> {
        match self.file.read_plain()? {
            Some(plain) => Ok(Some(self.codec.decode(&plain)?)),
            None => Ok(None),
        }
    }
}

/// Unencrypted in-process backend. Keeps the last saved snapshot; can be
/// told to fail the next saves with a given I/O error kind.
#[derive(Default)]
pub struct MemoryStorage {
    saved: Mutex<Option<VaultSnapshot>>,
    saves: AtomicUsize,
    failure: Mutex<Option<io::ErrorKind>>,
}

impl MemoryStorage {
    pub fn with_snapshot(snapshot: VaultSnapshot) -> Self {
        let storage = Self::default();
        *storage.saved.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
        storage
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn last_saved(&self) -> Option<VaultSnapshot> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make every following save fail with `kind` (`None` restores saving).
    pub fn fail_saves(&self, kind: Option<io::ErrorKind>) {
        *self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = kind;
    }
}

impl StorageBackend for MemoryStorage {
    fn save(&self, snapshot: &VaultSnapshot) -> Result<()> {
        let failure = *self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(kind) = failure {
            return Err(anyhow::Error::new(io::Error::new(kind, "simulated save failure")))
                .context("Failed to write vault");
        }
        *self
            .saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self) -> Result<Option<VaultSnapshot>> {
        Ok(self.last_saved())
    }
}
