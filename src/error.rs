//! Vault error taxonomy.
//!
//! Every operation reachable from the UI boundary returns one of these.
//! Local-store errors are recoverable by the caller; none of them abort
//! the process.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VaultError {
    /// The entry id is not present in the store.
    #[error("entry {0} not found")]
    NotFound(Uuid),

    /// The store (or the medium behind it) cannot take another entry.
    #[error("vault storage is full")]
    StorageFull,

    /// The persisted master credential cannot be interpreted.
    #[error("credential store is corrupted: {0}")]
    CorruptCredentialStore(String),

    /// Local and remote both changed the same entry since it was last synced.
    /// A sync pass resolves these itself and lists them in its report; this is
    /// the per-entry form for callers that surface them as errors.
    #[error("sync conflict on entry {0}")]
    Conflict(Uuid),

    /// The remote collaborator failed or timed out.
    #[error("network failure: {0}")]
    NetworkFailure(String),

    /// A mutation was rejected before it committed.
    #[error("validation failed: {0}")]
    ValidationFailure(String),

    /// The operation requires a verified session.
    #[error("vault is locked")]
    Locked,

    /// Reading or writing the persisted vault failed.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("clipboard unavailable: {0}")]
    Clipboard(String),
}

impl VaultError {
    /// Fatal errors are surfaced and never retried automatically.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VaultError::StorageFull | VaultError::CorruptCredentialStore(_)
        )
    }

    /// Map an adapter error into the taxonomy, keeping `StorageFull` distinct.
    pub fn from_storage(err: anyhow::Error) -> Self {
        if let Some(own) = err.chain().find_map(|c| c.downcast_ref::<VaultError>()) {
            return own.clone();
        }
        let full = err.chain().any(|cause| {
            cause
                .downcast_ref::<std::io::Error>()
                .is_some_and(|io| io.kind() == std::io::ErrorKind::StorageFull)
        });
        if full {
            VaultError::StorageFull
        } else {
            VaultError::Storage(format!("{err:#}"))
        }
    }
}

pub type VaultResult<T> = std::result::Result<T, VaultError>;
