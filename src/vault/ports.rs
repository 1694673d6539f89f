use anyhow::Result;
use secrecy::SecretBox;

use crate::cryptography::primitives::{ContainerHeader, KdfParams, SALT_LEN};
use crate::cryptography::verifier::VaultCredential;
use crate::vault::models::VaultSnapshot;

pub trait VaultCodec: Send + Sync {
    fn encode(&self, snapshot: &VaultSnapshot) -> Result<Vec<u8>>;
    fn decode(&self, data: &[u8]) -> Result<VaultSnapshot>;
}

pub trait ByteStore: Send + Sync {
    /// Empty when nothing has been written yet.
    fn read(&self) -> Result<Vec<u8>>;
    fn write(&self, bytes: &[u8]) -> Result<()>;
}

/// Durable home of the vault snapshot. Implementations encrypt at rest.
pub trait StorageBackend: Send + Sync {
    fn save(&self, snapshot: &VaultSnapshot) -> Result<()>;
    fn load(&self) -> Result<Option<VaultSnapshot>>;
}

pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Option<VaultCredential>>;
    fn save(&self, credential: &VaultCredential) -> Result<()>;
}

pub struct DerivedKey {
    pub key: SecretBox<Vec<u8>>, // 32 bytes expected
}

impl core::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("key", &"<REDACTED>")
            .finish()
    }
}

pub trait KeyResolver: Send + Sync {
    /// Key for an existing container, bound to its costs and salt.
    fn resolve_for_header(&self, hdr: &ContainerHeader) -> Result<DerivedKey>;
    /// Key for a container about to be created with `params` and `salt`.
    fn resolve_for_new(&self, params: KdfParams, salt: [u8; SALT_LEN]) -> Result<DerivedKey>;
}
