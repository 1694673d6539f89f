use crate::cryptography::verifier::VaultCredential;
use crate::error::VaultError;
use crate::filesystem::secure::atomic_write_secure;
use crate::vault::ports::CredentialStore;
use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// `<vault>.cred`
pub fn credential_path(vault_path: &Path) -> PathBuf {
    let mut name = vault_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".cred");
    vault_path.with_file_name(name)
}

/// Master credential record as RON next to the vault.
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn for_vault(vault_path: &Path) -> Self {
        Self::new(credential_path(vault_path))
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<VaultCredential>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };
        let credential = ron::from_str(&text).map_err(|e| {
            VaultError::CorruptCredentialStore(format!("{}: {e}", self.path.display()))
        })?;
        Ok(Some(credential))
    }

    fn save(&self, credential: &VaultCredential) -> Result<()> {
        let text = ron::ser::to_string_pretty(credential, ron::ser::PrettyConfig::default())
            .context("Failed to encode credential")?;
        atomic_write_secure(&self.path, text.as_bytes())
    }
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    credential: Mutex<Option<VaultCredential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<VaultCredential>> {
        Ok(self
            .credential
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, credential: &VaultCredential) -> Result<()> {
        *self
            .credential
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(credential.clone());
        Ok(())
    }
}
