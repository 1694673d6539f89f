use crate::filesystem::secure::write_with_backups;
use crate::vault::ports::ByteStore;
use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Vault bytes on disk, written atomically with rotating backups.
pub struct FileByteStore {
    path: PathBuf,
    backups: usize,
}

impl FileByteStore {
    pub fn new(path: PathBuf, backups: usize) -> Self {
        Self { path, backups }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteStore for FileByteStore {
    fn read(&self) -> Result<Vec<u8>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        }
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        write_with_backups(&self.path, bytes, self.backups)
    }
}

/// Process-local byte store.
#[derive(Default)]
pub struct MemoryByteStore {
    bytes: Mutex<Vec<u8>>,
}

impl MemoryByteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ByteStore for MemoryByteStore {
    fn read(&self) -> Result<Vec<u8>> {
        Ok(self.contents())
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        *self.bytes.lock().unwrap_or_else(PoisonError::into_inner) = bytes.to_vec();
        Ok(())
    }
}
