//! Remote store kept in a sealed file, typically in a folder shared
//! between machines. Revisions are a counter stored in the file itself.

use crate::cryptography::keys::PassphraseKeyResolver;
use crate::cryptography::primitives::KdfParams;
use crate::filesystem::store::FileByteStore;
use crate::sync::remote::{PushOutcome, PushRequest, RemoteConnector, RemoteLog, RemoteRecord, RemoteSync};
use crate::vault::models::Revision;
use crate::vault::persistence::SealedFile;
use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::SecretString;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

struct RemoteFile {
    file: SealedFile,
    // Serializes read-modify-write cycles from this process.
    gate: Mutex<()>,
}

impl RemoteFile {
    fn load(&self) -> Result<RemoteLog> {
        match self.file.read_plain()? {
            Some(plain) => {
                let text = std::str::from_utf8(&plain).context("remote log is not UTF-8")?;
                ron::from_str(text).context("Failed to decode remote log")
            }
            None => Ok(RemoteLog::default()),
        }
    }

    fn store(&self, log: &RemoteLog) -> Result<()> {
        let text = ron::to_string(log).context("Failed to encode remote log")?;
        self.file.write_plain(text.as_bytes())
    }

    fn pull(&self, since: Revision) -> Result<Vec<RemoteRecord>> {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.pull(since))
    }

    fn push(&self, request: PushRequest) -> Result<PushOutcome> {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        let mut log = self.load()?;
        let outcome = log.push(request);
        if matches!(outcome, PushOutcome::Accepted(_)) {
            self.store(&log)?;
        }
        Ok(outcome)
    }
}

pub struct FileRemote {
    inner: Arc<RemoteFile>,
}

impl FileRemote {
    pub fn new(path: PathBuf, master: SecretString, params: KdfParams) -> Self {
        let bytes = Arc::new(FileByteStore::new(path, 0));
        let keys = Arc::new(PassphraseKeyResolver::new(master));
        Self {
            inner: Arc::new(RemoteFile {
                file: SealedFile::new(bytes, keys, params),
                gate: Mutex::new(()),
            }),
        }
    }
}

#[async_trait]
impl RemoteSync for FileRemote {
    async fn pull(&self, since: Revision) -> Result<Vec<RemoteRecord>> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.pull(since))
            .await
            .context("remote pull task failed")?
    }

    async fn push(&self, request: PushRequest) -> Result<PushOutcome> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.push(request))
            .await
            .context("remote push task failed")?
    }
}

/// Opens a [`FileRemote`] at a fixed path with the session's master password.
pub struct FileRemoteConnector {
    path: PathBuf,
    params: KdfParams,
}

impl FileRemoteConnector {
    pub fn new(path: PathBuf, params: KdfParams) -> Self {
        Self { path, params }
    }
}

impl RemoteConnector for FileRemoteConnector {
    fn connect(&self, master: &SecretString) -> Result<Arc<dyn RemoteSync>> {
        Ok(Arc::new(FileRemote::new(
            self.path.clone(),
            master.clone(),
            self.params,
        )))
    }

    fn rekey(&self, old: &SecretString, new: &SecretString) -> Result<()> {
        let old_file = SealedFile::new(
            Arc::new(FileByteStore::new(self.path.clone(), 0)),
            Arc::new(PassphraseKeyResolver::new(old.clone())),
            self.params,
        );
        let Some(plain) = old_file.read_plain()? else {
            return Ok(());
        };
        let new_file = SealedFile::new(
            Arc::new(FileByteStore::new(self.path.clone(), 0)),
            Arc::new(PassphraseKeyResolver::new(new.clone())),
            self.params,
        );
        new_file.write_fresh(&plain)?;
        tracing::info!(path = %self.path.display(), "remote re-keyed");
        Ok(())
    }
}
