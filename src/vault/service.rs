//! The vault as seen from the presentation layer.
//!
//! A `Vault` starts locked. A successful `verify` derives the storage key
//! from the master password, opens the entry store and starts the sync
//! worker. Every entry operation before that fails with `Locked`.

use crate::config::app_config::Config;
use crate::cryptography::keys::PassphraseKeyResolver;
use crate::cryptography::primitives::KdfParams;
use crate::cryptography::verifier::{Argon2Verifier, CredentialVerifier, LockoutVerifier};
use crate::error::{VaultError, VaultResult};
use crate::filesystem::clipboard::{
    ClipboardEngine, ClipboardPolicy, ExposureHandle, NoClipboard, SystemClipboardEngine,
};
use crate::filesystem::credentials::FileCredentialStore;
use crate::filesystem::remote::FileRemoteConnector;
use crate::filesystem::store::FileByteStore;
use crate::sync::engine::{SyncEngine, SyncReport};
use crate::sync::remote::RemoteConnector;
use crate::sync::worker::{SyncHandle, SyncStatus, WorkerConfig};
use crate::vault::codec::RonCodec;
use crate::vault::events::VaultEvent;
use crate::vault::models::{EntryField, EntryId, EntryPatch, PasswordEntry, StoredEntry};
use crate::vault::persistence::{EncryptedStorage, SealedFile};
use crate::vault::ports::{ByteStore, CredentialStore, StorageBackend};
use crate::vault::store::{EntryStore, SortKey, StoreOptions};
use secrecy::{ExposeSecret, SecretString};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct VaultSettings {
    pub kdf: KdfParams,
    pub store: StoreOptions,
    pub worker: WorkerConfig,
    pub network_timeout: Duration,
    pub clipboard_ttl: Duration,
    pub username_is_secret: bool,
    /// Consecutive failed verifications before a cooldown; 0 disables lockout.
    pub max_failures: u32,
    pub lockout: Duration,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            store: StoreOptions::default(),
            worker: WorkerConfig::default(),
            network_timeout: Duration::from_secs(10),
            clipboard_ttl: Duration::from_secs(30),
            username_is_secret: false,
            max_failures: 5,
            lockout: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for VaultSettings {
    fn from(config: &Config) -> Self {
        Self {
            kdf: config.kdf,
            store: config.store_options(),
            worker: config.worker_config(),
            network_timeout: config.network_timeout(),
            clipboard_ttl: config.clipboard_ttl(),
            username_is_secret: config.username_is_secret,
            ..Self::default()
        }
    }
}

/// Collaborators a vault is assembled from.
pub struct VaultParts {
    pub credentials: Arc<dyn CredentialStore>,
    pub vault_bytes: Arc<dyn ByteStore>,
    pub clipboard: Arc<dyn ClipboardEngine>,
    pub remote: Option<Arc<dyn RemoteConnector>>,
}

#[derive(Clone)]
struct Session {
    username: String,
    master: SecretString,
    store: Arc<EntryStore>,
    storage: Arc<EncryptedStorage>,
    sync: Option<SyncHandle>,
}

pub struct Vault {
    credentials: Arc<dyn CredentialStore>,
    verifier: Box<dyn CredentialVerifier>,
    vault_bytes: Arc<dyn ByteStore>,
    remote: Option<Arc<dyn RemoteConnector>>,
    clipboard: ClipboardPolicy,
    settings: VaultSettings,
    events: broadcast::Sender<VaultEvent>,
    session: Mutex<Option<Session>>,
}

impl Vault {
    /// Must be called inside a tokio runtime (the clipboard timer is a task).
    pub fn new(parts: VaultParts, settings: VaultSettings) -> Self {
        let base = Argon2Verifier::new(parts.credentials.clone(), settings.kdf);
        let verifier: Box<dyn CredentialVerifier> = if settings.max_failures > 0 {
            Box::new(LockoutVerifier::new(
                base,
                settings.max_failures,
                settings.lockout,
            ))
        } else {
            Box::new(base)
        };
        let (events, _) = broadcast::channel(64);
        Self {
            credentials: parts.credentials,
            verifier,
            vault_bytes: parts.vault_bytes,
            remote: parts.remote,
            clipboard: ClipboardPolicy::new(parts.clipboard, settings.clipboard_ttl),
            settings,
            events,
            session: Mutex::new(None),
        }
    }

    /// Wire the file-backed collaborators named by `config`.
    pub fn from_config(config: &Config) -> Self {
        Self::from_config_with(config, VaultSettings::from(config))
    }

    pub fn from_config_with(config: &Config, settings: VaultSettings) -> Self {
        let clipboard: Arc<dyn ClipboardEngine> = match SystemClipboardEngine::new() {
            Ok(engine) => Arc::new(engine),
            Err(e) => {
                tracing::debug!(error = %e, "system clipboard unavailable");
                Arc::new(NoClipboard::new(format!("{e:#}")))
            }
        };
        let remote = config.remote_path.as_ref().map(|path| {
            Arc::new(FileRemoteConnector::new(path.clone(), config.kdf)) as Arc<dyn RemoteConnector>
        });
        let parts = VaultParts {
            credentials: Arc::new(FileCredentialStore::for_vault(&config.vault_path)),
            vault_bytes: Arc::new(FileByteStore::new(
                config.vault_path.clone(),
                config.backups,
            )),
            clipboard,
            remote,
        };
        Self::new(parts, settings)
    }

    pub fn settings(&self) -> &VaultSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: VaultEvent) {
        let _ = self.events.send(event);
    }

    pub fn has_credential(&self) -> VaultResult<bool> {
        Ok(self
            .credentials
            .load()
            .map_err(VaultError::from_storage)?
            .is_some())
    }

    pub fn supports_lockout(&self) -> bool {
        self.verifier.supports_lockout()
    }

    /// First-time setup: store the master credential and seal an empty vault.
    pub fn initialize(&self, username: &str, password: SecretString) -> VaultResult<()> {
        if password.expose_secret().trim().is_empty() {
            return Err(VaultError::ValidationFailure(
                "master password must not be blank".into(),
            ));
        }
        if self.has_credential()? {
            return Err(VaultError::ValidationFailure(
                "a master credential is already set".into(),
            ));
        }
        let existing = self.vault_bytes.read().map_err(VaultError::from_storage)?;
        if !existing.is_empty() {
            return Err(VaultError::ValidationFailure(
                "a vault already exists at this location".into(),
            ));
        }
        let storage = self.storage_for(&password);
        storage
            .save(&Default::default())
            .map_err(VaultError::from_storage)?;
        self.verifier.set_credential(username, password)?;
        tracing::info!("vault initialized");
        Ok(())
    }

    fn storage_for(&self, master: &SecretString) -> EncryptedStorage {
        EncryptedStorage::new(self.sealed_file(master), Arc::new(RonCodec))
    }

    fn spawn_sync(&self, store: &Arc<EntryStore>, master: &SecretString) -> VaultResult<Option<SyncHandle>> {
        let Some(connector) = &self.remote else {
            return Ok(None);
        };
        let remote = connector
            .connect(master)
            .map_err(|e| VaultError::NetworkFailure(format!("{e:#}")))?;
        let engine = SyncEngine::new(store.clone(), remote, self.settings.network_timeout);
        Ok(Some(SyncHandle::spawn(
            engine,
            self.settings.worker.clone(),
            Some(self.events.clone()),
        )))
    }

    /// Check the master credential and, when accepted, unlock the vault.
    /// Wrong credentials answer `Ok(false)`, never an error.
    pub fn verify(&self, username: &str, password: SecretString) -> VaultResult<bool> {
        let accepted = self.verifier.verify(username, &password)?;
        self.emit(VaultEvent::Verification { accepted });
        if !accepted {
            return Ok(false);
        }
        if self.is_unlocked() {
            return Ok(true);
        }
        let storage = Arc::new(self.storage_for(&password));
        let store = Arc::new(EntryStore::open(storage.clone(), self.settings.store)?);
        let sync = self.spawn_sync(&store, &password)?;
        *self.lock_session() = Some(Session {
            username: username.to_string(),
            master: password,
            store,
            storage,
            sync,
        });
        self.emit(VaultEvent::EntriesChanged);
        tracing::info!("vault unlocked");
        Ok(true)
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> VaultResult<Session> {
        self.lock_session().clone().ok_or(VaultError::Locked)
    }

    fn store(&self) -> VaultResult<Arc<EntryStore>> {
        Ok(self.session()?.store)
    }

    pub fn is_unlocked(&self) -> bool {
        self.lock_session().is_some()
    }

    /// Stop syncing, write pending changes, clear a pending clipboard secret
    /// and forget the session.
    pub async fn lock(&self) -> VaultResult<()> {
        let Some(session) = self.lock_session().take() else {
            return Ok(());
        };
        if let Some(sync) = &session.sync {
            sync.shutdown().await;
        }
        if let Err(e) = self.clipboard.shutdown() {
            tracing::warn!(error = %e, "could not clear clipboard");
        }
        session.store.flush()?;
        tracing::info!("vault locked");
        Ok(())
    }

    pub fn list_entries(&self) -> VaultResult<Vec<(EntryId, PasswordEntry)>> {
        Ok(self.store()?.list())
    }

    pub fn list_sorted(&self, key: SortKey) -> VaultResult<Vec<(EntryId, PasswordEntry)>> {
        Ok(self.store()?.list_sorted(key))
    }

    pub fn get_entry(&self, id: EntryId) -> VaultResult<PasswordEntry> {
        self.store()?.get(id)
    }

    pub fn get_stored(&self, id: EntryId) -> VaultResult<StoredEntry> {
        self.store()?.get_stored(id)
    }

    pub fn search(&self, query: &str) -> VaultResult<Vec<(EntryId, PasswordEntry)>> {
        Ok(self.store()?.search(query))
    }

    pub fn conflicts(&self) -> VaultResult<Vec<StoredEntry>> {
        Ok(self.store()?.conflicts())
    }

    pub fn add_entry(&self, entry: PasswordEntry) -> VaultResult<EntryId> {
        let id = self.store()?.add(entry)?;
        self.emit(VaultEvent::EntriesChanged);
        Ok(id)
    }

    pub fn update_entry(&self, id: EntryId, patch: EntryPatch) -> VaultResult<()> {
        if patch.is_empty() {
            return Err(VaultError::ValidationFailure("nothing to update".into()));
        }
        self.store()?.update(id, |entry| patch.apply(entry))?;
        self.emit(VaultEvent::EntriesChanged);
        Ok(())
    }

    pub fn delete_entry(&self, id: EntryId) -> VaultResult<PasswordEntry> {
        let removed = self.store()?.remove(id)?;
        self.emit(VaultEvent::EntriesChanged);
        Ok(removed)
    }

    /// Put one field of an entry on the clipboard. Passwords (and usernames
    /// when configured as secret) are cleared after `ttl`.
    pub fn copy_field(
        &self,
        id: EntryId,
        field: EntryField,
        ttl: Option<Duration>,
    ) -> VaultResult<ExposureHandle> {
        let entry = self.store()?.get(id)?;
        let exposed = match field {
            EntryField::Label => self.clipboard.expose_non_secret(&entry.label),
            EntryField::Username if !self.settings.username_is_secret => self
                .clipboard
                .expose_non_secret(entry.username.expose_secret()),
            EntryField::Username => self.clipboard.expose_secret(&entry.username, ttl),
            EntryField::Password => self.clipboard.expose_secret(&entry.password, ttl),
        };
        exposed.map_err(|e| VaultError::Clipboard(format!("{e:#}")))
    }

    pub fn clipboard(&self) -> &ClipboardPolicy {
        &self.clipboard
    }

    pub fn sync_enabled(&self) -> bool {
        self.remote.is_some()
    }

    /// Queue a background sync. `false` when no remote is configured.
    pub fn trigger_sync(&self) -> VaultResult<bool> {
        match self.session()?.sync {
            Some(sync) => {
                sync.trigger();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn sync_now(&self) -> VaultResult<SyncReport> {
        let sync = self.session()?.sync.ok_or_else(|| {
            VaultError::NetworkFailure("no remote is configured".into())
        })?;
        sync.sync_now().await
    }

    pub fn sync_status(&self) -> VaultResult<Option<SyncStatus>> {
        Ok(self.session()?.sync.map(|s| s.status()))
    }

    /// Replace the master credential and re-seal the vault (and remote)
    /// under the new password with a fresh salt.
    ///
    /// The remote is re-keyed first, then the vault file, then the
    /// credential. When a step fails the earlier ones are undone, so the
    /// current password keeps opening everything, and syncing resumes.
    pub async fn change_credential(
        &self,
        current: &SecretString,
        new_username: &str,
        new_password: SecretString,
    ) -> VaultResult<()> {
        let session = self.session()?;
        if new_password.expose_secret().trim().is_empty() {
            return Err(VaultError::ValidationFailure(
                "master password must not be blank".into(),
            ));
        }
        if !self.verifier.verify(&session.username, current)? {
            return Err(VaultError::ValidationFailure(
                "current master password is incorrect".into(),
            ));
        }

        if let Some(sync) = &session.sync {
            sync.shutdown().await;
        }
        let committed = session
            .store
            .flush()
            .and_then(|()| self.reseal(&session, new_username, &new_password));
        match committed {
            Ok(storage) => {
                session.store.replace_backend(storage.clone());
                tracing::info!("master credential changed");
                self.resume(session.store, new_username.to_string(), new_password, storage)
            }
            Err(e) => {
                tracing::warn!(error = %e, "master credential unchanged");
                let Session {
                    username,
                    master,
                    store,
                    storage,
                    ..
                } = session;
                if let Err(restart) = self.resume(store, username, master, storage) {
                    tracing::warn!(error = %restart, "sync not restarted");
                }
                Err(e)
            }
        }
    }

    fn sealed_file(&self, master: &SecretString) -> SealedFile {
        let keys = Arc::new(PassphraseKeyResolver::new(master.clone()));
        SealedFile::new(self.vault_bytes.clone(), keys, self.settings.kdf)
    }

    /// Re-key remote, vault file and credential, undoing earlier steps on failure.
    fn reseal(
        &self,
        session: &Session,
        new_username: &str,
        new_password: &SecretString,
    ) -> VaultResult<Arc<EncryptedStorage>> {
        if let Some(connector) = &self.remote {
            connector
                .rekey(&session.master, new_password)
                .map_err(|e| VaultError::NetworkFailure(format!("{e:#}")))?;
        }

        let snapshot = session.store.snapshot();
        let storage = match session
            .storage
            .rekey(self.sealed_file(new_password), &snapshot)
        {
            Ok(storage) => Arc::new(storage),
            Err(e) => {
                self.restore_remote(&session.master, new_password);
                return Err(VaultError::from_storage(e));
            }
        };

        if let Err(e) = self
            .verifier
            .set_credential(new_username, new_password.clone())
        {
            if let Err(undo) = storage.rekey(self.sealed_file(&session.master), &snapshot) {
                tracing::error!(error = %undo, "could not re-seal vault under the current password");
            }
            self.restore_remote(&session.master, new_password);
            return Err(e);
        }
        Ok(storage)
    }

    fn restore_remote(&self, current: &SecretString, attempted: &SecretString) {
        if let Some(connector) = &self.remote {
            if let Err(e) = connector.rekey(attempted, current) {
                tracing::error!(error = %e, "could not restore remote key");
            }
        }
    }

    /// Install the session and restart its sync worker.
    fn resume(
        &self,
        store: Arc<EntryStore>,
        username: String,
        master: SecretString,
        storage: Arc<EncryptedStorage>,
    ) -> VaultResult<()> {
        let spawned = self.spawn_sync(&store, &master);
        let (sync, outcome) = match spawned {
            Ok(sync) => (sync, Ok(())),
            Err(e) => (None, Err(e)),
        };
        *self.lock_session() = Some(Session {
            username,
            master,
            store,
            storage,
            sync,
        });
        outcome
    }
}

impl Drop for Vault {
    fn drop(&mut self) {
        if let Some(session) = self.lock_session().take() {
            if let Some(sync) = &session.sync {
                sync.cancel();
            }
            if let Err(e) = session.store.flush() {
                tracing::warn!(error = %e, "could not flush vault on drop");
            }
        }
    }
}
