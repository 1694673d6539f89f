//! The entry store: canonical in-memory index of the vault.
//!
//! All state sits behind one mutex. Every mutation runs as a transaction
//! against a [`Ledger`]: on success the snapshot is handed to the storage
//! backend (immediately or every N mutations), on a persistence failure the
//! ledger is rolled back to its pre-mutation state.

use crate::error::{VaultError, VaultResult};
use crate::vault::models::{
    EntryId, PasswordEntry, Revision, StoredEntry, SyncState, VaultSnapshot,
};
use crate::vault::ports::StorageBackend;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// When the store hands snapshots to the storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistMode {
    /// Save after every mutation.
    Immediate,
    /// Save once this many mutations have accumulated (and on `flush`).
    Batched(usize),
}

impl PersistMode {
    pub fn from_batch(batch: usize) -> Self {
        if batch <= 1 {
            PersistMode::Immediate
        } else {
            PersistMode::Batched(batch)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    pub persist: PersistMode,
    /// Upper bound on live entries; `add` past it is `StorageFull`.
    pub max_entries: Option<usize>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            persist: PersistMode::Immediate,
            max_entries: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Insertion,
    Label,
}

/// Mutable vault state, only reachable inside a store transaction.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    pub(crate) entries: Vec<StoredEntry>,
    pub(crate) sync: SyncState,
    pub(crate) clock: Revision,
}

impl Ledger {
    fn from_snapshot(snapshot: VaultSnapshot) -> Self {
        let clock = snapshot
            .entries
            .iter()
            .map(|e| e.revision)
            .chain(std::iter::once(snapshot.sync.high_water()))
            .max()
            .unwrap_or_default();
        Self {
            entries: snapshot.entries,
            sync: snapshot.sync,
            clock,
        }
    }

    fn snapshot(&self) -> VaultSnapshot {
        VaultSnapshot {
            entries: self.entries.clone(),
            sync: self.sync.clone(),
        }
    }

    pub(crate) fn position(&self, id: &EntryId) -> Option<usize> {
        self.entries.iter().position(|e| &e.id == id)
    }

    pub(crate) fn find(&self, id: &EntryId) -> Option<&StoredEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }

    pub(crate) fn find_mut(&mut self, id: &EntryId) -> Option<&mut StoredEntry> {
        self.entries.iter_mut().find(|e| &e.id == id)
    }

    /// Next local revision.
    pub(crate) fn tick(&mut self) -> Revision {
        self.clock = self.clock.next();
        self.clock
    }

    /// Keep the local clock ahead of every revision seen from the remote.
    pub(crate) fn observe(&mut self, revision: Revision) {
        if revision > self.clock {
            self.clock = revision;
        }
    }

    /// Insert a new locally-owned entry and mark it dirty.
    pub(crate) fn insert_local(
        &mut self,
        entry: PasswordEntry,
        conflict_of: Option<EntryId>,
    ) -> EntryId {
        let id = Uuid::new_v4();
        let revision = self.tick();
        self.entries.push(StoredEntry {
            id,
            entry,
            revision,
            conflict_of,
        });
        self.sync.mark_dirty(id);
        id
    }

    /// Overwrite (or create) an entry with remote content at `revision`.
    pub(crate) fn put_remote(&mut self, id: EntryId, entry: PasswordEntry, revision: Revision) {
        self.observe(revision);
        match self.find_mut(&id) {
            Some(stored) => {
                stored.entry = entry;
                stored.revision = revision;
            }
            None => self.entries.push(StoredEntry {
                id,
                entry,
                revision,
                conflict_of: None,
            }),
        }
    }

    pub(crate) fn drop_entry(&mut self, id: &EntryId) -> Option<StoredEntry> {
        self.position(id).map(|pos| self.entries.remove(pos))
    }
}

pub struct EntryStore {
    ledger: Mutex<Ledger>,
    backend: Mutex<Arc<dyn StorageBackend>>,
    options: StoreOptions,
    unsaved: Mutex<usize>,
}

impl EntryStore {
    /// Load the persisted snapshot (an absent one means an empty vault).
    pub fn open(backend: Arc<dyn StorageBackend>, options: StoreOptions) -> VaultResult<Self> {
        let snapshot = backend
            .load()
            .map_err(VaultError::from_storage)?
            .unwrap_or_default();
        tracing::debug!(
            entries = snapshot.entries.len(),
            pending = snapshot.sync.pending_local_changes.len(),
            "entry store opened"
        );
        Ok(Self {
            ledger: Mutex::new(Ledger::from_snapshot(snapshot)),
            backend: Mutex::new(backend),
            options,
            unsaved: Mutex::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` as one atomic mutation. The ledger is restored if `f` fails
    /// or the resulting snapshot cannot be persisted.
    pub(crate) fn transact<T>(
        &self,
        f: impl FnOnce(&mut Ledger) -> VaultResult<T>,
    ) -> VaultResult<T> {
        let mut ledger = self.lock();
        let before = ledger.clone();
        let out = match f(&mut ledger) {
            Ok(out) => out,
            Err(e) => {
                *ledger = before;
                return Err(e);
            }
        };
        if let Err(e) = self.persist(&ledger) {
            tracing::warn!(error = %e, "persisting vault failed; mutation rolled back");
            *ledger = before;
            return Err(e);
        }
        Ok(out)
    }

    fn persist(&self, ledger: &Ledger) -> VaultResult<()> {
        let mut unsaved = self.unsaved.lock().unwrap_or_else(PoisonError::into_inner);
        *unsaved += 1;
        let due = match self.options.persist {
            PersistMode::Immediate => true,
            PersistMode::Batched(n) => *unsaved >= n,
        };
        if !due {
            return Ok(());
        }
        let backend = self
            .backend
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match backend.save(&ledger.snapshot()) {
            Ok(()) => {
                *unsaved = 0;
                Ok(())
            }
            Err(e) => {
                *unsaved -= 1;
                Err(VaultError::from_storage(e))
            }
        }
    }

    /// Read the ledger under the lock without mutating it.
    pub(crate) fn inspect<T>(&self, f: impl FnOnce(&Ledger) -> T) -> T {
        f(&self.lock())
    }

    /// Write any batched mutations now.
    pub fn flush(&self) -> VaultResult<()> {
        let ledger = self.lock();
        let mut unsaved = self.unsaved.lock().unwrap_or_else(PoisonError::into_inner);
        if *unsaved == 0 {
            return Ok(());
        }
        let backend = self
            .backend
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        backend
            .save(&ledger.snapshot())
            .map_err(VaultError::from_storage)?;
        *unsaved = 0;
        Ok(())
    }

    /// Point the store at a different backend (after re-keying it).
    pub fn replace_backend(&self, backend: Arc<dyn StorageBackend>) {
        let _ledger = self.lock();
        *self.backend.lock().unwrap_or_else(PoisonError::into_inner) = backend;
    }

    pub fn snapshot(&self) -> VaultSnapshot {
        self.lock().snapshot()
    }

    pub fn add(&self, entry: PasswordEntry) -> VaultResult<EntryId> {
        let max = self.options.max_entries;
        let id = self.transact(|ledger| {
            if max.is_some_and(|max| ledger.entries.len() >= max) {
                return Err(VaultError::StorageFull);
            }
            Ok(ledger.insert_local(entry, None))
        })?;
        tracing::debug!(%id, "entry added");
        Ok(id)
    }

    pub fn update(
        &self,
        id: EntryId,
        mutator: impl FnOnce(&mut PasswordEntry),
    ) -> VaultResult<()> {
        self.transact(|ledger| {
            let revision = ledger.tick();
            let stored = ledger.find_mut(&id).ok_or(VaultError::NotFound(id))?;
            mutator(&mut stored.entry);
            stored.revision = revision;
            ledger.sync.mark_dirty(id);
            Ok(())
        })?;
        tracing::debug!(%id, "entry updated");
        Ok(())
    }

    /// Delete an entry and leave a tombstone for the next sync.
    pub fn remove(&self, id: EntryId) -> VaultResult<PasswordEntry> {
        let removed = self.transact(|ledger| {
            let stored = ledger.drop_entry(&id).ok_or(VaultError::NotFound(id))?;
            let revision = ledger.tick();
            ledger.sync.record_tombstone(id, revision);
            Ok(stored.entry)
        })?;
        tracing::debug!(%id, "entry removed");
        Ok(removed)
    }

    pub fn get(&self, id: EntryId) -> VaultResult<PasswordEntry> {
        self.lock()
            .find(&id)
            .map(|e| e.entry.clone())
            .ok_or(VaultError::NotFound(id))
    }

    pub fn get_stored(&self, id: EntryId) -> VaultResult<StoredEntry> {
        self.lock()
            .find(&id)
            .cloned()
            .ok_or(VaultError::NotFound(id))
    }

    /// Entries in insertion order.
    pub fn list(&self) -> Vec<(EntryId, PasswordEntry)> {
        self.list_sorted(SortKey::Insertion)
    }

    pub fn list_sorted(&self, key: SortKey) -> Vec<(EntryId, PasswordEntry)> {
        let mut out: Vec<(EntryId, PasswordEntry)> = self
            .lock()
            .entries
            .iter()
            .map(|e| (e.id, e.entry.clone()))
            .collect();
        if key == SortKey::Label {
            // Stable: equal labels keep insertion order.
            out.sort_by_key(|(_, e)| e.label.to_lowercase());
        }
        out
    }

    pub fn search(&self, query: &str) -> Vec<(EntryId, PasswordEntry)> {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.entry.matches(query))
            .map(|e| (e.id, e.entry.clone()))
            .collect()
    }

    /// Copies kept from the losing side of sync conflicts.
    pub fn conflicts(&self) -> Vec<StoredEntry> {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.conflict_of.is_some())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dirty(&self, id: &EntryId) -> bool {
        self.lock().sync.is_dirty(id)
    }

    /// Read-only copy of the sync bookkeeping.
    pub fn sync_state(&self) -> SyncState {
        self.lock().sync.clone()
    }
}
