use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Stable entry identifier. Labels are not unique, ids are.
pub type EntryId = Uuid;

/// Monotonic change marker shared by local edits and remote acknowledgements.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Revision(pub u64);

impl Revision {
    pub fn next(self) -> Revision {
        Revision(self.0.saturating_add(1))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordEntry {
    pub label: String,
    #[serde(with = "crate::cryptography::types::secret_string")]
    pub username: SecretString,
    #[serde(with = "crate::cryptography::types::secret_string")]
    pub password: SecretString,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl PasswordEntry {
    pub fn new(label: impl Into<String>, username: &str, password: &str) -> Self {
        Self {
            label: label.into(),
            username: SecretString::from(username.to_string()),
            password: SecretString::from(password.to_string()),
            tags: Vec::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// An entry can only be marked synced once it carries a non-blank password.
    pub fn has_password(&self) -> bool {
        !self.password.expose_secret().trim().is_empty()
    }

    /// Case-insensitive match on the label or any tag.
    pub fn matches(&self, query: &str) -> bool {
        let q = query.to_lowercase();
        self.label.to_lowercase().contains(&q)
            || self.tags.iter().any(|t| t.to_lowercase().contains(&q))
    }
}

impl PartialEq for PasswordEntry {
    fn eq(&self, other: &Self) -> bool {
        self.label == other.label
            && self.username.expose_secret() == other.username.expose_secret()
            && self.password.expose_secret() == other.password.expose_secret()
            && self.tags == other.tags
    }
}

impl Eq for PasswordEntry {}

/// Field-level edit forwarded from the UI. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
    pub label: Option<String>,
    pub username: Option<SecretString>,
    pub password: Option<SecretString>,
    pub tags: Option<Vec<String>>,
}

impl EntryPatch {
    pub fn is_empty(&self) -> bool {
        self.label.is_none()
            && self.username.is_none()
            && self.password.is_none()
            && self.tags.is_none()
    }

    pub fn apply(self, entry: &mut PasswordEntry) {
        if let Some(label) = self.label {
            entry.label = label;
        }
        if let Some(username) = self.username {
            entry.username = username;
        }
        if let Some(password) = self.password {
            entry.password = password;
        }
        if let Some(tags) = self.tags {
            entry.tags = tags;
        }
    }
}

/// Which field of an entry a copy intent targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryField {
    Label,
    Username,
    Password,
}

/// An entry as the store owns it: content plus bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub id: EntryId,
    pub entry: PasswordEntry,
    pub revision: Revision,
    /// Set on the losing side of a sync conflict, pointing at the accepted entry.
    #[serde(default)]
    pub conflict_of: Option<EntryId>,
}

/// Per-entry sync bookkeeping. Holds ids only, never entry content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Revision both sides last agreed on, per entry.
    pub last_synced_revision: BTreeMap<EntryId, Revision>,
    /// Entries changed locally since their last synced revision.
    pub pending_local_changes: BTreeSet<EntryId>,
    /// Local deletions not yet acknowledged by the remote.
    pub tombstones: BTreeMap<EntryId, Revision>,
    /// Highest remote revision already pulled.
    pub remote_cursor: Revision,
}

impl SyncState {
    pub fn is_dirty(&self, id: &EntryId) -> bool {
        self.pending_local_changes.contains(id)
    }

    pub fn base_revision(&self, id: &EntryId) -> Revision {
        self.last_synced_revision
            .get(id)
            .copied()
            .unwrap_or_default()
    }

    pub fn is_clean(&self) -> bool {
        self.pending_local_changes.is_empty()
    }

    pub(crate) fn mark_dirty(&mut self, id: EntryId) {
        self.pending_local_changes.insert(id);
    }

    pub(crate) fn mark_synced(&mut self, id: EntryId, revision: Revision) {
        self.pending_local_changes.remove(&id);
        self.tombstones.remove(&id);
        self.last_synced_revision.insert(id, revision);
    }

    pub(crate) fn record_tombstone(&mut self, id: EntryId, revision: Revision) {
        self.tombstones.insert(id, revision);
        self.pending_local_changes.insert(id);
    }

    /// Drop every trace of an entry deleted on both sides.
    pub(crate) fn forget(&mut self, id: &EntryId) {
        self.pending_local_changes.remove(id);
        self.tombstones.remove(id);
        self.last_synced_revision.remove(id);
    }

    pub(crate) fn advance_cursor(&mut self, revision: Revision) {
        if revision > self.remote_cursor {
            self.remote_cursor = revision;
        }
    }

    /// Advance past our own acknowledged push when nothing can sit between.
    pub(crate) fn advance_cursor_if_next(&mut self, revision: Revision) {
        if revision == self.remote_cursor.next() {
            self.remote_cursor = revision;
        }
    }

    /// Highest revision this state has seen.
    pub fn high_water(&self) -> Revision {
        self.last_synced_revision
            .values()
            .chain(self.tombstones.values())
            .copied()
            .chain(std::iter::once(self.remote_cursor))
            .max()
            .unwrap_or_default()
    }
}

/// The two logical records handed to the storage backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSnapshot {
    pub entries: Vec<StoredEntry>,
    pub sync: SyncState,
}
