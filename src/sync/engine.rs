//! Reconciliation of the local entry store against a remote.
//!
//! One pass pulls everything past the remote cursor, then pushes every
//! dirty entry, then pulls once more to fold in the acknowledgements of its
//! own pushes. Each entry is committed in its own store transaction; the
//! store lock is never held while a remote call is in flight.

use crate::error::{VaultError, VaultResult};
use crate::sync::cancel::CancellationToken;
use crate::sync::remote::{PushOutcome, PushRequest, RemoteRecord, RemoteSync};
use crate::vault::models::{EntryId, PasswordEntry, Revision};
use crate::vault::store::{EntryStore, Ledger};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const CONFLICT_SUFFIX: &str = " (conflict)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncPhase {
    Idle,
    Syncing,
    Success,
    Conflict,
    Failed,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Syncing => "syncing",
            SyncPhase::Success => "success",
            SyncPhase::Conflict => "conflict",
            SyncPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Winner {
    Local,
    Remote,
}

/// One entry that changed on both sides since it was last synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictReport {
    pub id: EntryId,
    pub winner: Winner,
    pub local_revision: Revision,
    pub remote_revision: Revision,
    /// The losing version, kept as a separate entry when there was content to keep.
    pub conflicted_copy: Option<EntryId>,
}

impl From<&ConflictReport> for VaultError {
    fn from(report: &ConflictReport) -> Self {
        VaultError::Conflict(report.id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Remote changes applied locally.
    pub pulled: usize,
    /// Local changes acknowledged by the remote.
    pub pushed: usize,
    pub conflicts: Vec<ConflictReport>,
    /// Dirty entries that may not be synced yet (blank password).
    pub rejected: Vec<EntryId>,
    pub error: Option<VaultError>,
    pub cancelled: bool,
}

impl SyncReport {
    /// Typed errors for callers that treat conflicts as failures.
    pub fn conflict_errors(&self) -> Vec<VaultError> {
        self.conflicts.iter().map(VaultError::from).collect()
    }

    pub fn phase(&self) -> SyncPhase {
        if self.error.is_some() || self.cancelled {
            SyncPhase::Failed
        } else if !self.conflicts.is_empty() {
            SyncPhase::Conflict
        } else {
            SyncPhase::Success
        }
    }
}

enum Reconciled {
    Skipped,
    Applied,
    Conflict(ConflictReport),
}

struct PendingPush {
    id: EntryId,
    base: Revision,
    revision: Revision,
    entry: Option<PasswordEntry>,
}

fn conflicted(mut entry: PasswordEntry) -> PasswordEntry {
    entry.label.push_str(CONFLICT_SUFFIX);
    entry
}

/// Fold one remote record into the ledger. Last writer by revision wins;
/// ties keep the local copy. The loser is never discarded.
fn reconcile(ledger: &mut Ledger, record: &RemoteRecord) -> Reconciled {
    let id = record.id;
    let base = ledger.sync.base_revision(&id);
    ledger.sync.advance_cursor(record.revision);
    if record.revision <= base {
        return Reconciled::Skipped;
    }
    ledger.observe(record.revision);

    if !ledger.sync.is_dirty(&id) {
        match &record.entry {
            Some(entry) => {
                ledger.put_remote(id, entry.clone(), record.revision);
                ledger.sync.mark_synced(id, record.revision);
            }
            None => {
                ledger.drop_entry(&id);
                ledger.sync.forget(&id);
            }
        }
        return Reconciled::Applied;
    }

    let local = ledger.find(&id).cloned();
    let local_revision = local
        .as_ref()
        .map(|s| s.revision)
        .or_else(|| ledger.sync.tombstones.get(&id).copied())
        .unwrap_or_default();
    let mut report = ConflictReport {
        id,
        winner: Winner::Local,
        local_revision,
        remote_revision: record.revision,
        conflicted_copy: None,
    };

    match (local, &record.entry) {
        (Some(local), Some(remote)) if local.entry == *remote => {
            // Both sides made the same edit.
            ledger.put_remote(id, remote.clone(), record.revision);
            ledger.sync.mark_synced(id, record.revision);
            return Reconciled::Applied;
        }
        (Some(local), Some(remote)) => {
            if record.revision > local.revision {
                ledger.put_remote(id, remote.clone(), record.revision);
                ledger.sync.mark_synced(id, record.revision);
                report.winner = Winner::Remote;
                report.conflicted_copy = Some(ledger.insert_local(conflicted(local.entry), Some(id)));
            } else {
                ledger.sync.last_synced_revision.insert(id, record.revision);
                report.conflicted_copy =
                    Some(ledger.insert_local(conflicted(remote.clone()), Some(id)));
            }
        }
        (Some(_), None) => {
            // Deleted remotely, edited locally: keep the edit and re-push it.
            ledger.sync.last_synced_revision.insert(id, record.revision);
        }
        (None, Some(remote)) => {
            // Deleted locally, edited remotely: restore the remote edit.
            ledger.put_remote(id, remote.clone(), record.revision);
            ledger.sync.mark_synced(id, record.revision);
            report.winner = Winner::Remote;
        }
        (None, None) => {
            ledger.sync.forget(&id);
            return Reconciled::Applied;
        }
    }
    tracing::warn!(%id, winner = ?report.winner, "sync conflict resolved");
    Reconciled::Conflict(report)
}

/// Record the remote's acknowledgement of a push.
fn acknowledge(ledger: &mut Ledger, push: &PendingPush, revision: Revision) -> VaultResult<()> {
    ledger.observe(revision);
    ledger.sync.advance_cursor_if_next(revision);
    match &push.entry {
        None => {
            if ledger.sync.tombstones.get(&push.id) == Some(&push.revision) {
                ledger.sync.forget(&push.id);
            } else {
                ledger.sync.last_synced_revision.insert(push.id, revision);
            }
        }
        Some(_) => {
            let unchanged = ledger
                .find(&push.id)
                .is_some_and(|stored| stored.revision == push.revision);
            if unchanged {
                let stored = ledger
                    .find_mut(&push.id)
                    .ok_or(VaultError::NotFound(push.id))?;
                if !stored.entry.has_password() {
                    return Err(VaultError::ValidationFailure(
                        "an entry needs a non-blank password to be synced".into(),
                    ));
                }
                stored.revision = revision;
                ledger.sync.mark_synced(push.id, revision);
            } else {
                // Edited or deleted while the push was in flight: stays dirty.
                ledger.sync.last_synced_revision.insert(push.id, revision);
            }
        }
    }
    Ok(())
}

pub struct SyncEngine {
    store: Arc<EntryStore>,
    remote: Arc<dyn RemoteSync>,
    timeout: Duration,
}

impl SyncEngine {
    pub fn new(store: Arc<EntryStore>, remote: Arc<dyn RemoteSync>, timeout: Duration) -> Self {
        Self {
            store,
            remote,
            timeout,
        }
    }

    pub fn store(&self) -> &Arc<EntryStore> {
        &self.store
    }

    async fn call<T>(&self, fut: impl Future<Output = anyhow::Result<T>>) -> VaultResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(VaultError::NetworkFailure(format!("{e:#}"))),
            Err(_) => Err(VaultError::NetworkFailure(format!(
                "remote did not answer within {:?}",
                self.timeout
            ))),
        }
    }

    /// One full reconciliation pass. Never panics; failures land in the report.
    pub async fn sync_once(&self, cancel: &CancellationToken) -> SyncReport {
        let mut report = SyncReport::default();
        if let Err(e) = self.pull(&mut report, cancel).await {
            report.error = Some(e);
            return report;
        }
        if report.cancelled {
            return report;
        }
        let pushed_before = report.pushed;
        if let Err(e) = self.push(&mut report, cancel).await {
            report.error = Some(e);
            return report;
        }
        if report.pushed > pushed_before && !report.cancelled {
            if let Err(e) = self.pull(&mut report, cancel).await {
                report.error = Some(e);
            }
        }
        tracing::info!(
            phase = %report.phase(),
            pulled = report.pulled,
            pushed = report.pushed,
            conflicts = report.conflicts.len(),
            "sync pass finished"
        );
        report
    }

    async fn pull(&self, report: &mut SyncReport, cancel: &CancellationToken) -> VaultResult<()> {
        let since = self.store.sync_state().remote_cursor;
        let records = self.call(self.remote.pull(since)).await?;
        tracing::debug!(%since, count = records.len(), "pulled remote records");
        for record in records {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match self.store.transact(|ledger| Ok(reconcile(ledger, &record)))? {
                Reconciled::Skipped => {}
                Reconciled::Applied => report.pulled += 1,
                Reconciled::Conflict(c) => {
                    report.pulled += 1;
                    report.conflicts.push(c);
                }
            }
        }
        Ok(())
    }

    fn pending(&self) -> Vec<PendingPush> {
        self.store.inspect(|ledger| {
            ledger
                .sync
                .pending_local_changes
                .iter()
                .filter_map(|id| {
                    let base = ledger.sync.base_revision(id);
                    if let Some(stored) = ledger.find(id) {
                        Some(PendingPush {
                            id: *id,
                            base,
                            revision: stored.revision,
                            entry: Some(stored.entry.clone()),
                        })
                    } else {
                        ledger.sync.tombstones.get(id).map(|rev| PendingPush {
                            id: *id,
                            base,
                            revision: *rev,
                            entry: None,
                        })
                    }
                })
                .collect()
        })
    }

    async fn push(&self, report: &mut SyncReport, cancel: &CancellationToken) -> VaultResult<()> {
        for pending in self.pending() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if pending.entry.as_ref().is_some_and(|e| !e.has_password()) {
                tracing::warn!(id = %pending.id, "not syncing entry with a blank password");
                report.rejected.push(pending.id);
                continue;
            }
            let request = PushRequest {
                id: pending.id,
                base: pending.base,
                entry: pending.entry.clone(),
            };
            match self.call(self.remote.push(request)).await? {
                PushOutcome::Accepted(revision) => {
                    self.store
                        .transact(|ledger| acknowledge(ledger, &pending, revision))?;
                    report.pushed += 1;
                }
                PushOutcome::Conflict(record) => {
                    if let Reconciled::Conflict(c) =
                        self.store.transact(|ledger| Ok(reconcile(ledger, &record)))?
                    {
                        report.conflicts.push(c);
                    }
                }
            }
        }
        Ok(())
    }
}
