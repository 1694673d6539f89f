//! Remote revision-exchange contract and an in-process implementation.

use crate::vault::models::{EntryId, PasswordEntry, Revision};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Latest remote state of one entry. `entry: None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: EntryId,
    pub revision: Revision,
    pub entry: Option<PasswordEntry>,
}

impl RemoteRecord {
    pub fn is_tombstone(&self) -> bool {
        self.entry.is_none()
    }
}

/// A local change offered to the remote, based on the revision both sides
/// last agreed on.
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub id: EntryId,
    pub base: Revision,
    pub entry: Option<PasswordEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted(Revision),
    /// The remote moved past `base`; this is what it holds now.
    Conflict(RemoteRecord),
}

#[async_trait]
pub trait RemoteSync: Send + Sync {
    /// Every record whose revision is greater than `since`, oldest first.
    async fn pull(&self, since: Revision) -> Result<Vec<RemoteRecord>>;
    async fn push(&self, request: PushRequest) -> Result<PushOutcome>;
}

/// Builds the remote for an unlocked session. Remotes that seal their data
/// with the master password re-key themselves in `rekey`.
pub trait RemoteConnector: Send + Sync {
    fn connect(&self, master: &SecretString) -> Result<Arc<dyn RemoteSync>>;

    fn rekey(&self, _old: &SecretString, _new: &SecretString) -> Result<()> {
        Ok(())
    }
}

/// Remote-side bookkeeping: one record per entry plus the revision head.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLog {
    pub head: Revision,
    pub records: BTreeMap<EntryId, RemoteRecord>,
}

impl RemoteLog {
    pub fn pull(&self, since: Revision) -> Vec<RemoteRecord> {
        let mut out: Vec<RemoteRecord> = self
            .records
            .values()
            .filter(|r| r.revision > since)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.revision);
        out
    }

    pub fn push(&mut self, request: PushRequest) -> PushOutcome {
        if let Some(current) = self.records.get(&request.id) {
            if current.revision > request.base {
                return PushOutcome::Conflict(current.clone());
            }
        }
        self.head = self.head.next();
        self.records.insert(
            request.id,
            RemoteRecord {
                id: request.id,
                revision: self.head,
                entry: request.entry,
            },
        );
        PushOutcome::Accepted(self.head)
    }
}

/// In-process remote. Several local stores can share one to simulate
/// clients; failures and latency can be injected.
#[derive(Default)]
pub struct MemoryRemote {
    log: Mutex<RemoteLog>,
    failures: AtomicUsize,
    latency: Mutex<Option<Duration>>,
    pulls: AtomicUsize,
    pushes: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self) -> std::sync::MutexGuard<'_, RemoteLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `n` pull/push calls with a network error.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Write as another client would, bypassing the base-revision check.
    pub fn put(&self, id: EntryId, entry: Option<PasswordEntry>) -> Revision {
        let mut log = self.log();
        let base = log.records.get(&id).map(|r| r.revision).unwrap_or_default();
        match log.push(PushRequest { id, base, entry }) {
            PushOutcome::Accepted(rev) => rev,
            PushOutcome::Conflict(current) => current.revision,
        }
    }

    pub fn record(&self, id: &EntryId) -> Option<RemoteRecord> {
        self.log().records.get(id).cloned()
    }

    pub fn head(&self) -> Revision {
        self.log().head
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    async fn before_call(&self) -> Result<()> {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(anyhow!("simulated network failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSync for MemoryRemote {
    async fn pull(&self, since: Revision) -> Result<Vec<RemoteRecord>> {
        self.before_call().await?;
        self.pulls.fetch_add(1, Ordering::SeqCst);
        Ok(self.log().pull(since))
    }

    async fn push(&self, request: PushRequest) -> Result<PushOutcome> {
        self.before_call().await?;
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(self.log().push(request))
    }
}

/// Hands out one shared `MemoryRemote` regardless of the master password.
pub struct SharedRemote(pub Arc<MemoryRemote>);

impl RemoteConnector for SharedRemote {
    fn connect(&self, _master: &SecretString) -> Result<Arc<dyn RemoteSync>> {
        Ok(self.0.clone())
    }
}
