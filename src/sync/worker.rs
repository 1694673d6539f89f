//! Background sync worker.
//!
//! Owns a [`SyncEngine`] on a tokio task and runs it on a fixed interval,
//! on demand, or both. Status is published on a watch channel; phase
//! changes are also broadcast as [`VaultEvent`]s.

use crate::error::{VaultError, VaultResult};
use crate::sync::cancel::CancellationToken;
use crate::sync::engine::{SyncEngine, SyncPhase, SyncReport};
use crate::vault::events::VaultEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Periodic sync interval; `None` syncs only when triggered.
    pub interval: Option<Duration>,
    /// Extra attempts after a network failure.
    pub retries: u32,
    /// First retry delay, doubled on every further attempt.
    pub backoff: Duration,
    pub sync_on_start: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval: None,
            retries: 3,
            backoff: Duration::from_millis(500),
            sync_on_start: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub last_report: Option<SyncReport>,
    /// Completed passes, retries included in the pass they belong to.
    pub runs: u64,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Idle,
            last_report: None,
            runs: 0,
        }
    }
}

/// Cloneable handle to the worker. The worker exits once it is cancelled
/// or every handle is dropped.
#[derive(Clone)]
pub struct SyncHandle {
    requests: mpsc::Sender<oneshot::Sender<SyncReport>>,
    trigger: Arc<Notify>,
    status: watch::Receiver<SyncStatus>,
    cancel: CancellationToken,
    task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl SyncHandle {
    /// Start the worker on the current tokio runtime.
    pub fn spawn(
        engine: SyncEngine,
        config: WorkerConfig,
        events: Option<broadcast::Sender<VaultEvent>>,
    ) -> Self {
        let (requests, rx) = mpsc::channel(16);
        let trigger = Arc::new(Notify::new());
        let (status_tx, status) = watch::channel(SyncStatus::default());
        let cancel = CancellationToken::new();
        let worker = Worker {
            engine,
            config,
            events,
            status: status_tx,
            cancel: cancel.clone(),
            trigger: trigger.clone(),
        };
        let task = tokio::spawn(worker.run(rx));
        Self {
            requests,
            trigger,
            status,
            cancel,
            task: Arc::new(std::sync::Mutex::new(Some(task))),
        }
    }

    /// Ask for a sync without waiting for it. Triggers that arrive before
    /// the worker picks one up collapse into a single pass.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Run a sync pass and wait for its report.
    pub async fn sync_now(&self) -> VaultResult<SyncReport> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(tx)
            .await
            .map_err(|_| VaultError::Locked)?;
        rx.await.map_err(|_| VaultError::Locked)
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status change.
    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.requests.is_closed()
    }

    /// Cancel the worker and wait for the running pass to stop.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "sync worker ended abnormally");
            }
        }
    }
}

struct Worker {
    engine: SyncEngine,
    config: WorkerConfig,
    events: Option<broadcast::Sender<VaultEvent>>,
    status: watch::Sender<SyncStatus>,
    cancel: CancellationToken,
    trigger: Arc<Notify>,
}

impl Worker {
    async fn run(self, mut requests: mpsc::Receiver<oneshot::Sender<SyncReport>>) {
        tracing::debug!(interval = ?self.config.interval, "sync worker started");
        let mut ticker = self.config.interval.map(|period| {
            let mut t = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            t
        });
        if self.config.sync_on_start {
            self.run_pass().await;
        }
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                request = requests.recv() => match request {
                    Some(reply) => {
                        let report = self.run_pass().await;
                        let _ = reply.send(report);
                    }
                    None => break,
                },
                _ = self.trigger.notified() => {
                    self.run_pass().await;
                }
                _ = tick(&mut ticker) => {
                    self.run_pass().await;
                }
            }
        }
        tracing::debug!("sync worker stopped");
    }

    /// One pass including retries on network failure.
    async fn run_pass(&self) -> SyncReport {
        self.publish(SyncPhase::Syncing, None);
        let mut attempt = 0u32;
        let report = loop {
            let report = self.engine.sync_once(&self.cancel).await;
            let retryable = matches!(report.error, Some(VaultError::NetworkFailure(_)));
            if !retryable || attempt >= self.config.retries || self.cancel.is_cancelled() {
                break report;
            }
            let delay = self.config.backoff.saturating_mul(1u32 << attempt.min(16));
            attempt += 1;
            tracing::info!(attempt, ?delay, "sync failed, retrying");
            tokio::select! {
                _ = self.cancel.cancelled() => break report,
                _ = tokio::time::sleep(delay) => {}
            }
        };
        if let Some(e) = &report.error {
            tracing::warn!(error = %e, "sync pass failed");
        }
        let phase = report.phase();
        if report.pulled > 0 {
            self.emit(VaultEvent::EntriesChanged);
        }
        self.publish(phase, Some(report.clone()));
        self.publish(SyncPhase::Idle, None);
        report
    }

    fn publish(&self, phase: SyncPhase, report: Option<SyncReport>) {
        let conflicts = report
            .as_ref()
            .map(|r| r.conflicts.clone())
            .unwrap_or_default();
        let finished = report.is_some();
        self.status.send_modify(|status| {
            status.phase = phase;
            if let Some(report) = report {
                status.last_report = Some(report);
            }
            if finished {
                status.runs += 1;
            }
        });
        self.emit(VaultEvent::SyncStatusChanged { phase, conflicts });
    }

    fn emit(&self, event: VaultEvent) {
        if let Some(events) = &self.events {
            // No subscribers is fine.
            let _ = events.send(event);
        }
    }
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::remote::MemoryRemote;
    use crate::vault::models::PasswordEntry;
    use crate::vault::persistence::MemoryStorage;
    use crate::vault::store::{EntryStore, StoreOptions};

    fn engine(remote: Arc<MemoryRemote>) -> (Arc<EntryStore>, SyncEngine) {
        let store = Arc::new(
            EntryStore::open(Arc::new(MemoryStorage::default()), StoreOptions::default()).unwrap(),
        );
        let engine = SyncEngine::new(store.clone(), remote, Duration::from_secs(5));
        (store, engine)
    }

    #[tokio::test]
    async fn sync_now_reports_and_updates_status() {
        let remote = Arc::new(MemoryRemote::new());
        let (store, engine) = engine(remote.clone());
        store.add(PasswordEntry::new("mail", "me", "pw")).unwrap();
        let handle = SyncHandle::spawn(engine, WorkerConfig::default(), None);

        let report = handle.sync_now().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(report.phase(), SyncPhase::Success);
        let status = handle.status();
        assert_eq!(status.phase, SyncPhase::Idle);
        assert_eq!(status.runs, 1);
        handle.shutdown().await;
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn network_failures_are_retried() {
        let remote = Arc::new(MemoryRemote::new());
        remote.fail_next(2);
        let (store, engine) = engine(remote.clone());
        store.add(PasswordEntry::new("mail", "me", "pw")).unwrap();
        let config = WorkerConfig {
            retries: 3,
            backoff: Duration::from_millis(1),
            ..WorkerConfig::default()
        };
        let handle = SyncHandle::spawn(engine, config, None);
        let report = handle.sync_now().await.unwrap();
        assert!(report.error.is_none());
        assert_eq!(report.pushed, 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_retries_report_failure() {
        let remote = Arc::new(MemoryRemote::new());
        remote.fail_next(10);
        let (_store, engine) = engine(remote);
        let config = WorkerConfig {
            retries: 1,
            backoff: Duration::from_millis(1),
            ..WorkerConfig::default()
        };
        let handle = SyncHandle::spawn(engine, config, None);
        let report = handle.sync_now().await.unwrap();
        assert_eq!(report.phase(), SyncPhase::Failed);
        assert!(matches!(report.error, Some(VaultError::NetworkFailure(_))));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn queued_triggers_run_one_pass() {
        let remote = Arc::new(MemoryRemote::new());
        remote.set_latency(Some(Duration::from_millis(20)));
        let (_store, engine) = engine(remote.clone());
        let handle = SyncHandle::spawn(engine, WorkerConfig::default(), None);
        for _ in 0..5 {
            handle.trigger();
        }

        let mut status = handle.watch();
        status.wait_for(|s| s.runs >= 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.status().runs, 1);
        assert_eq!(remote.pull_count(), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn sync_now_after_shutdown_is_locked() {
        let (_store, engine) = engine(Arc::new(MemoryRemote::new()));
        let handle = SyncHandle::spawn(engine, WorkerConfig::default(), None);
        handle.shutdown().await;
        assert_eq!(handle.sync_now().await.unwrap_err(), VaultError::Locked);
    }
}
