use bluekey::error::VaultError;
use bluekey::sync::cancel::CancellationToken;
use bluekey::sync::engine::{SyncEngine, SyncPhase, Winner, CONFLICT_SUFFIX};
use bluekey::sync::remote::MemoryRemote;
use bluekey::vault::models::{PasswordEntry, Revision, StoredEntry, VaultSnapshot};
use bluekey::vault::persistence::MemoryStorage;
use bluekey::vault::store::{EntryStore, StoreOptions};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn client_with(remote: &Arc<MemoryRemote>, snapshot: VaultSnapshot) -> (Arc<EntryStore>, SyncEngine) {
    let backend = Arc::new(MemoryStorage::with_snapshot(snapshot));
    let store = Arc::new(EntryStore::open(backend, StoreOptions::default()).unwrap());
    let engine = SyncEngine::new(store.clone(), remote.clone(), Duration::from_secs(5));
    (store, engine)
}

fn client(remote: &Arc<MemoryRemote>) -> (Arc<EntryStore>, SyncEngine) {
    client_with(remote, VaultSnapshot::default())
}

/// Local entry `x` edited at `local` on top of `base`, remote already at `remote_rev`.
fn diverged(
    remote: &Arc<MemoryRemote>,
    x: Uuid,
    local: Revision,
    base: Revision,
    remote_rev: u64,
) -> (Arc<EntryStore>, SyncEngine) {
    for _ in 1..remote_rev {
        remote.put(x, Some(PasswordEntry::new("older", "u", "p0")));
    }
    assert_eq!(
        remote.put(x, Some(PasswordEntry::new("B", "u", "pb"))),
        Revision(remote_rev)
    );
    let mut snapshot = VaultSnapshot::default();
    snapshot.entries.push(StoredEntry {
        id: x,
        entry: PasswordEntry::new("A", "u", "pa"),
        revision: local,
        conflict_of: None,
    });
    snapshot.sync.last_synced_revision.insert(x, base);
    snapshot.sync.pending_local_changes.insert(x);
    snapshot.sync.remote_cursor = base;
    client_with(remote, snapshot)
}

#[tokio::test]
async fn second_sync_without_changes_is_a_no_op() {
    let remote = Arc::new(MemoryRemote::new());
    let (store, engine) = client(&remote);
    let a = store.add(PasswordEntry::new("mail", "me", "pw")).unwrap();
    let b = store.add(PasswordEntry::new("bank", "me", "pw2")).unwrap();
    let token = CancellationToken::new();

    let first = engine.sync_once(&token).await;
    assert_eq!(first.phase(), SyncPhase::Success);
    assert_eq!(first.pushed, 2);
    assert!(store.sync_state().is_clean());
    assert!(remote.record(&a).is_some() && remote.record(&b).is_some());

    let before = store.snapshot();
    let pushes = remote.push_count();
    let second = engine.sync_once(&token).await;
    assert_eq!(second.phase(), SyncPhase::Success);
    assert_eq!((second.pulled, second.pushed), (0, 0));
    assert!(second.conflicts.is_empty());
    assert_eq!(store.snapshot(), before);
    assert_eq!(remote.push_count(), pushes);
}

#[tokio::test]
async fn newer_remote_wins_and_local_is_kept_as_conflicted_copy() {
    let remote = Arc::new(MemoryRemote::new());
    let x = Uuid::new_v4();
    let (store, engine) = diverged(&remote, x, Revision(5), Revision(4), 6);

    let report = engine.sync_once(&CancellationToken::new()).await;
    assert_eq!(report.phase(), SyncPhase::Conflict);
    assert_eq!(report.conflicts.len(), 1);
    let conflict = &report.conflicts[0];
    assert_eq!(conflict.id, x);
    assert_eq!(conflict.winner, Winner::Remote);
    assert_eq!(conflict.local_revision, Revision(5));
    assert_eq!(conflict.remote_revision, Revision(6));
    assert_eq!(report.conflict_errors(), vec![VaultError::Conflict(x)]);
    assert!(report.error.is_none());

    assert_eq!(store.get(x).unwrap().label, "B");
    let copies = store.conflicts();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].entry.label, format!("A{CONFLICT_SUFFIX}"));
    assert_eq!(copies[0].conflict_of, Some(x));
    assert_eq!(Some(copies[0].id), conflict.conflicted_copy);

    // The copy was pushed like any other entry; nothing is left dirty.
    assert!(remote.record(&copies[0].id).is_some());
    assert!(store.sync_state().is_clean());

    let again = engine.sync_once(&CancellationToken::new()).await;
    assert_eq!(again.phase(), SyncPhase::Success);
    assert_eq!((again.pulled, again.pushed), (0, 0));
}

#[tokio::test]
async fn revision_tie_prefers_local() {
    let remote = Arc::new(MemoryRemote::new());
    let x = Uuid::new_v4();
    let (store, engine) = diverged(&remote, x, Revision(6), Revision(4), 6);

    let report = engine.sync_once(&CancellationToken::new()).await;
    assert_eq!(report.phase(), SyncPhase::Conflict);
    assert_eq!(report.conflicts[0].winner, Winner::Local);

    assert_eq!(store.get(x).unwrap().label, "A");
    let remote_x = remote.record(&x).unwrap();
    assert_eq!(remote_x.entry.unwrap().label, "A");
    let copies = store.conflicts();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].entry.label, format!("B{CONFLICT_SUFFIX}"));
    assert!(store.sync_state().is_clean());
}

#[tokio::test]
async fn identical_edits_on_both_sides_are_not_a_conflict() {
    let remote = Arc::new(MemoryRemote::new());
    let x = Uuid::new_v4();
    let (store, engine) = diverged(&remote, x, Revision(5), Revision(4), 6);
    store
        .update(x, |e| {
            e.label = "B".into();
            e.password = secrecy::SecretString::from("pb".to_string());
        })
        .unwrap();

    let report = engine.sync_once(&CancellationToken::new()).await;
    assert_eq!(report.phase(), SyncPhase::Success);
    assert!(store.conflicts().is_empty());
    assert!(store.sync_state().is_clean());
    assert_eq!(store.sync_state().base_revision(&x), Revision(6));
}

#[tokio::test]
async fn deletion_propagates_and_re_adding_yields_a_new_id() {
    let remote = Arc::new(MemoryRemote::new());
    let (a_store, a) = client(&remote);
    let (b_store, b) = client(&remote);
    let token = CancellationToken::new();

    let y = a_store.add(PasswordEntry::new("Y", "u", "p")).unwrap();
    a.sync_once(&token).await;
    b.sync_once(&token).await;
    assert_eq!(b_store.get(y).unwrap().label, "Y");

    a_store.remove(y).unwrap();
    let report = a.sync_once(&token).await;
    assert_eq!(report.pushed, 1);
    assert!(remote.record(&y).unwrap().is_tombstone());
    assert!(a_store.sync_state().tombstones.is_empty());
    assert!(a_store.sync_state().is_clean());

    let report = b.sync_once(&token).await;
    assert_eq!(report.phase(), SyncPhase::Success);
    assert_eq!(b_store.get(y).unwrap_err(), VaultError::NotFound(y));
    assert!(b_store.is_empty());

    let again = b_store.add(PasswordEntry::new("Y", "u", "p")).unwrap();
    assert_ne!(again, y);
    b.sync_once(&token).await;
    a.sync_once(&token).await;
    assert_eq!(a_store.list().len(), 1);
    assert_eq!(a_store.get(again).unwrap().label, "Y");
}

#[tokio::test]
async fn remote_deletion_does_not_discard_a_local_edit() {
    let remote = Arc::new(MemoryRemote::new());
    let (a_store, a) = client(&remote);
    let (b_store, b) = client(&remote);
    let token = CancellationToken::new();

    let y = a_store.add(PasswordEntry::new("Y", "u", "p")).unwrap();
    a.sync_once(&token).await;
    b.sync_once(&token).await;

    b_store.update(y, |e| e.label = "Y edited".into()).unwrap();
    a_store.remove(y).unwrap();
    a.sync_once(&token).await;

    let report = b.sync_once(&token).await;
    assert_eq!(report.phase(), SyncPhase::Conflict);
    assert_eq!(report.conflicts[0].winner, Winner::Local);
    assert_eq!(b_store.get(y).unwrap().label, "Y edited");
    assert!(!remote.record(&y).unwrap().is_tombstone());

    // The deleting side gets the edit back.
    a.sync_once(&token).await;
    assert_eq!(a_store.get(y).unwrap().label, "Y edited");
}

#[tokio::test]
async fn local_deletion_yields_to_a_remote_edit() {
    let remote = Arc::new(MemoryRemote::new());
    let (a_store, a) = client(&remote);
    let (b_store, b) = client(&remote);
    let token = CancellationToken::new();

    let y = a_store.add(PasswordEntry::new("Y", "u", "p")).unwrap();
    a.sync_once(&token).await;
    b.sync_once(&token).await;

    a_store.update(y, |e| e.label = "Y edited".into()).unwrap();
    a.sync_once(&token).await;
    b_store.remove(y).unwrap();

    let report = b.sync_once(&token).await;
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].winner, Winner::Remote);
    assert_eq!(b_store.get(y).unwrap().label, "Y edited");
    assert!(b_store.sync_state().is_clean());
}

#[tokio::test]
async fn network_failure_leaves_everything_dirty() {
    let remote = Arc::new(MemoryRemote::new());
    let (store, engine) = client(&remote);
    let id = store.add(PasswordEntry::new("mail", "me", "pw")).unwrap();
    let before = store.snapshot();

    remote.fail_next(1);
    let report = engine.sync_once(&CancellationToken::new()).await;
    assert_eq!(report.phase(), SyncPhase::Failed);
    assert!(matches!(report.error, Some(VaultError::NetworkFailure(_))));
    assert!(store.is_dirty(&id));
    assert_eq!(store.snapshot(), before);

    let report = engine.sync_once(&CancellationToken::new()).await;
    assert_eq!(report.phase(), SyncPhase::Success);
    assert!(!store.is_dirty(&id));
}

#[tokio::test(start_paused = true)]
async fn slow_remote_times_out_as_network_failure() {
    let remote = Arc::new(MemoryRemote::new());
    remote.set_latency(Some(Duration::from_secs(60)));
    let store = Arc::new(
        EntryStore::open(Arc::new(MemoryStorage::default()), StoreOptions::default()).unwrap(),
    );
    let id = store.add(PasswordEntry::new("mail", "me", "pw")).unwrap();
    let engine = SyncEngine::new(store.clone(), remote.clone(), Duration::from_secs(1));

    let report = engine.sync_once(&CancellationToken::new()).await;
    assert!(matches!(report.error, Some(VaultError::NetworkFailure(_))));
    assert!(store.is_dirty(&id));
}

#[tokio::test]
async fn blank_password_is_never_marked_synced() {
    let remote = Arc::new(MemoryRemote::new());
    let (store, engine) = client(&remote);
    let blank = store.add(PasswordEntry::new("draft", "me", "  ")).unwrap();
    let good = store.add(PasswordEntry::new("mail", "me", "pw")).unwrap();

    let report = engine.sync_once(&CancellationToken::new()).await;
    assert_eq!(report.rejected, vec![blank]);
    assert_eq!(report.pushed, 1);
    assert!(store.is_dirty(&blank));
    assert!(!store.is_dirty(&good));
    assert!(remote.record(&blank).is_none());

    store
        .update(blank, |e| e.password = secrecy::SecretString::from("now set".to_string()))
        .unwrap();
    let report = engine.sync_once(&CancellationToken::new()).await;
    assert!(report.rejected.is_empty());
    assert!(!store.is_dirty(&blank));
}

#[tokio::test]
async fn cancelled_token_stops_before_touching_entries() {
    let remote = Arc::new(MemoryRemote::new());
    let (store, engine) = client(&remote);
    let a = store.add(PasswordEntry::new("a", "", "p")).unwrap();
    let b = store.add(PasswordEntry::new("b", "", "p")).unwrap();
    let token = CancellationToken::new();
    token.cancel();

    let report = engine.sync_once(&token).await;
    assert!(report.cancelled);
    assert_eq!(report.phase(), SyncPhase::Failed);
    assert_eq!(report.pushed, 0);
    assert!(store.is_dirty(&a) && store.is_dirty(&b));
}

#[tokio::test(start_paused = true)]
async fn cancellation_finishes_the_entry_in_flight() {
    let remote = Arc::new(MemoryRemote::new());
    remote.set_latency(Some(Duration::from_millis(100)));
    let (store, engine) = client(&remote);
    store.add(PasswordEntry::new("a", "", "p")).unwrap();
    store.add(PasswordEntry::new("b", "", "p")).unwrap();
    let token = CancellationToken::new();

    let task = {
        let token = token.clone();
        tokio::spawn(async move { engine.sync_once(&token).await })
    };
    // Pull ends at 100ms, first push is in flight until 200ms.
    tokio::time::sleep(Duration::from_millis(150)).await;
    token.cancel();
    let report = task.await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.pushed, 1);
    assert_eq!(store.sync_state().pending_local_changes.len(), 1);
    assert_eq!(remote.head(), Revision(1));
}

#[tokio::test(start_paused = true)]
async fn remote_change_racing_a_push_is_reconciled() {
    let remote = Arc::new(MemoryRemote::new());
    let (store, engine) = client(&remote);
    let token = CancellationToken::new();
    let x = store.add(PasswordEntry::new("X", "u", "p")).unwrap();
    engine.sync_once(&token).await;
    store.update(x, |e| e.label = "local edit".into()).unwrap();

    remote.set_latency(Some(Duration::from_millis(100)));
    let engine = Arc::new(engine);
    let task = {
        let engine = engine.clone();
        let token = token.clone();
        tokio::spawn(async move { engine.sync_once(&token).await })
    };
    // Lands after the pull read the log, before the push does.
    tokio::time::sleep(Duration::from_millis(150)).await;
    remote.put(x, Some(PasswordEntry::new("remote edit", "u", "p")));
    let report = task.await.unwrap();

    assert_eq!(report.phase(), SyncPhase::Conflict);
    assert_eq!(report.conflicts[0].id, x);
    assert_eq!(store.get(x).unwrap().label, "local edit");
    assert_eq!(store.conflicts().len(), 1);

    remote.set_latency(None);
    let report = engine.sync_once(&token).await;
    assert_eq!(report.phase(), SyncPhase::Success);
    assert_eq!(remote.record(&x).unwrap().entry.unwrap().label, "local edit");
    assert!(store.sync_state().is_clean());
}
