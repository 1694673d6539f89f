use crate::sync::engine::{ConflictReport, SyncPhase};

/// Notifications for the presentation layer, delivered over a broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultEvent {
    /// The entry list changed (local edit or applied sync).
    EntriesChanged,
    Verification { accepted: bool },
    SyncStatusChanged {
        phase: SyncPhase,
        conflicts: Vec<ConflictReport>,
    },
}
