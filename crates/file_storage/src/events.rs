use common::{
    knobs::SYNC_EVENTS_ENABLED,
    runtime::Runtime,
    types::{
        FileId,
        UserId,
    },
};

use crate::FileStorage;

/// What happened to a node, for clients that maintain a sync timeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncEventKind {
    Create,
    Update,
    Trash,
    Restore,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncEvent {
    pub owner_id: UserId,
    pub file_id: FileId,
    pub kind: SyncEventKind,
    /// Whether the node's bytes changed, as opposed to metadata only.
    pub content_updated: bool,
}

/// Append-only feed of mutations. The sink must not block: implementations
/// queue internally or drop on overflow.
pub trait SyncEventSink: Send + Sync {
    fn append(&self, event: SyncEvent);
}

pub struct NoOpSyncEvents;

impl SyncEventSink for NoOpSyncEvents {
    fn append(&self, _event: SyncEvent) {}
}

impl<RT: Runtime> FileStorage<RT> {
    /// Emits one sync event per completed mutation. Disabled by default
    /// behind a knob: the upstream writer this mirrors was observed
    /// short-circuited in production, so operators opt in explicitly.
    pub(crate) fn emit(
        &self,
        owner_id: UserId,
        file_id: FileId,
        kind: SyncEventKind,
        content_updated: bool,
    ) {
        if !*SYNC_EVENTS_ENABLED {
            return;
        }
        self.events.append(SyncEvent {
            owner_id,
            file_id,
            kind,
            content_updated,
        });
    }
}
