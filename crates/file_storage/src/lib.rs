//! The orchestrator. Composes the storage provider, the quota ledger, and
//! the hierarchy index into the user-visible file operations, and owns every
//! compensation path: reserve before write, commit after write, unwind
//! backwards on any failure.

use std::sync::Arc;

use common::runtime::Runtime;
use headers::ContentLength;
use keybroker::KeyBroker;
use model::{
    types::FileNode,
    Database,
};
use storage::{
    StorageGetStream,
    StorageProvider,
};

mod core;
mod events;
mod multipart;
mod sweeper;
#[cfg(test)]
mod tests;

pub use self::core::{
    FileListing,
    UploadRequest,
};
pub use events::{
    NoOpSyncEvents,
    SyncEvent,
    SyncEventKind,
    SyncEventSink,
};
pub use multipart::{
    CompletedPartInput,
    MultipartInitRequest,
    MultipartInitiated,
};

/// A download ready to hand to the HTTP layer: node metadata for the
/// response headers plus the (possibly ranged) byte stream.
pub struct FileDownload {
    pub node: FileNode,
    pub content_length: ContentLength,
    pub stream: StorageGetStream,
}

impl std::fmt::Debug for FileDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDownload")
            .field("node", &self.node)
            .field("content_length", &self.content_length)
            .finish()
    }
}

#[derive(Clone)]
pub struct FileStorage<RT: Runtime> {
    rt: RT,
    db: Database,
    provider: Arc<dyn StorageProvider>,
    key_broker: KeyBroker,
    events: Arc<dyn SyncEventSink>,
}

impl<RT: Runtime> FileStorage<RT> {
    pub fn new(
        rt: RT,
        db: Database,
        provider: Arc<dyn StorageProvider>,
        key_broker: KeyBroker,
    ) -> Self {
        Self {
            rt,
            db,
            provider,
            key_broker,
            events: Arc::new(NoOpSyncEvents),
        }
    }

    pub fn with_event_sink(mut self, events: Arc<dyn SyncEventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn provider(&self) -> &Arc<dyn StorageProvider> {
        &self.provider
    }
}
