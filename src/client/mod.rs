//! Device-side sync engine
//!
//! Local mutations are applied to the device's snapshot store and staged in
//! the pending queue in one transaction. The sync client pushes the queue,
//! then pulls everything other devices wrote since its cursor.

mod cursor;
mod discovery;
mod engine;
mod queue;
mod transport;

pub use cursor::{load_or_create_device_id, SyncCursor};
pub use discovery::{ProbingLocator, ServerLocator, StaticLocator};
pub use engine::{
    log_reports, ClientStatus, SyncClient, SyncHandle, SyncOptions, SyncReport, SyncState,
    SyncTrigger, DEFAULT_PUSH_BATCH,
};
pub use queue::{PendingQueue, PendingQueueEntry};
pub use transport::{HttpTransport, LocalTransport, SyncTransport, PLATFORM_HEADER};
