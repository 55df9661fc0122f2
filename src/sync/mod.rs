//! Sync module for offline-first multi-device synchronization
//!
//! Provides:
//! - The append-only central change log
//! - Entity handlers that apply changes to snapshot stores
//! - Device bookkeeping
//! - Push/pull sync operations
//!
//! # Sync Protocol
//!
//! 1. Device pushes its pending `ChangeRecord`s in one batch
//! 2. Server applies each record in its own transaction, oldest first,
//!    acknowledging duplicates without re-applying them
//! 3. Server fans a `DataChanged` event out for each newly applied record
//! 4. Device pulls everything after its cursor, excluding its own records,
//!    one page at a time
//!
//! # Conflict Resolution
//!
//! - Last applied wins by default
//! - `RejectStale` refuses changes older than the stored snapshot

mod conflict;
mod devices;
mod handlers;
pub(crate) mod log;
mod service;
mod types;

pub use conflict::{ConflictPolicy, ConflictResolver, Verdict};
pub use devices::DeviceRepository;
pub use handlers::{
    EntityHandler, HandlerRegistry, Snapshot, SnapshotHandler, SnapshotRepository,
    DEFAULT_ENTITY_TYPES,
};
pub use log::ChangeLogRepository;
pub use service::{SyncService, DEFAULT_PAGE_SIZE};
pub use types::{
    from_micros, truncate_micros, AssignedId, ChangeRecord, DeviceInfo, Operation, PingResponse,
    PullQuery, PushResponse, RecordError, SyncStatus,
};
