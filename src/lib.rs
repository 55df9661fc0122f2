//! Habit Sync
//!
//! Offline-first synchronization for a habit tracker. Devices record every
//! mutation locally, push it to a central change log when a server is
//! reachable, and pull what other devices wrote. A WebSocket broadcast group
//! nudges devices to sync as soon as something changes.
//!
//! # Modules
//!
//! - `sync`: Central change log, entity handlers and the push/pull service
//! - `client`: Pending queue, transports and the device sync loop
//! - `notify`: Realtime broadcast group and its device-side connection
//! - `routes`: HTTP and WebSocket endpoints

pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod notify;
pub mod routes;
pub mod state;
pub mod sync;
