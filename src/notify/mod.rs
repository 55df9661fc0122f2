//! Real-time change notifications
//!
//! A single broadcast group over WebSocket. The server publishes a
//! `DataChanged` event for every applied change; connected devices use it
//! to pull sooner than their next timer tick. Delivery is best-effort: a
//! missed event is only a latency cost, the periodic pull is the durable
//! path.

mod channel;
mod hub;
mod messages;

pub use channel::{hub_url, ConnectionState, NotifierClient, NotifierHandle};
pub use hub::{ConnectionId, Notifier};
pub use messages::{ClientMessage, DataChanged, ServerEvent};
