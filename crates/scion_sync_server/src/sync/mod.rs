//! Real-time fan-out: channel table, heartbeat, and wire frames.

pub mod hub;
pub mod message;

pub use hub::{ChannelHub, HubStatus, HEARTBEAT_INTERVAL_SECS, SERVER_DEVICE_ID, STALE_AFTER_SECS};
pub use message::{ChannelMessage, MessageKind};
