//! Real-time device-telemetry fan-out hub: authenticated WebSocket
//! clients subscribe to a patient's (and optionally a device's) data
//! stream; inbound vital-sign frames are persisted and re-broadcast to
//! every interested subscriber, while a heartbeat sweep reaps dead
//! connections.

pub mod auth;
pub mod protocol;
pub mod server;
pub mod storage;
