//! Device sockets: connection state, heartbeat monitoring, inbound dispatch
//! and the per-socket task.

pub mod connection;
pub mod heartbeat;
pub mod router;
pub mod session;
