//! Device-originated events published to the control plane.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tether_core::{AccountId, ConnectionId, Envelope};
use tokio::sync::broadcast;

/// An inbound application message from a device.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    /// Account the device belongs to.
    pub account_id: AccountId,
    /// Originating connection.
    pub connection_id: ConnectionId,
    /// The message exactly as the device sent it.
    pub envelope: Envelope,
    /// When the gateway received it.
    pub received_at: DateTime<Utc>,
}

/// Fan-out channel for [`DeviceEvent`]s.
pub type EventSender = broadcast::Sender<DeviceEvent>;

/// Create the event channel.
pub fn channel(capacity: usize) -> EventSender {
    let (tx, _rx) = broadcast::channel(capacity.max(1));
    tx
}
