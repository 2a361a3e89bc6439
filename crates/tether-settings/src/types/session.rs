//! Heartbeat, routing and per-connection resource settings.

use serde::{Deserialize, Serialize};

/// Per-connection liveness settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Interval H in seconds.
    pub interval_secs: u64,
    /// Consecutive silent intervals before the connection is closed.
    pub max_missed: u32,
    /// When false, connections become active immediately after admission.
    pub require_heartbeat: bool,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_missed: 2,
            require_heartbeat: true,
        }
    }
}

/// What to do with an inbound envelope whose type has no handler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownTypePolicy {
    /// Reply with an `echo` envelope wrapping the original.
    Echo,
    /// Discard silently.
    #[default]
    Drop,
    /// Reply with `error {code: UNKNOWN_MESSAGE_TYPE}`.
    Reject,
}

impl UnknownTypePolicy {
    /// Parse `echo` / `drop` / `reject` (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "echo" => Some(Self::Echo),
            "drop" => Some(Self::Drop),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

/// Inbound dispatch settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterSettings {
    /// Application message types forwarded from devices to the control plane.
    pub forward_types: Vec<String>,
    /// Policy for unregistered types.
    pub unknown_type_policy: UnknownTypePolicy,
    /// Close the connection with `PROTOCOL_ERROR` instead of rejecting one message.
    pub close_on_protocol_error: bool,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            forward_types: vec!["response".to_string(), "event".to_string()],
            unknown_type_policy: UnknownTypePolicy::Drop,
            close_on_protocol_error: false,
        }
    }
}

/// Per-connection resource limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Bound on queued outbound frames; overflow force-closes the connection.
    pub outbound_queue_capacity: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
        }
    }
}
