//! Listener, control-plane and logging settings.

use serde::{Deserialize, Serialize};

/// HTTP/WebSocket listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port. 0 picks an ephemeral port.
    pub port: u16,
    /// Largest accepted inbound frame, in bytes.
    pub max_message_size: usize,
    /// How long shutdown waits for open sockets to drain, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_message_size: 1024 * 1024,
            shutdown_timeout_ms: 10_000,
        }
    }
}

/// Control-plane HTTP routes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControlPlaneSettings {
    /// Mount `/accounts/{id}/sessions|route|events`.
    pub enabled: bool,
    /// Bearer token required on control-plane routes. `None` leaves them open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Default wait for `route` requests that ask for a response, in milliseconds.
    pub default_route_timeout_ms: u64,
    /// Capacity of the process-wide device event channel.
    pub event_channel_capacity: usize,
}

impl Default for ControlPlaneSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            default_route_timeout_ms: 10_000,
            event_channel_capacity: 1024,
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (`RUST_LOG` overrides).
    pub level: String,
    /// `compact` or `json`.
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}
