//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` for the JSON file format
//! and implement [`Default`] with production values. Every struct is
//! `#[serde(default)]`, so a partial settings file is valid.

mod auth;
mod server;
mod session;

pub use auth::*;
pub use server::*;
pub use session::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type for the gateway.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "auth": { "issuer": "https://id.example.com/", "audience": "tether" },
///   "heartbeat": { "intervalSecs": 15 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// Listener settings.
    pub server: ServerSettings,
    /// Token validation and key-set cache.
    pub auth: AuthSettings,
    /// Per-connection liveness.
    pub heartbeat: HeartbeatSettings,
    /// Message dispatch policy.
    pub router: RouterSettings,
    /// Per-connection resources.
    pub connection: ConnectionSettings,
    /// Control-plane HTTP surface.
    pub control_plane: ControlPlaneSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl GatewaySettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.auth.issuer.trim().is_empty() {
            return Err(SettingsError::InvalidValue("auth.issuer is empty".into()));
        }
        if self.auth.audience.trim().is_empty() {
            return Err(SettingsError::InvalidValue("auth.audience is empty".into()));
        }
        if self.auth.key_domain().is_none() {
            return Err(SettingsError::InvalidValue(
                "auth.issuerDomain is unset and cannot be derived from auth.issuer".into(),
            ));
        }
        if !self.auth.key_set.url_template.contains("{domain}") {
            return Err(SettingsError::InvalidValue(
                "auth.keySet.urlTemplate must contain {domain}".into(),
            ));
        }
        if self.heartbeat.interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "heartbeat.intervalSecs must be > 0".into(),
            ));
        }
        if self.heartbeat.max_missed == 0 {
            return Err(SettingsError::InvalidValue(
                "heartbeat.maxMissed must be > 0".into(),
            ));
        }
        if self.connection.outbound_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "connection.outboundQueueCapacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}
