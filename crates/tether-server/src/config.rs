//! Runtime configuration resolved from [`GatewaySettings`].

use std::time::Duration;

use tether_auth::ValidationOptions;
use tether_settings::{GatewaySettings, RouterSettings, SettingsError};

/// Liveness policy applied to every connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    /// Heartbeat interval H.
    pub interval: Duration,
    /// Consecutive silent intervals tolerated before closing.
    pub max_missed: u32,
    /// When false, admitted connections are ACTIVE immediately.
    pub required: bool,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_missed: 2,
            required: true,
        }
    }
}

/// Configuration for the gateway server.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// How long shutdown waits for sockets to drain.
    pub shutdown_timeout: Duration,
    /// Token requirements for admission.
    pub validation: ValidationOptions,
    /// Require the token subject to equal the account in the path.
    pub bind_subject: bool,
    /// Heartbeat policy.
    pub heartbeat: HeartbeatPolicy,
    /// Inbound dispatch settings.
    pub router: RouterSettings,
    /// Bound on each connection's outbound queue.
    pub outbound_queue_capacity: usize,
    /// Serve the control-plane routes.
    pub control_plane_enabled: bool,
    /// Bearer key required on control-plane routes, if set.
    pub api_key: Option<String>,
    /// Response wait used when a route request gives no `timeoutMs`.
    pub default_route_timeout: Duration,
    /// Capacity of the device event broadcast channel.
    pub event_channel_capacity: usize,
}

impl GatewayConfig {
    /// Default configuration accepting tokens that satisfy `validation`.
    pub fn new(validation: ValidationOptions) -> Self {
        let defaults = GatewaySettings::default();
        Self {
            host: defaults.server.host,
            port: defaults.server.port,
            max_message_size: defaults.server.max_message_size,
            shutdown_timeout: Duration::from_millis(defaults.server.shutdown_timeout_ms),
            validation,
            bind_subject: defaults.auth.bind_subject,
            heartbeat: HeartbeatPolicy::default(),
            router: defaults.router,
            outbound_queue_capacity: defaults.connection.outbound_queue_capacity,
            control_plane_enabled: defaults.control_plane.enabled,
            api_key: defaults.control_plane.api_key,
            default_route_timeout: Duration::from_millis(
                defaults.control_plane.default_route_timeout_ms,
            ),
            event_channel_capacity: defaults.control_plane.event_channel_capacity,
        }
    }

    /// Resolve a validated settings tree.
    pub fn from_settings(settings: &GatewaySettings) -> Result<Self, SettingsError> {
        settings.validate()?;
        Ok(Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_message_size: settings.server.max_message_size,
            shutdown_timeout: Duration::from_millis(settings.server.shutdown_timeout_ms),
            validation: ValidationOptions::from_settings(&settings.auth)?,
            bind_subject: settings.auth.bind_subject,
            heartbeat: HeartbeatPolicy {
                interval: Duration::from_secs(settings.heartbeat.interval_secs),
                max_missed: settings.heartbeat.max_missed,
                required: settings.heartbeat.require_heartbeat,
            },
            router: settings.router.clone(),
            outbound_queue_capacity: settings.connection.outbound_queue_capacity,
            control_plane_enabled: settings.control_plane.enabled,
            api_key: settings
                .control_plane
                .api_key
                .clone()
                .filter(|k| !k.is_empty()),
            default_route_timeout: Duration::from_millis(
                settings.control_plane.default_route_timeout_ms,
            ),
            event_channel_capacity: settings.control_plane.event_channel_capacity.max(1),
        })
    }

    /// Snapshots older than this are reported stale (2×H).
    pub fn directory_max_age(&self) -> Duration {
        self.heartbeat.interval * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn configured() -> GatewaySettings {
        let mut s = GatewaySettings::default();
        s.auth.issuer = "https://id.example.com/".into();
        s.auth.audience = "tether".into();
        s
    }

    #[test]
    fn from_settings_resolves_durations() {
        let mut s = configured();
        s.heartbeat.interval_secs = 5;
        s.control_plane.default_route_timeout_ms = 2500;
        let cfg = GatewayConfig::from_settings(&s).unwrap();
        assert_eq!(cfg.heartbeat.interval, Duration::from_secs(5));
        assert_eq!(cfg.default_route_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.directory_max_age(), Duration::from_secs(10));
        assert_eq!(cfg.validation.key_domain, "id.example.com");
    }

    #[test]
    fn from_settings_rejects_invalid() {
        let s = GatewaySettings::default();
        assert_matches!(
            GatewayConfig::from_settings(&s),
            Err(SettingsError::InvalidValue(_))
        );
    }

    #[test]
    fn empty_api_key_means_open() {
        let mut s = configured();
        s.control_plane.api_key = Some(String::new());
        let cfg = GatewayConfig::from_settings(&s).unwrap();
        assert!(cfg.api_key.is_none());
    }

    #[test]
    fn new_uses_defaults() {
        let cfg = GatewayConfig::new(ValidationOptions {
            issuer: "https://id.example.com/".into(),
            audience: "tether".into(),
            key_domain: "id.example.com".into(),
            clock_skew: Duration::from_secs(60),
        });
        assert_eq!(cfg.heartbeat, HeartbeatPolicy::default());
        assert_eq!(cfg.outbound_queue_capacity, 256);
        assert!(cfg.bind_subject);
        assert!(cfg.control_plane_enabled);
    }
}
