//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Feature switches reported by `/health`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthFeatures {
    /// Control-plane routes are served.
    pub control_plane: bool,
    /// Control-plane routes require a bearer key.
    pub api_key_required: bool,
    /// Connections wait for a heartbeat before becoming active.
    pub require_heartbeat: bool,
    /// Token subject must equal the account id.
    pub bind_subject: bool,
}

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"shutting_down"` once shutdown has begun.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Device connections across all accounts.
    pub connections: usize,
    /// Accounts with a running registry.
    pub accounts: usize,
    /// Issuer domains with a cached key set.
    pub key_sets_cached: usize,
    /// Enabled features.
    pub features: HealthFeatures,
}

/// Live counters feeding [`health_check`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthCounters {
    /// Device connections.
    pub connections: usize,
    /// Running registries.
    pub accounts: usize,
    /// Cached key sets.
    pub key_sets_cached: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    shutting_down: bool,
    counters: HealthCounters,
    features: HealthFeatures,
) -> HealthResponse {
    HealthResponse {
        status: if shutting_down { "shutting_down" } else { "ok" }.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: counters.connections,
        accounts: counters.accounts,
        key_sets_cached: counters.key_sets_cached,
        features,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features() -> HealthFeatures {
        HealthFeatures {
            control_plane: true,
            api_key_required: false,
            require_heartbeat: true,
            bind_subject: true,
        }
    }

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), false, HealthCounters::default(), features());
        assert_eq!(resp.status, "ok");
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn status_reports_shutdown() {
        let resp = health_check(Instant::now(), true, HealthCounters::default(), features());
        assert_eq!(resp.status, "shutting_down");
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        let resp = health_check(start, false, HealthCounters::default(), features());
        assert!(resp.uptime_secs >= 59);
    }

    #[test]
    fn serialization() {
        let counters = HealthCounters {
            connections: 2,
            accounts: 1,
            key_sets_cached: 1,
        };
        let resp = health_check(Instant::now(), false, counters, features());
        let parsed = serde_json::to_value(&resp).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 2);
        assert_eq!(parsed["accounts"], 1);
        assert_eq!(parsed["key_sets_cached"], 1);
        assert_eq!(parsed["features"]["bind_subject"], true);
        assert!(parsed["uptime_secs"].is_number());
    }
}
