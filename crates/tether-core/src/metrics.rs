//! Metric name constants shared across crates.

/// WebSocket connections admitted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Live device connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Device session duration seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Rejected connection attempts (counter, labels: code).
pub const AUTH_FAILURES_TOTAL: &str = "auth_failures_total";
/// Connections closed for missing heartbeats (counter).
pub const HEARTBEAT_TIMEOUTS_TOTAL: &str = "heartbeat_timeouts_total";
/// Connections closed on a full outbound queue (counter).
pub const BACKPRESSURE_CLOSES_TOTAL: &str = "backpressure_closes_total";
/// Messages routed to devices (counter, labels: mode).
pub const MESSAGES_ROUTED_TOTAL: &str = "messages_routed_total";
/// Routing requests that failed (counter, labels: code).
pub const ROUTING_ERRORS_TOTAL: &str = "routing_errors_total";
/// Inbound device messages forwarded to the control plane (counter).
pub const DEVICE_EVENTS_TOTAL: &str = "device_events_total";
/// Key-set fetch attempts (counter, labels: outcome).
pub const KEY_FETCHES_TOTAL: &str = "key_fetches_total";
/// Key-set fetch duration seconds (histogram).
pub const KEY_FETCH_DURATION_SECONDS: &str = "key_fetch_duration_seconds";
/// Live per-account registry actors (gauge).
pub const REGISTRY_ACTORS_ACTIVE: &str = "registry_actors_active";
