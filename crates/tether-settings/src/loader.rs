//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`GatewaySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `TETHER_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{GatewaySettings, UnknownTypePolicy};

/// Resolve the default settings file path (`~/.tether/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tether").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<GatewaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<GatewaySettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<GatewaySettings> {
    let defaults = serde_json::to_value(GatewaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_owned(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_owned(),
            source,
        })?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `TETHER_*` environment variable overrides.
///
/// Integers must parse and fall within range, booleans accept
/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`. Invalid values are
/// ignored with a warning.
pub fn apply_env_overrides(settings: &mut GatewaySettings) {
    apply_overrides(settings, &|name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable source.
pub fn apply_overrides(settings: &mut GatewaySettings, lookup: &dyn Fn(&str) -> Option<String>) {
    let vars = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = vars.string("TETHER_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = vars.u16("TETHER_PORT", 0, 65535) {
        settings.server.port = v;
    }

    // ── Auth ────────────────────────────────────────────────────────
    if let Some(v) = vars.string("TETHER_AUTH_ISSUER") {
        settings.auth.issuer = v;
    }
    if let Some(v) = vars.string("TETHER_AUTH_AUDIENCE") {
        settings.auth.audience = v;
    }
    if let Some(v) = vars.string("TETHER_AUTH_ISSUER_DOMAIN") {
        settings.auth.issuer_domain = Some(v);
    }
    if let Some(v) = vars.u64("TETHER_AUTH_CLOCK_SKEW_SECS", 0, 3600) {
        settings.auth.clock_skew_secs = v;
    }
    if let Some(v) = vars.bool("TETHER_AUTH_BIND_SUBJECT") {
        settings.auth.bind_subject = v;
    }
    if let Some(v) = vars.string("TETHER_KEY_SET_URL_TEMPLATE") {
        settings.auth.key_set.url_template = v;
    }
    if let Some(v) = vars.u64("TETHER_KEY_SET_TTL_SECS", 1, 86_400) {
        settings.auth.key_set.ttl_secs = v;
    }

    // ── Heartbeat ───────────────────────────────────────────────────
    if let Some(v) = vars.u64("TETHER_HEARTBEAT_INTERVAL_SECS", 1, 3600) {
        settings.heartbeat.interval_secs = v;
    }
    if let Some(v) = vars.bool("TETHER_REQUIRE_HEARTBEAT") {
        settings.heartbeat.require_heartbeat = v;
    }

    // ── Router / connection ─────────────────────────────────────────
    if let Some(v) = vars.string("TETHER_UNKNOWN_TYPE_POLICY") {
        match UnknownTypePolicy::parse(&v) {
            Some(policy) => settings.router.unknown_type_policy = policy,
            None => warn!(key = "TETHER_UNKNOWN_TYPE_POLICY", value = %v, "invalid policy env var, ignoring"),
        }
    }
    if let Some(v) = vars.usize("TETHER_OUTBOUND_QUEUE_CAPACITY", 1, 65_536) {
        settings.connection.outbound_queue_capacity = v;
    }

    // ── Control plane / logging ─────────────────────────────────────
    if let Some(v) = vars.string("TETHER_CONTROL_API_KEY") {
        settings.control_plane.api_key = Some(v);
    }
    if let Some(v) = vars.string("TETHER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = vars.string("TETHER_LOG_FORMAT") {
        settings.logging.format = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Variable readers ────────────────────────────────────────────────────────

struct EnvReader<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl EnvReader<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.lookup)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.lookup)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::errors::SettingsError;

    fn overrides(pairs: &[(&str, &str)]) -> GatewaySettings {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let mut settings = GatewaySettings::default();
        apply_overrides(&mut settings, &|name| map.get(name).cloned());
        settings
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({
            "server": {"port": 8080, "host": "localhost"}
        });
        let source = serde_json::json!({
            "server": {"port": 9090}
        });
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"forwardTypes": ["response", "event"]});
        let source = serde_json::json!({"forwardTypes": ["status"]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["forwardTypes"], serde_json::json!(["status"]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 42);
    }

    // ── file layer ──────────────────────────────────────────────────

    #[test]
    fn missing_file_returns_defaults() {
        let settings = load_file_layer(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.heartbeat.interval_secs, 30);
    }

    #[test]
    fn partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{
                "server": {"port": 9090},
                "auth": {"issuer": "https://id.example.com/", "keySet": {"ttlSecs": 120}},
                "router": {"unknownTypePolicy": "reject"}
            }"#,
        )
        .unwrap();

        let settings = load_file_layer(&path).unwrap();
        assert_eq!(settings.server.port, 9090);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.auth.issuer, "https://id.example.com/");
        assert_eq!(settings.auth.key_set.ttl_secs, 120);
        assert_eq!(settings.auth.key_set.max_stale_secs, 86_400);
        assert_eq!(settings.router.unknown_type_policy, UnknownTypePolicy::Reject);
        assert_eq!(settings.router.forward_types, vec!["response", "event"]);
    }

    #[test]
    fn file_sets_optional_api_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"controlPlane": {"apiKey": "s3cret"}}"#).unwrap();
        let settings = load_file_layer(&path).unwrap();
        assert_eq!(settings.control_plane.api_key.as_deref(), Some("s3cret"));
    }

    #[test]
    fn invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();

        let result = load_file_layer(&path);
        assert!(matches!(result.unwrap_err(), SettingsError::Parse { .. }));
    }

    #[test]
    fn wrong_type_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"heartbeat": {"intervalSecs": "soon"}}"#).unwrap();
        assert!(matches!(load_file_layer(&path).unwrap_err(), SettingsError::Schema(_)));
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn env_overrides_apply() {
        let s = overrides(&[
            ("TETHER_PORT", "9443"),
            ("TETHER_AUTH_ISSUER", "https://id.example.com/"),
            ("TETHER_AUTH_AUDIENCE", "tether"),
            ("TETHER_HEARTBEAT_INTERVAL_SECS", "15"),
            ("TETHER_REQUIRE_HEARTBEAT", "off"),
            ("TETHER_UNKNOWN_TYPE_POLICY", "echo"),
            ("TETHER_CONTROL_API_KEY", "k"),
        ]);
        assert_eq!(s.server.port, 9443);
        assert_eq!(s.auth.issuer, "https://id.example.com/");
        assert_eq!(s.auth.audience, "tether");
        assert_eq!(s.heartbeat.interval_secs, 15);
        assert!(!s.heartbeat.require_heartbeat);
        assert_eq!(s.router.unknown_type_policy, UnknownTypePolicy::Echo);
        assert_eq!(s.control_plane.api_key.as_deref(), Some("k"));
    }

    #[test]
    fn invalid_env_values_ignored() {
        let s = overrides(&[
            ("TETHER_PORT", "99999"),
            ("TETHER_HEARTBEAT_INTERVAL_SECS", "0"),
            ("TETHER_AUTH_BIND_SUBJECT", "maybe"),
            ("TETHER_UNKNOWN_TYPE_POLICY", "ignore"),
            ("TETHER_HOST", ""),
        ]);
        let d = GatewaySettings::default();
        assert_eq!(s.server.port, d.server.port);
        assert_eq!(s.server.host, d.server.host);
        assert_eq!(s.heartbeat.interval_secs, d.heartbeat.interval_secs);
        assert!(s.auth.bind_subject);
        assert_eq!(s.router.unknown_type_policy, UnknownTypePolicy::Drop);
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for val in &["true", "1", "yes", "on", "TRUE", "Yes"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in &["false", "0", "no", "off", "OFF"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("9090", 1, 65535), Some(9090));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u16_range("99999", 1, 65535), None);
        assert_eq!(parse_u64_range("30", 1, 3600), Some(30));
        assert_eq!(parse_u64_range("abc", 1, 3600), None);
        assert_eq!(parse_usize_range("256", 1, 65_536), Some(256));
        assert_eq!(parse_usize_range("0", 1, 65_536), None);
    }
}
