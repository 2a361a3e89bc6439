//! JSON message envelope exchanged with devices.
//!
//! Every frame is a JSON object with a string `type`. Two optional fields are
//! read by the gateway (`correlationId`, `targetConnectionId`); everything else
//! is opaque and travels untouched. An [`Envelope`] keeps the full parsed
//! object, so re-serializing it yields the same fields the sender supplied.

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};

use crate::errors::ProtocolError;

/// Inbound liveness signal from a device.
pub const TYPE_HEARTBEAT: &str = "heartbeat";
/// Reply to [`TYPE_HEARTBEAT`].
pub const TYPE_HEARTBEAT_ACK: &str = "heartbeat_ack";
/// Liveness check (either direction).
pub const TYPE_PING: &str = "ping";
/// Reply to [`TYPE_PING`].
pub const TYPE_PONG: &str = "pong";
/// Debug echo of an unrecognized inbound message.
pub const TYPE_ECHO: &str = "echo";
/// Error notification `{code, message}`.
pub const TYPE_ERROR: &str = "error";
/// First frame after a successful admission.
pub const TYPE_ESTABLISHED: &str = "connection.established";

/// An immutable, parsed message envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    message_type: String,
    correlation_id: Option<String>,
    target_connection_id: Option<String>,
    body: Arc<Value>,
}

impl Envelope {
    /// Parse an envelope from raw frame text.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::MalformedEnvelope(format!("invalid JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Build an envelope from an already-decoded JSON value.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(map) = &value else {
            return Err(ProtocolError::MalformedEnvelope(
                "envelope must be a JSON object".into(),
            ));
        };
        let message_type = match map.get("type") {
            Some(Value::String(t)) if !t.is_empty() => t.clone(),
            Some(_) => {
                return Err(ProtocolError::MalformedEnvelope(
                    "`type` must be a non-empty string".into(),
                ));
            }
            None => return Err(ProtocolError::MalformedEnvelope("missing `type`".into())),
        };
        let correlation_id = optional_string(map, "correlationId")?;
        let target_connection_id = optional_string(map, "targetConnectionId")?;
        Ok(Self {
            message_type,
            correlation_id,
            target_connection_id,
            body: Arc::new(value),
        })
    }

    /// The `type` field.
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// The `correlationId` field, if present.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// The `targetConnectionId` field, if present.
    pub fn target_connection_id(&self) -> Option<&str> {
        self.target_connection_id.as_deref()
    }

    /// The complete JSON object as received.
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Serialize to frame text.
    pub fn to_json(&self) -> String {
        self.body.to_string()
    }

    // ── Gateway-originated envelopes ────────────────────────────────────

    /// `{"type":"heartbeat_ack"}`
    pub fn heartbeat_ack() -> Self {
        Self::internal(TYPE_HEARTBEAT_ACK, json!({ "type": TYPE_HEARTBEAT_ACK }))
    }

    /// `{"type":"ping"}` liveness check.
    pub fn ping() -> Self {
        Self::internal(TYPE_PING, json!({ "type": TYPE_PING }))
    }

    /// `{"type":"pong"}`, echoing the ping's correlation id when present.
    pub fn pong(correlation_id: Option<&str>) -> Self {
        let mut body = json!({ "type": TYPE_PONG });
        if let Some(cid) = correlation_id {
            body["correlationId"] = Value::String(cid.to_owned());
        }
        let mut env = Self::internal(TYPE_PONG, body);
        env.correlation_id = correlation_id.map(str::to_owned);
        env
    }

    /// `{"type":"echo","original":{...}}`
    pub fn echo(original: &Envelope) -> Self {
        Self::internal(
            TYPE_ECHO,
            json!({ "type": TYPE_ECHO, "original": original.body() }),
        )
    }

    /// `{"type":"error","code":...,"message":...}`
    pub fn error(code: &str, message: &str) -> Self {
        Self::internal(
            TYPE_ERROR,
            json!({ "type": TYPE_ERROR, "code": code, "message": message }),
        )
    }

    /// First frame sent to an admitted device.
    pub fn established(account_id: &str, connection_id: &str, heartbeat_interval_secs: u64) -> Self {
        Self::internal(
            TYPE_ESTABLISHED,
            json!({
                "type": TYPE_ESTABLISHED,
                "accountId": account_id,
                "connectionId": connection_id,
                "heartbeatIntervalSecs": heartbeat_interval_secs,
            }),
        )
    }

    fn internal(message_type: &str, body: Value) -> Self {
        Self {
            message_type: message_type.to_owned(),
            correlation_id: None,
            target_connection_id: None,
            body: Arc::new(body),
        }
    }
}

fn optional_string(
    map: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<Option<String>, ProtocolError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ProtocolError::MalformedEnvelope(format!(
            "`{key}` must be a string"
        ))),
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.body.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parse_extracts_routing_fields() {
        let env = Envelope::parse(
            r#"{"type":"command","text":"hello","correlationId":"c1","targetConnectionId":"dev-A"}"#,
        )
        .unwrap();
        assert_eq!(env.message_type(), "command");
        assert_eq!(env.correlation_id(), Some("c1"));
        assert_eq!(env.target_connection_id(), Some("dev-A"));
        assert_eq!(env.body()["text"], "hello");
    }

    #[test]
    fn opaque_fields_survive_reserialization() {
        let raw = r#"{"type":"converse","payload":{"nested":[1,2,{"x":null}]},"extra":true}"#;
        let env = Envelope::parse(raw).unwrap();
        let back: Value = serde_json::from_str(&env.to_json()).unwrap();
        let original: Value = serde_json::from_str(raw).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn rejects_non_object() {
        assert_matches!(
            Envelope::parse("[1,2,3]"),
            Err(ProtocolError::MalformedEnvelope(_))
        );
    }

    #[test]
    fn rejects_invalid_json() {
        assert_matches!(
            Envelope::parse("not json"),
            Err(ProtocolError::MalformedEnvelope(_))
        );
    }

    #[test]
    fn rejects_missing_or_non_string_type() {
        assert!(Envelope::parse(r#"{"text":"hi"}"#).is_err());
        assert!(Envelope::parse(r#"{"type":42}"#).is_err());
        assert!(Envelope::parse(r#"{"type":""}"#).is_err());
    }

    #[test]
    fn rejects_non_string_correlation_id() {
        assert!(Envelope::parse(r#"{"type":"x","correlationId":7}"#).is_err());
    }

    #[test]
    fn null_optional_fields_are_absent() {
        let env = Envelope::parse(r#"{"type":"x","correlationId":null}"#).unwrap();
        assert!(env.correlation_id().is_none());
    }

    #[test]
    fn error_envelope_shape() {
        let env = Envelope::error("UNKNOWN_MESSAGE_TYPE", "unknown message type");
        let v: Value = serde_json::from_str(&env.to_json()).unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["code"], "UNKNOWN_MESSAGE_TYPE");
        assert_eq!(v["message"], "unknown message type");
    }

    #[test]
    fn pong_carries_correlation_id() {
        let env = Envelope::pong(Some("p-1"));
        assert_eq!(env.correlation_id(), Some("p-1"));
        assert_eq!(env.body()["correlationId"], "p-1");
        assert!(Envelope::pong(None).body().get("correlationId").is_none());
    }

    #[test]
    fn echo_wraps_original() {
        let original = Envelope::parse(r#"{"type":"mystery","n":1}"#).unwrap();
        let echo = Envelope::echo(&original);
        assert_eq!(echo.message_type(), TYPE_ECHO);
        assert_eq!(echo.body()["original"]["type"], "mystery");
    }

    #[test]
    fn serde_roundtrip_through_struct() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            message: Envelope,
        }
        let json = r#"{"message":{"type":"status","target":"lamp"}}"#;
        let w: Wrapper = serde_json::from_str(json).unwrap();
        assert_eq!(w.message.message_type(), "status");
        let back: Value = serde_json::to_value(&w).unwrap();
        assert_eq!(back, serde_json::from_str::<Value>(json).unwrap());
    }

    #[test]
    fn deserialize_rejects_bad_envelope() {
        let result: Result<Envelope, _> = serde_json::from_str(r#"{"no_type":1}"#);
        assert!(result.is_err());
    }
}
