//! Gateway error taxonomy.
//!
//! Four domains, each with a machine-readable code:
//!
//! - [`AuthError`]: connection admission failures (token and key set)
//! - [`RoutingError`]: control-plane delivery failures
//! - [`ProtocolError`]: a single bad inbound message
//! - [`ResourceError`]: liveness and capacity violations that force-close a socket
//!
//! [`GatewayError`] wraps all four. `Display` output may carry internal detail
//! for logs; anything sent to a device or control-plane caller goes through
//! [`GatewayError::public_message`] instead.

use thiserror::Error;

/// WebSocket close codes sent when the gateway terminates a connection.
///
/// Application codes live in the 4000–4999 range reserved by RFC 6455.
pub mod close_code {
    /// Server is shutting down.
    pub const GOING_AWAY: u16 = 1001;
    /// Token could not be parsed.
    pub const MALFORMED: u16 = 4001;
    /// Token expiry is in the past beyond the allowed skew.
    pub const EXPIRED: u16 = 4002;
    /// Issuer claim does not match.
    pub const BAD_ISSUER: u16 = 4003;
    /// Audience claim does not contain the expected audience.
    pub const BAD_AUDIENCE: u16 = 4004;
    /// Token key id is absent from the issuer key set.
    pub const NO_MATCHING_KEY: u16 = 4005;
    /// Signature did not verify.
    pub const BAD_SIGNATURE: u16 = 4006;
    /// Issuer key set could not be obtained.
    pub const KEY_FETCH_FAILED: u16 = 4007;
    /// Token subject is not the account being connected to.
    pub const SUBJECT_MISMATCH: u16 = 4008;
    /// A newer connection with the same id replaced this one.
    pub const SUPERSEDED: u16 = 4009;
    /// Two heartbeat intervals passed without liveness.
    pub const HEARTBEAT_TIMEOUT: u16 = 4010;
    /// Outbound queue overflowed.
    pub const BACKPRESSURE_EXCEEDED: u16 = 4011;
    /// Closed because of a protocol violation (only when configured).
    pub const PROTOCOL_ERROR: u16 = 4012;
}

// ─────────────────────────────────────────────────────────────────────────────
// AuthError
// ─────────────────────────────────────────────────────────────────────────────

/// Why a connection attempt was refused.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Token is not three well-formed segments or lacks required claims.
    #[error("malformed token: {0}")]
    Malformed(String),
    /// Token expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim does not equal the expected issuer.
    #[error("unexpected issuer")]
    BadIssuer,
    /// Audience claim does not contain the expected audience.
    #[error("audience not accepted")]
    BadAudience,
    /// No key in the issuer key set carries the token's key id.
    #[error("no verification key for kid {kid:?}")]
    NoMatchingKey {
        /// Key id declared by the token header, if any.
        kid: Option<String>,
    },
    /// Signature did not verify against the matching key.
    #[error("signature verification failed")]
    BadSignature,
    /// Key set unavailable and no usable stale copy exists.
    #[error("key set unavailable: {0}")]
    KeyFetchFailed(String),
    /// Token subject does not match the account in the connection path.
    #[error("token subject does not match account")]
    SubjectMismatch,
}

impl AuthError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "MALFORMED",
            Self::Expired => "EXPIRED",
            Self::BadIssuer => "BAD_ISSUER",
            Self::BadAudience => "BAD_AUDIENCE",
            Self::NoMatchingKey { .. } => "NO_MATCHING_KEY",
            Self::BadSignature => "BAD_SIGNATURE",
            Self::KeyFetchFailed(_) => "KEY_FETCH_FAILED",
            Self::SubjectMismatch => "SUBJECT_MISMATCH",
        }
    }

    /// WebSocket close code used when rejecting the socket.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Malformed(_) => close_code::MALFORMED,
            Self::Expired => close_code::EXPIRED,
            Self::BadIssuer => close_code::BAD_ISSUER,
            Self::BadAudience => close_code::BAD_AUDIENCE,
            Self::NoMatchingKey { .. } => close_code::NO_MATCHING_KEY,
            Self::BadSignature => close_code::BAD_SIGNATURE,
            Self::KeyFetchFailed(_) => close_code::KEY_FETCH_FAILED,
            Self::SubjectMismatch => close_code::SUBJECT_MISMATCH,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RoutingError
// ─────────────────────────────────────────────────────────────────────────────

/// Control-plane delivery failure.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// The targeted connection does not exist or is not ACTIVE.
    #[error("no active session {connection_id}")]
    NoSuchSession {
        /// The requested target.
        connection_id: String,
    },
    /// Broadcast requested but the account has no ACTIVE connection.
    #[error("account has no active connections")]
    NoActiveConnections,
    /// The account registry stopped while the request was in flight.
    #[error("account registry unavailable")]
    RegistryUnavailable,
}

impl RoutingError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoSuchSession { .. } => "NO_SUCH_SESSION",
            Self::NoActiveConnections => "NO_ACTIVE_CONNECTIONS",
            Self::RegistryUnavailable => "REGISTRY_UNAVAILABLE",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ProtocolError
// ─────────────────────────────────────────────────────────────────────────────

/// A single inbound message was rejected.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The envelope `type` has no entry in the dispatch table.
    #[error("unknown message type '{message_type}'")]
    UnknownMessageType {
        /// The offending type.
        message_type: String,
    },
    /// Not a JSON object, or missing a string `type`.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
}

impl ProtocolError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownMessageType { .. } => "UNKNOWN_MESSAGE_TYPE",
            Self::MalformedEnvelope(_) => "MALFORMED_ENVELOPE",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ResourceError
// ─────────────────────────────────────────────────────────────────────────────

/// Reason a live connection was force-closed by the gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ResourceError {
    /// No heartbeat or pong within two intervals.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,
    /// Outbound queue exceeded its bound.
    #[error("outbound queue full")]
    BackpressureExceeded,
    /// Replaced by a newer connection with the same id.
    #[error("superseded by a newer connection")]
    Superseded,
}

impl ResourceError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            Self::BackpressureExceeded => "BACKPRESSURE_EXCEEDED",
            Self::Superseded => "SUPERSEDED",
        }
    }

    /// WebSocket close code used when closing the socket.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::HeartbeatTimeout => close_code::HEARTBEAT_TIMEOUT,
            Self::BackpressureExceeded => close_code::BACKPRESSURE_EXCEEDED,
            Self::Superseded => close_code::SUPERSEDED,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// GatewayError
// ─────────────────────────────────────────────────────────────────────────────

/// Any gateway error.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Admission failure.
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// Delivery failure.
    #[error(transparent)]
    Routing(#[from] RoutingError),
    /// Bad inbound message.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Liveness or capacity violation.
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

impl GatewayError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(e) => e.code(),
            Self::Routing(e) => e.code(),
            Self::Protocol(e) => e.code(),
            Self::Resource(e) => e.code(),
        }
    }

    /// Fixed, detail-free message safe to send to devices and callers.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::Auth(_) => "authentication failed",
            Self::Routing(RoutingError::NoSuchSession { .. }) => "no such session",
            Self::Routing(RoutingError::NoActiveConnections) => "no active connections",
            Self::Routing(RoutingError::RegistryUnavailable) => "registry unavailable",
            Self::Protocol(ProtocolError::UnknownMessageType { .. }) => "unknown message type",
            Self::Protocol(ProtocolError::MalformedEnvelope(_)) => "malformed envelope",
            Self::Resource(ResourceError::HeartbeatTimeout) => "heartbeat timeout",
            Self::Resource(ResourceError::BackpressureExceeded) => "backpressure exceeded",
            Self::Resource(ResourceError::Superseded) => "superseded",
        }
    }

    /// Close code when this error terminates a socket.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Auth(e) => e.close_code(),
            Self::Resource(e) => e.close_code(),
            Self::Protocol(_) | Self::Routing(_) => close_code::PROTOCOL_ERROR,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn auth_codes_are_distinct() {
        let errors = [
            AuthError::Malformed("x".into()),
            AuthError::Expired,
            AuthError::BadIssuer,
            AuthError::BadAudience,
            AuthError::NoMatchingKey { kid: None },
            AuthError::BadSignature,
            AuthError::KeyFetchFailed("x".into()),
            AuthError::SubjectMismatch,
        ];
        let mut close_codes: Vec<u16> = errors.iter().map(AuthError::close_code).collect();
        close_codes.sort_unstable();
        close_codes.dedup();
        assert_eq!(close_codes.len(), errors.len());
        assert!(close_codes.iter().all(|c| (4000..5000).contains(c)));
    }

    #[test]
    fn no_matching_key_display_includes_kid() {
        let err = AuthError::NoMatchingKey {
            kid: Some("k9".into()),
        };
        assert!(err.to_string().contains("k9"));
        assert_eq!(err.code(), "NO_MATCHING_KEY");
    }

    #[test]
    fn routing_error_codes() {
        let err = RoutingError::NoSuchSession {
            connection_id: "dev-A".into(),
        };
        assert_eq!(err.code(), "NO_SUCH_SESSION");
        assert_eq!(RoutingError::NoActiveConnections.code(), "NO_ACTIVE_CONNECTIONS");
    }

    #[test]
    fn public_message_hides_detail() {
        let err = GatewayError::from(AuthError::Malformed("payload: {\"sub\":\"secret\"}".into()));
        assert_eq!(err.public_message(), "authentication failed");
        assert!(!err.public_message().contains("secret"));
        assert!(err.to_string().contains("secret"));
    }

    #[test]
    fn gateway_error_delegates_code() {
        let err: GatewayError = ProtocolError::UnknownMessageType {
            message_type: "bogus".into(),
        }
        .into();
        assert_eq!(err.code(), "UNKNOWN_MESSAGE_TYPE");
        assert_eq!(err.close_code(), close_code::PROTOCOL_ERROR);
        assert_matches!(err, GatewayError::Protocol(_));
    }

    #[test]
    fn resource_close_codes() {
        assert_eq!(
            GatewayError::from(ResourceError::HeartbeatTimeout).close_code(),
            close_code::HEARTBEAT_TIMEOUT
        );
        assert_eq!(
            ResourceError::BackpressureExceeded.close_code(),
            close_code::BACKPRESSURE_EXCEEDED
        );
    }
}
