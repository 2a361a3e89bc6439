//! Key-set fetch errors.
//!
//! Token validation failures use [`tether_core::AuthError`]; this module only
//! covers the network side. `FetchError` is `Clone` because one fetch result
//! is handed to every caller waiting on it.

use thiserror::Error;

/// Why a key set could not be obtained.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The key endpoint answered with a non-success status.
    #[error("key endpoint returned HTTP {status}")]
    Http {
        /// HTTP status code.
        status: u16,
    },
    /// Connection, TLS or body read failure.
    #[error("key endpoint unreachable: {0}")]
    Transport(String),
    /// The response was not a usable JWK set.
    #[error("invalid key set: {0}")]
    InvalidKeySet(String),
    /// The fetch exceeded its deadline.
    #[error("key fetch timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured deadline.
        timeout_ms: u64,
    },
    /// A previous failure put the domain in backoff and no stale copy exists.
    #[error("key fetch backing off for another {retry_in_ms}ms")]
    BackingOff {
        /// Time until the next network attempt.
        retry_in_ms: u64,
    },
}

impl FetchError {
    /// Label used for the fetch outcome metric.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http { .. } => "http",
            Self::Transport(_) => "transport",
            Self::InvalidKeySet(_) => "invalid",
            Self::Timeout { .. } => "timeout",
            Self::BackingOff { .. } => "backoff",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            Self::Http {
                status: status.as_u16(),
            }
        } else {
            Self::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(
            FetchError::Http { status: 503 }.to_string(),
            "key endpoint returned HTTP 503"
        );
        assert_eq!(
            FetchError::Timeout { timeout_ms: 5000 }.to_string(),
            "key fetch timed out after 5000ms"
        );
    }

    #[test]
    fn kinds() {
        assert_eq!(FetchError::Transport("x".into()).kind(), "transport");
        assert_eq!(FetchError::BackingOff { retry_in_ms: 1 }.kind(), "backoff");
    }
}
