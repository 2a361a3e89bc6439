//! Typed identity token claims.
//!
//! The five registered claims the gateway relies on are typed fields. Every
//! other claim lands in one `extensions` map and is never interpreted.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The `aud` claim: a single string or an array of strings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    /// `"aud": "tether"`
    One(String),
    /// `"aud": ["tether", "other"]`
    Many(Vec<String>),
}

impl Audience {
    /// Whether `expected` is (one of) the audience(s).
    pub fn contains(&self, expected: &str) -> bool {
        match self {
            Self::One(aud) => aud == expected,
            Self::Many(auds) => auds.iter().any(|a| a == expected),
        }
    }
}

/// Verified token claims. Immutable after parsing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    sub: String,
    iss: String,
    aud: Audience,
    exp: i64,
    iat: i64,
    #[serde(flatten)]
    extensions: Map<String, Value>,
}

impl Claims {
    /// Subject (`sub`).
    pub fn subject(&self) -> &str {
        &self.sub
    }

    /// Issuer (`iss`).
    pub fn issuer(&self) -> &str {
        &self.iss
    }

    /// Audience (`aud`).
    pub fn audience(&self) -> &Audience {
        &self.aud
    }

    /// Expiry (`exp`), seconds since the Unix epoch.
    pub fn expires_at(&self) -> i64 {
        self.exp
    }

    /// Issue time (`iat`), seconds since the Unix epoch.
    pub fn issued_at(&self) -> i64 {
        self.iat
    }

    /// All claims other than the typed ones.
    pub fn extensions(&self) -> &Map<String, Value> {
        &self.extensions
    }

    /// One extension claim by name.
    pub fn extension(&self, name: &str) -> Option<&Value> {
        self.extensions.get(name)
    }
}
