//! # tether-auth
//!
//! Device identity verification for the Tether gateway.
//!
//! - [`KeySetCache`]: per-issuer JWK sets with TTL, single-flight fetches,
//!   stale fallback and exponential backoff
//! - [`TokenValidator`]: structure, claim and signature checks producing
//!   typed [`Claims`] or an [`AuthError`](tether_core::AuthError)

#![deny(unsafe_code)]

pub mod claims;
pub mod errors;
pub mod keyset;
pub mod validator;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use claims::{Audience, Claims};
pub use errors::FetchError;
pub use keyset::{
    HttpKeySetFetcher, KeyFamily, KeySet, KeySetCache, KeySetCacheConfig, KeySetFetcher,
    VerificationKey,
};
pub use validator::{TokenValidator, ValidationOptions};
