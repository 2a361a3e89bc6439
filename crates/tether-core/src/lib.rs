//! # tether-core
//!
//! Foundation types shared by every Tether crate:
//!
//! - **Branded IDs**: `AccountId`, `ConnectionId` as newtypes for type safety
//! - **Errors**: the gateway error taxonomy (`AuthError`, `RoutingError`,
//!   `ProtocolError`, `ResourceError`) with wire codes and WebSocket close codes
//! - **Envelope**: the JSON message envelope exchanged with devices
//! - **Logging**: `tracing` subscriber bootstrap
//! - **Metrics**: metric name constants
//! - **Retry**: exponential backoff math

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod metrics;
pub mod retry;

pub use envelope::Envelope;
pub use errors::{AuthError, GatewayError, ProtocolError, ResourceError, RoutingError};
pub use ids::{AccountId, ConnectionId};
