//! # tether-server
//!
//! Axum HTTP + `WebSocket` gateway for device sessions.
//!
//! - Device sockets at `/accounts/{account_id}/ws`: token admission,
//!   heartbeat monitoring, inbound dispatch
//! - One registry actor per account owning its connection table; routing,
//!   correlated request/response and device events go through it
//! - Control-plane API: session snapshots, message routing, SSE device events
//! - `/health` and Prometheus `/metrics`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod control;
pub mod directory;
pub mod events;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::{GatewayConfig, HeartbeatPolicy};
pub use directory::{DirectoryLookup, SessionDirectory, SessionStatus};
pub use events::DeviceEvent;
pub use registry::{Admission, AdmissionRequest, DeliveryResult, RegistryHandle, RegistryHub, RouteOutcome};
pub use server::GatewayServer;
pub use shutdown::ShutdownCoordinator;
