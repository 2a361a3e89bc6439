//! Device connection state.
//!
//! A [`Connection`] is owned by its account's registry actor. The parts that
//! the socket task and heartbeat monitor also need (outbound queue, liveness
//! flag, close signal) live in a shared [`ConnectionLink`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tether_core::errors::close_code;
use tether_core::{AccountId, ConnectionId, GatewayError, ResourceError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Lifecycle state. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Socket open, token not yet validated.
    Connecting,
    /// Token accepted, waiting for the first heartbeat.
    Authenticated,
    /// Receiving routed messages.
    Active,
    /// Close frame queued.
    Closing,
    /// Gone.
    Closed,
}

impl ConnectionState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: Self) -> bool {
        next > self
    }
}

/// Device-declared metadata from the upgrade request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetadata {
    /// Platform name, e.g. `ios`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Human-readable device name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Capabilities the device advertises.
    pub capabilities: Vec<String>,
}

impl DeviceMetadata {
    /// Parse a comma-separated capability list, dropping blanks and duplicates.
    pub fn parse_capabilities(raw: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for cap in raw.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            if !out.iter().any(|c| c == cap) {
                out.push(cap.to_owned());
            }
        }
        out
    }
}

/// Close code plus short reason sent in the WebSocket close frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloseReason {
    /// WebSocket close code.
    pub code: u16,
    /// Machine-readable reason text.
    pub reason: &'static str,
}

impl CloseReason {
    /// Server shutdown.
    pub const GOING_AWAY: Self = Self {
        code: close_code::GOING_AWAY,
        reason: "GOING_AWAY",
    };

    /// Normal closure after the device hung up.
    pub const NORMAL: Self = Self {
        code: 1000,
        reason: "NORMAL",
    };

    /// Close reason for a resource violation.
    pub fn resource(err: ResourceError) -> Self {
        Self {
            code: err.close_code(),
            reason: err.code(),
        }
    }
}

impl From<&GatewayError> for CloseReason {
    fn from(err: &GatewayError) -> Self {
        Self {
            code: err.close_code(),
            reason: err.code(),
        }
    }
}

/// Why [`ConnectionLink::send`] did not enqueue a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendFailure {
    /// Queue overflowed; the link is now closing with `BACKPRESSURE_EXCEEDED`.
    Backpressure,
    /// The link is already closed.
    Closed,
}

/// Shared handle between a socket task, its heartbeat monitor and the registry.
#[derive(Debug)]
pub struct ConnectionLink {
    tx: mpsc::Sender<Arc<String>>,
    alive: AtomicBool,
    last_seen: Mutex<DateTime<Utc>>,
    close: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
}

impl ConnectionLink {
    /// Create a link and the receiving end of its bounded outbound queue.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let link = Arc::new(Self {
            tx,
            alive: AtomicBool::new(false),
            last_seen: Mutex::new(Utc::now()),
            close: CancellationToken::new(),
            close_reason: Mutex::new(None),
        });
        (link, rx)
    }

    /// Enqueue a text frame without waiting.
    ///
    /// A full queue closes the link with `BACKPRESSURE_EXCEEDED`.
    pub fn send(&self, frame: Arc<String>) -> Result<(), SendFailure> {
        if self.is_closed() {
            return Err(SendFailure::Closed);
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.close(CloseReason::resource(ResourceError::BackpressureExceeded));
                Err(SendFailure::Backpressure)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendFailure::Closed),
        }
    }

    /// Record liveness (heartbeat, ping, pong).
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Utc::now();
    }

    /// Read and clear the liveness flag.
    ///
    /// Returns `true` if liveness was recorded since the last check.
    pub fn check_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }

    /// Last liveness signal, or link creation time.
    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.lock()
    }

    /// Request the socket be closed. The first reason wins.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.close.cancel();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Reason recorded by the first [`close`](Self::close).
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Resolves once the link is closed.
    pub async fn closed(&self) {
        self.close.cancelled().await;
    }
}

/// A device connection tracked by an account registry.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    account_id: AccountId,
    subject: String,
    metadata: DeviceMetadata,
    state: ConnectionState,
    created_at: DateTime<Utc>,
    link: Arc<ConnectionLink>,
}

impl Connection {
    /// A freshly authenticated connection.
    pub fn new(
        id: ConnectionId,
        account_id: AccountId,
        subject: String,
        metadata: DeviceMetadata,
        link: Arc<ConnectionLink>,
    ) -> Self {
        Self {
            id,
            account_id,
            subject,
            metadata,
            state: ConnectionState::Authenticated,
            created_at: Utc::now(),
            link,
        }
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Owning account.
    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    /// Token subject the connection was admitted with.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Device metadata.
    pub fn metadata(&self) -> &DeviceMetadata {
        &self.metadata
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Admission time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last heartbeat seen, if any arrived since admission.
    pub fn last_heartbeat_at(&self) -> Option<DateTime<Utc>> {
        let seen = self.link.last_seen();
        (seen > self.created_at).then_some(seen)
    }

    /// Shared link to the socket task.
    pub fn link(&self) -> &Arc<ConnectionLink> {
        &self.link
    }

    /// Whether `link` is this connection's link (not a superseded one).
    pub fn owns(&self, link: &Arc<ConnectionLink>) -> bool {
        Arc::ptr_eq(&self.link, link)
    }

    /// Move to `next` if that is forward. Returns whether the state changed.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Whether routed messages are delivered to this connection.
    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Active
    }
}
