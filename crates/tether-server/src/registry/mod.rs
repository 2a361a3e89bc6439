//! Per-account connection registries.
//!
//! Each account with live sockets has one [`actor`] task that owns its
//! connection table and processes commands one at a time. Callers talk to it
//! through a cloneable [`RegistryHandle`]; the [`RegistryHub`] finds or spawns
//! the actor for an account. An actor stops once no handle to it remains.

pub mod actor;
pub mod hub;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tether_auth::TokenValidator;
use tether_core::{AccountId, ConnectionId, Envelope, GatewayError, ProtocolError, RoutingError};
use tokio::sync::{mpsc, oneshot};

use crate::config::GatewayConfig;
use crate::directory::{SessionDirectory, SessionStatus};
use crate::events::EventSender;
use crate::websocket::connection::{ConnectionLink, DeviceMetadata};
use crate::websocket::router::MessageRouter;

pub use hub::RegistryHub;

/// Dependencies shared by every registry actor.
pub struct RegistryContext {
    /// Token validator (shared key-set cache).
    pub validator: TokenValidator,
    /// Resolved gateway configuration.
    pub config: Arc<GatewayConfig>,
    /// Inbound dispatch table.
    pub router: Arc<MessageRouter>,
    /// Session snapshots.
    pub directory: Arc<SessionDirectory>,
    /// Device event fan-out.
    pub events: EventSender,
}

/// What a device asked for when connecting.
#[derive(Clone, Debug, Default)]
pub struct AdmissionRequest {
    /// Connection id the device wants (`deviceId`); generated when absent.
    pub requested_id: Option<ConnectionId>,
    /// Device metadata.
    pub metadata: DeviceMetadata,
}

/// A successfully admitted connection, handed back to the socket task.
#[derive(Debug)]
pub struct Admission {
    /// Assigned connection id.
    pub connection_id: ConnectionId,
    /// Shared link; the registry holds the other end.
    pub link: Arc<ConnectionLink>,
    /// Frames queued for this socket, starting with `connection.established`.
    pub outbound: mpsc::Receiver<Arc<String>>,
}

/// Per-connection outcome of a route.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    /// Connections the message was queued to.
    pub delivered_to: Vec<ConnectionId>,
    /// Connections that could not take it (closed, or queue overflow).
    pub failed: Vec<ConnectionId>,
}

/// Result of [`RegistryHandle::route_and_await`].
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteOutcome {
    /// Where the request went.
    #[serde(flatten)]
    pub delivery: DeliveryResult,
    /// The device's reply, if one arrived in time.
    pub response: Option<Envelope>,
    /// Whether the wait expired.
    pub timed_out: bool,
}

/// Reply channel for a routed request awaiting its response.
pub(crate) type AwaitReply = oneshot::Sender<Result<(DeliveryResult, oneshot::Receiver<Envelope>), GatewayError>>;

/// Commands processed by a registry actor.
pub(crate) enum Command {
    Connect {
        token: String,
        request: AdmissionRequest,
        reply: oneshot::Sender<Result<Admission, GatewayError>>,
    },
    Activate {
        connection_id: ConnectionId,
        link: Arc<ConnectionLink>,
    },
    Disconnect {
        connection_id: ConnectionId,
        link: Arc<ConnectionLink>,
    },
    Inbound {
        connection_id: ConnectionId,
        link: Arc<ConnectionLink>,
        envelope: Envelope,
        handled: bool,
    },
    Route {
        target: Option<ConnectionId>,
        envelope: Envelope,
        reply: oneshot::Sender<Result<DeliveryResult, RoutingError>>,
    },
    RouteAwait {
        target: Option<ConnectionId>,
        envelope: Envelope,
        correlation_id: String,
        reply: AwaitReply,
    },
    ForgetPending {
        correlation_id: String,
    },
    Status {
        reply: oneshot::Sender<Vec<SessionStatus>>,
    },
}

/// Cloneable handle to one account's registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    account_id: AccountId,
    tx: mpsc::Sender<Command>,
}

impl RegistryHandle {
    pub(crate) fn new(account_id: AccountId, tx: mpsc::Sender<Command>) -> Self {
        Self { account_id, tx }
    }

    /// Account this handle addresses.
    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    /// Validate `token` and admit a connection.
    pub async fn connect(
        &self,
        token: &str,
        request: AdmissionRequest,
    ) -> Result<Admission, GatewayError> {
        self.request(|reply| Command::Connect {
            token: token.to_owned(),
            request,
            reply,
        })
        .await?
    }

    /// First liveness signal seen on an AUTHENTICATED connection.
    pub async fn activate(&self, connection_id: &ConnectionId, link: &Arc<ConnectionLink>) {
        let _ = self
            .tx
            .send(Command::Activate {
                connection_id: connection_id.clone(),
                link: Arc::clone(link),
            })
            .await;
    }

    /// Remove a connection whose socket ended.
    pub async fn disconnect(&self, connection_id: &ConnectionId, link: &Arc<ConnectionLink>) {
        let _ = self
            .tx
            .send(Command::Disconnect {
                connection_id: connection_id.clone(),
                link: Arc::clone(link),
            })
            .await;
    }

    /// Hand an inbound application message to the registry.
    ///
    /// `handled` is false when no handler is registered for the type; the
    /// registry then accepts it only as a reply to a pending request.
    pub async fn inbound(
        &self,
        connection_id: &ConnectionId,
        link: &Arc<ConnectionLink>,
        envelope: Envelope,
        handled: bool,
    ) {
        let _ = self
            .tx
            .send(Command::Inbound {
                connection_id: connection_id.clone(),
                link: Arc::clone(link),
                envelope,
                handled,
            })
            .await;
    }

    /// Deliver `envelope` to one connection, or every ACTIVE connection.
    ///
    /// `target` overrides the envelope's own `targetConnectionId`.
    pub async fn route(
        &self,
        envelope: Envelope,
        target: Option<ConnectionId>,
    ) -> Result<DeliveryResult, RoutingError> {
        let target = resolve_target(&envelope, target);
        self.request(|reply| Command::Route {
            target,
            envelope,
            reply,
        })
        .await?
    }

    /// Route and wait up to `timeout` for an inbound message carrying the
    /// same `correlationId`.
    pub async fn route_and_await(
        &self,
        envelope: Envelope,
        target: Option<ConnectionId>,
        timeout: Duration,
    ) -> Result<RouteOutcome, GatewayError> {
        let Some(correlation_id) = envelope.correlation_id().map(str::to_owned) else {
            return Err(ProtocolError::MalformedEnvelope(
                "correlationId is required to await a response".into(),
            )
            .into());
        };
        let target = resolve_target(&envelope, target);
        let (delivery, response) = self
            .request(|reply| Command::RouteAwait {
                target,
                envelope,
                correlation_id: correlation_id.clone(),
                reply,
            })
            .await??;

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(reply)) => Ok(RouteOutcome {
                delivery,
                response: Some(reply),
                timed_out: false,
            }),
            _ => {
                let _ = self.tx.send(Command::ForgetPending { correlation_id }).await;
                Ok(RouteOutcome {
                    delivery,
                    response: None,
                    timed_out: true,
                })
            }
        }
    }

    /// Current connections, read from the actor.
    pub async fn status(&self) -> Result<Vec<SessionStatus>, RoutingError> {
        self.request(|reply| Command::Status { reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RoutingError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| RoutingError::RegistryUnavailable)?;
        rx.await.map_err(|_| RoutingError::RegistryUnavailable)
    }
}

fn resolve_target(envelope: &Envelope, target: Option<ConnectionId>) -> Option<ConnectionId> {
    target.or_else(|| envelope.target_connection_id().map(ConnectionId::from))
}
