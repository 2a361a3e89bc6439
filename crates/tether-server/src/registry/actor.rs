//! The registry actor for one account.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use metrics::{counter, gauge};
use tether_core::metrics::{
    BACKPRESSURE_CLOSES_TOTAL, DEVICE_EVENTS_TOTAL, MESSAGES_ROUTED_TOTAL, REGISTRY_ACTORS_ACTIVE,
    ROUTING_ERRORS_TOTAL, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};
use tether_core::{
    AccountId, AuthError, ConnectionId, Envelope, GatewayError, ProtocolError, ResourceError,
    RoutingError,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::{Admission, AdmissionRequest, AwaitReply, Command, DeliveryResult, RegistryContext};
use crate::directory::SessionStatus;
use crate::events::DeviceEvent;
use crate::websocket::connection::{
    CloseReason, Connection, ConnectionLink, ConnectionState, SendFailure,
};
use crate::websocket::heartbeat::run_heartbeat;
use crate::websocket::router::{self, Action};

struct PendingResponse {
    reply: oneshot::Sender<Envelope>,
    expected_from: Vec<ConnectionId>,
}

/// Connection table and pending responses for one account.
pub(crate) struct AccountRegistry {
    account_id: AccountId,
    generation: u64,
    connections: BTreeMap<ConnectionId, Connection>,
    pending: HashMap<String, PendingResponse>,
    ctx: Arc<RegistryContext>,
}

impl AccountRegistry {
    pub(crate) fn new(account_id: AccountId, generation: u64, ctx: Arc<RegistryContext>) -> Self {
        Self {
            account_id,
            generation,
            connections: BTreeMap::new(),
            pending: HashMap::new(),
            ctx,
        }
    }

    /// Process commands until every sender is gone.
    ///
    /// The directory snapshot is republished once per heartbeat interval so
    /// it never ages past the staleness bound while the actor is alive.
    #[instrument(skip_all, fields(account_id = %self.account_id, generation = self.generation))]
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let interval = self.ctx.config.heartbeat.interval;
        let mut refresh = time::interval_at(Instant::now() + interval, interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        gauge!(REGISTRY_ACTORS_ACTIVE).increment(1.0);
        debug!("registry started");

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = refresh.tick() => {
                    self.prune_pending();
                    self.publish();
                }
            }
        }

        for conn in self.connections.values() {
            conn.link().close(CloseReason::GOING_AWAY);
        }
        self.ctx.directory.remove(&self.account_id, self.generation);
        gauge!(REGISTRY_ACTORS_ACTIVE).decrement(1.0);
        debug!("registry stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Connect {
                token,
                request,
                reply,
            } => {
                let result = self.connect(&token, request).await;
                if let Err(Ok(admission)) = reply.send(result) {
                    // Socket task gave up while we validated.
                    self.disconnect(&admission.connection_id, &admission.link);
                }
            }
            Command::Activate {
                connection_id,
                link,
            } => self.activate(&connection_id, &link),
            Command::Disconnect {
                connection_id,
                link,
            } => self.disconnect(&connection_id, &link),
            Command::Inbound {
                connection_id,
                link,
                envelope,
                handled,
            } => self.inbound(&connection_id, &link, envelope, handled),
            Command::Route {
                target,
                envelope,
                reply,
            } => {
                self.prune_pending();
                let result = self.route(target.as_ref(), &envelope);
                let _ = reply.send(result);
            }
            Command::RouteAwait {
                target,
                envelope,
                correlation_id,
                reply,
            } => self.route_await(target.as_ref(), &envelope, correlation_id, reply),
            Command::ForgetPending { correlation_id } => {
                let _ = self.pending.remove(&correlation_id);
                self.prune_pending();
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    async fn connect(
        &mut self,
        token: &str,
        request: AdmissionRequest,
    ) -> Result<Admission, GatewayError> {
        let config = &self.ctx.config;
        let claims = self.ctx.validator.validate(token, &config.validation).await?;
        if config.bind_subject && claims.subject() != self.account_id.as_str() {
            return Err(AuthError::SubjectMismatch.into());
        }

        let connection_id = request.requested_id.unwrap_or_else(ConnectionId::generate);
        if let Some(old) = self.connections.remove(&connection_id) {
            info!(connection_id = %connection_id, "superseding existing connection");
            old.link()
                .close(CloseReason::resource(ResourceError::Superseded));
            gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
            counter!(WS_DISCONNECTIONS_TOTAL, "reason" => "superseded").increment(1);
        }

        let (link, outbound) = ConnectionLink::new(config.outbound_queue_capacity);
        let established = Envelope::established(
            self.account_id.as_str(),
            connection_id.as_str(),
            config.heartbeat.interval.as_secs(),
        );
        let _ = link.send(router::encode(&established));

        let mut conn = Connection::new(
            connection_id.clone(),
            self.account_id.clone(),
            claims.subject().to_owned(),
            request.metadata,
            Arc::clone(&link),
        );
        if !config.heartbeat.required {
            let _ = conn.transition(ConnectionState::Active);
        }
        let _ = tokio::spawn(run_heartbeat(Arc::clone(&link), config.heartbeat.clone()));

        let _ = self.connections.insert(connection_id.clone(), conn);
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        info!(connection_id = %connection_id, "device admitted");
        self.publish();

        Ok(Admission {
            connection_id,
            link,
            outbound,
        })
    }

    fn activate(&mut self, connection_id: &ConnectionId, link: &Arc<ConnectionLink>) {
        let Some(conn) = self.connections.get_mut(connection_id) else {
            return;
        };
        if conn.owns(link) && conn.transition(ConnectionState::Active) {
            debug!(connection_id = %connection_id, "connection active");
            self.publish();
        }
    }

    fn disconnect(&mut self, connection_id: &ConnectionId, link: &Arc<ConnectionLink>) {
        let owned = self
            .connections
            .get(connection_id)
            .is_some_and(|c| c.owns(link));
        if !owned {
            return;
        }
        if let Some(mut conn) = self.connections.remove(connection_id) {
            let _ = conn.transition(ConnectionState::Closed);
            conn.link().close(CloseReason::NORMAL);
            let reason = conn.link().close_reason().map_or("NORMAL", |r| r.reason);
            gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
            counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason).increment(1);
            info!(connection_id = %connection_id, reason, "device disconnected");
        }
        self.publish();
    }

    fn inbound(
        &mut self,
        connection_id: &ConnectionId,
        link: &Arc<ConnectionLink>,
        envelope: Envelope,
        handled: bool,
    ) {
        let owned = self
            .connections
            .get(connection_id)
            .is_some_and(|c| c.owns(link));
        if !owned {
            return;
        }

        if let Some(cid) = envelope.correlation_id() {
            let expected = self
                .pending
                .get(cid)
                .is_some_and(|p| p.expected_from.contains(connection_id));
            if expected {
                if let Some(pending) = self.pending.remove(cid) {
                    let _ = pending.reply.send(envelope.clone());
                }
                self.emit(connection_id, envelope);
                return;
            }
        }

        if handled {
            self.emit(connection_id, envelope);
            return;
        }

        match self.ctx.router.unknown_type(&envelope) {
            Action::Reply(reply) => {
                let _ = link.send(router::encode(&reply));
            }
            Action::Forward => self.emit(connection_id, envelope),
            Action::Drop => {}
            Action::Close(err) => {
                warn!(connection_id = %connection_id, error = %err, "closing on protocol error");
                link.close(CloseReason::from(&GatewayError::Protocol(err)));
            }
        }
    }

    fn emit(&self, connection_id: &ConnectionId, envelope: Envelope) {
        counter!(DEVICE_EVENTS_TOTAL).increment(1);
        let _ = self.ctx.events.send(DeviceEvent {
            account_id: self.account_id.clone(),
            connection_id: connection_id.clone(),
            envelope,
            received_at: Utc::now(),
        });
    }

    fn route(
        &mut self,
        target: Option<&ConnectionId>,
        envelope: &Envelope,
    ) -> Result<DeliveryResult, RoutingError> {
        let result = self.deliver(target, envelope);
        if let Err(err) = &result {
            counter!(ROUTING_ERRORS_TOTAL, "code" => err.code()).increment(1);
            debug!(error = %err, "route failed");
        }
        result
    }

    fn route_await(
        &mut self,
        target: Option<&ConnectionId>,
        envelope: &Envelope,
        correlation_id: String,
        reply: AwaitReply,
    ) {
        self.prune_pending();
        if self.pending.contains_key(&correlation_id) {
            let err = ProtocolError::MalformedEnvelope(format!(
                "correlationId {correlation_id} is already awaiting a response"
            ));
            let _ = reply.send(Err(err.into()));
            return;
        }
        match self.route(target, envelope) {
            Ok(delivery) => {
                let (tx, rx) = oneshot::channel();
                let _ = self.pending.insert(
                    correlation_id,
                    PendingResponse {
                        reply: tx,
                        expected_from: delivery.delivered_to.clone(),
                    },
                );
                let _ = reply.send(Ok((delivery, rx)));
            }
            Err(err) => {
                let _ = reply.send(Err(err.into()));
            }
        }
    }

    /// Drop entries whose caller stopped waiting.
    fn prune_pending(&mut self) {
        self.pending.retain(|_, p| !p.reply.is_closed());
    }

    /// Queue `envelope` on the target, or on every ACTIVE connection.
    fn deliver(
        &mut self,
        target: Option<&ConnectionId>,
        envelope: &Envelope,
    ) -> Result<DeliveryResult, RoutingError> {
        let frame = router::encode(envelope);
        let mut result = DeliveryResult::default();

        match target {
            Some(id) => {
                let conn = self
                    .connections
                    .get_mut(id)
                    .filter(|c| c.is_active())
                    .ok_or_else(|| RoutingError::NoSuchSession {
                        connection_id: id.to_string(),
                    })?;
                deliver_one(conn, &frame, &mut result);
            }
            None => {
                let mut any = false;
                for conn in self.connections.values_mut().filter(|c| c.is_active()) {
                    any = true;
                    deliver_one(conn, &frame, &mut result);
                }
                if !any {
                    return Err(RoutingError::NoActiveConnections);
                }
            }
        }

        counter!(MESSAGES_ROUTED_TOTAL).increment(result.delivered_to.len() as u64);
        if !result.failed.is_empty() {
            self.publish();
        }
        Ok(result)
    }

    fn status(&self) -> Vec<SessionStatus> {
        self.connections.values().map(SessionStatus::from).collect()
    }

    fn publish(&self) {
        self.ctx
            .directory
            .publish(&self.account_id, self.generation, self.status());
    }
}

fn deliver_one(conn: &mut Connection, frame: &Arc<String>, result: &mut DeliveryResult) {
    match conn.link().send(Arc::clone(frame)) {
        Ok(()) => result.delivered_to.push(conn.id().clone()),
        Err(failure) => {
            if failure == SendFailure::Backpressure {
                warn!(connection_id = %conn.id(), "outbound queue full, closing");
                counter!(BACKPRESSURE_CLOSES_TOTAL).increment(1);
            }
            let _ = conn.transition(ConnectionState::Closing);
            result.failed.push(conn.id().clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_auth::testing;

    use crate::config::GatewayConfig;
    use crate::directory::SessionDirectory;
    use crate::events;
    use crate::websocket::router::MessageRouter;

    fn registry() -> AccountRegistry {
        let (validator, _fetcher) = testing::validator();
        let config = GatewayConfig::new(testing::validation_options());
        let ctx = RegistryContext {
            validator,
            router: Arc::new(MessageRouter::new(&config.router)),
            directory: Arc::new(SessionDirectory::new(config.directory_max_age())),
            events: events::channel(16),
            config: Arc::new(config),
        };
        AccountRegistry::new(AccountId::from("acct_1"), 1, Arc::new(ctx))
    }

    /// Register a pending response whose caller has already gone away.
    fn abandon(registry: &mut AccountRegistry, correlation_id: &str) {
        let (tx, rx) = oneshot::channel();
        drop(rx);
        let _ = registry.pending.insert(
            correlation_id.to_owned(),
            PendingResponse {
                reply: tx,
                expected_from: Vec::new(),
            },
        );
    }

    #[tokio::test]
    async fn route_prunes_abandoned_awaits() {
        let mut registry = registry();
        abandon(&mut registry, "c-1");
        abandon(&mut registry, "c-2");

        let (reply, result) = oneshot::channel();
        let envelope = Envelope::from_value(json!({"type": "command"})).unwrap();
        registry
            .handle(Command::Route {
                target: None,
                envelope,
                reply,
            })
            .await;

        assert_eq!(result.await.unwrap(), Err(RoutingError::NoActiveConnections));
        assert!(registry.pending.is_empty());
    }

    #[tokio::test]
    async fn forget_prunes_other_abandoned_awaits() {
        let mut registry = registry();
        abandon(&mut registry, "c-1");
        abandon(&mut registry, "c-2");
        let (live, _waiting) = oneshot::channel();
        let _ = registry.pending.insert(
            "c-3".to_owned(),
            PendingResponse {
                reply: live,
                expected_from: Vec::new(),
            },
        );

        registry
            .handle(Command::ForgetPending {
                correlation_id: "c-1".to_owned(),
            })
            .await;

        assert_eq!(registry.pending.len(), 1);
        assert!(registry.pending.contains_key("c-3"));
    }
}
