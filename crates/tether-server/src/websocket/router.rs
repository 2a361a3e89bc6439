//! Inbound message dispatch.
//!
//! A table keyed by envelope `type`. Liveness types (`heartbeat`, `ping`,
//! `pong`) are answered in place and never forwarded. Configured application
//! types are forwarded to the control plane. Everything else falls to the
//! [`UnknownTypePolicy`].

use std::collections::HashMap;
use std::sync::Arc;

use tether_core::envelope::{TYPE_HEARTBEAT, TYPE_PING, TYPE_PONG};
use tether_core::{Envelope, ProtocolError};
use tether_settings::{RouterSettings, UnknownTypePolicy};
use tracing::warn;

/// What to do with one inbound envelope.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Send this envelope back to the originating connection.
    Reply(Envelope),
    /// Publish to the control plane.
    Forward,
    /// Discard.
    Drop,
    /// Close the connection with `PROTOCOL_ERROR`.
    Close(ProtocolError),
}

/// Handler for one inbound message type.
pub trait InboundHandler: Send + Sync {
    /// Decide what happens to `envelope`.
    fn handle(&self, envelope: &Envelope) -> Action;

    /// Whether this type counts as a liveness signal.
    fn is_liveness(&self) -> bool {
        false
    }
}

struct HeartbeatHandler;

impl InboundHandler for HeartbeatHandler {
    fn handle(&self, _envelope: &Envelope) -> Action {
        Action::Reply(Envelope::heartbeat_ack())
    }

    fn is_liveness(&self) -> bool {
        true
    }
}

struct PingHandler;

impl InboundHandler for PingHandler {
    fn handle(&self, envelope: &Envelope) -> Action {
        Action::Reply(Envelope::pong(envelope.correlation_id()))
    }

    fn is_liveness(&self) -> bool {
        true
    }
}

struct PongHandler;

impl InboundHandler for PongHandler {
    fn handle(&self, _envelope: &Envelope) -> Action {
        Action::Drop
    }

    fn is_liveness(&self) -> bool {
        true
    }
}

struct ForwardHandler;

impl InboundHandler for ForwardHandler {
    fn handle(&self, _envelope: &Envelope) -> Action {
        Action::Forward
    }
}

/// Dispatch table shared by every connection.
pub struct MessageRouter {
    handlers: HashMap<String, Arc<dyn InboundHandler>>,
    unknown_type_policy: UnknownTypePolicy,
    close_on_protocol_error: bool,
}

impl MessageRouter {
    /// Build the table: liveness handlers plus one forwarder per configured type.
    pub fn new(settings: &RouterSettings) -> Self {
        let mut router = Self {
            handlers: HashMap::new(),
            unknown_type_policy: settings.unknown_type_policy,
            close_on_protocol_error: settings.close_on_protocol_error,
        };
        router.register(TYPE_HEARTBEAT, HeartbeatHandler);
        router.register(TYPE_PING, PingHandler);
        router.register(TYPE_PONG, PongHandler);
        for message_type in &settings.forward_types {
            if router.is_liveness(message_type) {
                warn!(message_type, "liveness types cannot be forwarded, ignoring");
                continue;
            }
            router.register(message_type, ForwardHandler);
        }
        router
    }

    /// Register (or replace) the handler for a message type.
    pub fn register(&mut self, message_type: &str, handler: impl InboundHandler + 'static) {
        let _ = self
            .handlers
            .insert(message_type.to_owned(), Arc::new(handler));
    }

    /// Whether `message_type` is a liveness signal.
    pub fn is_liveness(&self, message_type: &str) -> bool {
        self.handlers
            .get(message_type)
            .is_some_and(|h| h.is_liveness())
    }

    /// Whether `message_type` has a handler.
    pub fn has_handler(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    /// Run the registered handler. `None` when the type is unregistered.
    pub fn dispatch(&self, envelope: &Envelope) -> Option<Action> {
        self.handlers
            .get(envelope.message_type())
            .map(|h| h.handle(envelope))
    }

    /// Apply the unknown-type policy to an unregistered envelope.
    pub fn unknown_type(&self, envelope: &Envelope) -> Action {
        match self.unknown_type_policy {
            UnknownTypePolicy::Echo => Action::Reply(Envelope::echo(envelope)),
            UnknownTypePolicy::Drop => Action::Drop,
            UnknownTypePolicy::Reject => self.protocol_error(ProtocolError::UnknownMessageType {
                message_type: envelope.message_type().to_owned(),
            }),
        }
    }

    /// Reject one bad message, or close if so configured.
    pub fn protocol_error(&self, err: ProtocolError) -> Action {
        if self.close_on_protocol_error {
            Action::Close(err)
        } else {
            let public = tether_core::GatewayError::from(err);
            Action::Reply(Envelope::error(public.code(), public.public_message()))
        }
    }

    /// Registered type names (sorted).
    pub fn message_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Serialize an envelope once for fan-out.
pub fn encode(envelope: &Envelope) -> Arc<String> {
    Arc::new(envelope.to_json())
}
