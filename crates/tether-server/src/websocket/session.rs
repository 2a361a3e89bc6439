//! Device socket lifecycle, from upgrade through disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, histogram};
use tether_core::metrics::{AUTH_FAILURES_TOTAL, WS_CONNECTION_DURATION_SECONDS};
use tether_core::{AuthError, ConnectionId, Envelope, GatewayError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::{CloseReason, ConnectionLink};
use super::router::{self, Action, MessageRouter};
use crate::registry::{AdmissionRequest, RegistryHandle};

/// How long the writer gets to flush the close frame after the reader stops.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything a socket task needs besides the socket.
pub struct DeviceSession {
    /// The account's registry.
    pub registry: RegistryHandle,
    /// Inbound dispatch table.
    pub router: Arc<MessageRouter>,
    /// Candidate identity token, if the request carried one.
    pub token: Option<String>,
    /// Requested id and metadata.
    pub request: AdmissionRequest,
    /// Server shutdown signal.
    pub shutdown: CancellationToken,
}

/// Run one device socket.
///
/// 1. Validates the token through the account registry; a failure sends a
///    single close frame carrying the error's close code
/// 2. Forwards queued outbound frames (starting with `connection.established`)
/// 3. Dispatches inbound frames: liveness envelopes and WebSocket Pong
///    frames are handled here, application messages go to the registry
/// 4. Closes with the link's recorded reason and deregisters
#[instrument(skip_all, fields(
    account_id = %session.registry.account_id(),
    connection_id = tracing::field::Empty,
))]
pub async fn run_device_session(mut socket: WebSocket, session: DeviceSession) {
    let DeviceSession {
        registry,
        router,
        token,
        request,
        shutdown,
    } = session;

    let admitted = match token {
        Some(token) => registry.connect(&token, request).await,
        None => Err(AuthError::Malformed("missing token".into()).into()),
    };
    let admission = match admitted {
        Ok(admission) => admission,
        Err(err) => {
            warn!(code = err.code(), error = %err, "connection rejected");
            if let GatewayError::Auth(auth) = &err {
                counter!(AUTH_FAILURES_TOTAL, "code" => auth.code()).increment(1);
            }
            let reason = CloseReason::from(&err);
            let _ = socket.send(close_message(reason)).await;
            return;
        }
    };

    let connection_id = admission.connection_id;
    let link = admission.link;
    let started = std::time::Instant::now();
    tracing::Span::current().record("connection_id", connection_id.as_str());
    info!(connection_id = %connection_id, "device connected");

    let (ws_tx, mut ws_rx) = socket.split();
    let mut writer = tokio::spawn(write_frames(ws_tx, admission.outbound, Arc::clone(&link)));

    let mut activated = false;
    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let Some(Ok(frame)) = frame else { break };
                let text = match frame {
                    Message::Text(text) => text.as_str().to_owned(),
                    Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!(len = data.len(), "ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    // axum answers pings itself; only pongs count as liveness.
                    Message::Ping(_) => continue,
                    Message::Pong(_) => {
                        note_liveness(&connection_id, &link, &registry, &mut activated).await;
                        continue;
                    }
                    Message::Close(_) => {
                        debug!("device sent close frame");
                        break;
                    }
                };
                handle_text(&text, &connection_id, &link, &registry, &router, &mut activated).await;
            }
            () = link.closed() => break,
            () = shutdown.cancelled() => {
                link.close(CloseReason::GOING_AWAY);
                break;
            }
        }
    }

    link.close(CloseReason::NORMAL);
    registry.disconnect(&connection_id, &link).await;
    if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    info!(
        connection_id = %connection_id,
        reason = link.close_reason().map_or("NORMAL", |r| r.reason),
        "device session ended"
    );
}

async fn handle_text(
    text: &str,
    connection_id: &ConnectionId,
    link: &Arc<ConnectionLink>,
    registry: &RegistryHandle,
    router: &MessageRouter,
    activated: &mut bool,
) {
    let envelope = match Envelope::parse(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(error = %err, "malformed inbound frame");
            apply(router.protocol_error(err), link);
            return;
        }
    };

    if router.is_liveness(envelope.message_type()) {
        note_liveness(connection_id, link, registry, activated).await;
    }

    match router.dispatch(&envelope) {
        Some(Action::Forward) => registry.inbound(connection_id, link, envelope, true).await,
        Some(action) => apply(action, link),
        None if envelope.correlation_id().is_some() => {
            registry.inbound(connection_id, link, envelope, false).await;
        }
        None => apply(router.unknown_type(&envelope), link),
    }
}

/// Reset the heartbeat timer; the first signal also promotes the connection to ACTIVE.
async fn note_liveness(
    connection_id: &ConnectionId,
    link: &Arc<ConnectionLink>,
    registry: &RegistryHandle,
    activated: &mut bool,
) {
    link.mark_alive();
    if !*activated {
        *activated = true;
        registry.activate(connection_id, link).await;
    }
}

fn apply(action: Action, link: &ConnectionLink) {
    match action {
        Action::Reply(reply) => {
            let _ = link.send(router::encode(&reply));
        }
        Action::Close(err) => {
            warn!(error = %err, "closing on protocol error");
            link.close(CloseReason::from(&GatewayError::Protocol(err)));
        }
        Action::Forward | Action::Drop => {}
    }
}

/// Drain the outbound queue into the socket, then send the close frame.
async fn write_frames(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Arc<String>>,
    link: Arc<ConnectionLink>,
) {
    loop {
        tokio::select! {
            biased;
            () = link.closed() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if ws_tx.send(Message::Text(frame.as_str().into())).await.is_err() {
                    link.close(CloseReason::NORMAL);
                    return;
                }
            }
        }
    }
    let reason = link.close_reason().unwrap_or(CloseReason::NORMAL);
    let _ = ws_tx.send(close_message(reason)).await;
    let _ = ws_tx.close().await;
}

fn close_message(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: reason.code,
        reason: Utf8Bytes::from_static(reason.reason),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::errors::close_code;
    use tether_core::{AuthError, ResourceError};

    #[test]
    fn close_message_carries_code_and_reason() {
        let err = GatewayError::from(AuthError::Expired);
        let Message::Close(Some(frame)) = close_message(CloseReason::from(&err)) else {
            panic!("expected close frame");
        };
        assert_eq!(frame.code, close_code::EXPIRED);
        assert_eq!(frame.reason.as_str(), "EXPIRED");
    }

    #[test]
    fn resource_close_message() {
        let Message::Close(Some(frame)) =
            close_message(CloseReason::resource(ResourceError::HeartbeatTimeout))
        else {
            panic!("expected close frame");
        };
        assert_eq!(frame.code, close_code::HEARTBEAT_TIMEOUT);
    }

    #[test]
    fn apply_reply_enqueues() {
        let (link, mut rx) = ConnectionLink::new(4);
        apply(Action::Reply(Envelope::heartbeat_ack()), &link);
        assert_eq!(rx.try_recv().unwrap().as_str(), r#"{"type":"heartbeat_ack"}"#);
    }

    #[test]
    fn apply_close_records_protocol_error() {
        let (link, _rx) = ConnectionLink::new(4);
        apply(
            Action::Close(tether_core::ProtocolError::MalformedEnvelope("x".into())),
            &link,
        );
        assert_eq!(link.close_reason().unwrap().code, close_code::PROTOCOL_ERROR);
    }
}
