//! Control-plane HTTP API.
//!
//! - `GET  /accounts/{account_id}/sessions`: directory snapshot
//! - `POST /accounts/{account_id}/route`: deliver a message, optionally
//!   waiting for the correlated reply
//! - `GET  /accounts/{account_id}/events`: server-sent device events
//!
//! When an API key is configured every route requires
//! `Authorization: Bearer <key>`.

use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::Stream;
use serde::Deserialize;
use serde_json::{Value, json};
use tether_core::{AccountId, ConnectionId, Envelope, GatewayError, RoutingError};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::directory::DirectoryLookup;
use crate::server::AppState;

/// Control-plane routes, guarded by the API key when one is configured.
pub fn routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/accounts/{account_id}/sessions", get(sessions_handler))
        .route("/accounts/{account_id}/route", post(route_handler))
        .route("/accounts/{account_id}/events", get(events_handler))
        .route_layer(middleware::from_fn_with_state(state, require_api_key))
}

/// A [`GatewayError`] rendered as `{code, message}` with a matching status.
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl<E: Into<GatewayError>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GatewayError::Routing(_) => StatusCode::NOT_FOUND,
            GatewayError::Protocol(_) => StatusCode::BAD_REQUEST,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Resource(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = json!({
            "code": self.0.code(),
            "message": self.0.public_message(),
        });
        (status, Json(body)).into_response()
    }
}

/// Body of `POST /accounts/{account_id}/route`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequest {
    /// The envelope to deliver.
    pub message: Value,
    /// Deliver to this connection only.
    #[serde(default)]
    pub target_connection_id: Option<String>,
    /// Wait this long for a reply carrying the message's `correlationId`.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Wait for a reply using the default timeout.
    #[serde(default)]
    pub await_response: bool,
}

async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.config.api_key.as_deref() else {
        return next.run(request).await;
    };
    let presented = bearer_token(request.headers()).unwrap_or_default();
    if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        next.run(request).await
    } else {
        debug!(path = %request.uri().path(), "control-plane request without valid key");
        let body = json!({ "code": "UNAUTHORIZED", "message": "invalid or missing api key" });
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

/// Token from an `Authorization: Bearer` header.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then(|| token.to_owned())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// GET /accounts/{account_id}/sessions
async fn sessions_handler(
    Path(account_id): Path<String>,
    State(state): State<AppState>,
) -> Json<Value> {
    let account = AccountId::from(account_id);
    let body = match state.hub.context().directory.lookup(&account) {
        DirectoryLookup::Fresh(sessions) => json!({
            "accountId": account,
            "sessions": sessions,
            "stale": false,
        }),
        DirectoryLookup::Stale { age } => {
            warn!(account_id = %account, age_ms = age.as_millis(), "session snapshot is stale");
            json!({
                "accountId": account,
                "sessions": [],
                "stale": true,
            })
        }
        DirectoryLookup::Absent => json!({
            "accountId": account,
            "sessions": [],
            "stale": false,
        }),
    };
    Json(body)
}

/// POST /accounts/{account_id}/route
async fn route_handler(
    Path(account_id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<RouteRequest>,
) -> Result<Json<Value>, ApiError> {
    let account = AccountId::from(account_id);
    let envelope = Envelope::from_value(body.message)?;
    let target = body
        .target_connection_id
        .filter(|t| !t.is_empty())
        .map(ConnectionId::from)
        .or_else(|| envelope.target_connection_id().map(ConnectionId::from));

    let Some(registry) = state.hub.existing(&account) else {
        let err = match target {
            Some(id) => RoutingError::NoSuchSession {
                connection_id: id.into_inner(),
            },
            None => RoutingError::NoActiveConnections,
        };
        return Err(err.into());
    };

    let wait = body.timeout_ms.map(Duration::from_millis).or_else(|| {
        body.await_response
            .then_some(state.config.default_route_timeout)
    });
    let value = match wait {
        Some(timeout) => {
            let outcome = registry.route_and_await(envelope, target, timeout).await?;
            serde_json::to_value(outcome)
        }
        None => {
            let delivery = registry.route(envelope, target).await?;
            serde_json::to_value(delivery)
        }
    };
    Ok(Json(value.unwrap_or(Value::Null)))
}

/// GET /accounts/{account_id}/events
async fn events_handler(
    Path(account_id): Path<String>,
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let account = AccountId::from(account_id);
    let mut rx = state.hub.context().events.subscribe();
    let shutdown = state.shutdown.token();

    let stream = async_stream::stream! {
        loop {
            let received = tokio::select! {
                () = shutdown.cancelled() => None,
                received = rx.recv() => Some(received),
            };
            let Some(received) = received else { break };
            match received {
                Ok(event) => {
                    if event.account_id != account {
                        continue;
                    }
                    match Event::default().event("device").json_data(&event) {
                        Ok(sse) => yield Ok(sse),
                        Err(err) => warn!(error = %err, "failed to encode device event"),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(account_id = %account, skipped, "event subscriber lagged");
                    yield Ok(Event::default().event("lagged").data(skipped.to_string()));
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use tether_core::{ProtocolError, ResourceError};

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        let _ = headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc"));
        let _ = headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
        let _ = headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn constant_time_eq_compares() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secrets"));
    }

    #[test]
    fn api_error_status_mapping() {
        let cases = [
            (
                ApiError::from(RoutingError::NoActiveConnections),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(ProtocolError::MalformedEnvelope("x".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(ResourceError::BackpressureExceeded),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[test]
    fn route_request_defaults() {
        let req: RouteRequest =
            serde_json::from_value(json!({"message": {"type": "command"}})).unwrap();
        assert!(req.target_connection_id.is_none());
        assert!(req.timeout_ms.is_none());
        assert!(!req.await_response);
    }
}
