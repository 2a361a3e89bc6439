//! `GatewayServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tether_auth::TokenValidator;
use tether_core::{AccountId, ConnectionId};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::GatewayConfig;
use crate::control::{self, bearer_token};
use crate::directory::SessionDirectory;
use crate::events::{self, DeviceEvent};
use crate::health::{self, HealthCounters, HealthFeatures, HealthResponse};
use crate::metrics;
use crate::registry::{AdmissionRequest, RegistryContext, RegistryHub};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::connection::DeviceMetadata;
use crate::websocket::router::MessageRouter;
use crate::websocket::session::{DeviceSession, run_device_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Account registries.
    pub hub: Arc<RegistryHub>,
    /// Resolved configuration.
    pub config: Arc<GatewayConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`.
    pub metrics: PrometheusHandle,
}

/// The gateway server.
pub struct GatewayServer {
    config: Arc<GatewayConfig>,
    hub: Arc<RegistryHub>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: PrometheusHandle,
}

impl GatewayServer {
    /// Create a server admitting tokens through `validator`.
    pub fn new(config: GatewayConfig, validator: TokenValidator, metrics: PrometheusHandle) -> Self {
        let config = Arc::new(config);
        let ctx = RegistryContext {
            validator,
            router: Arc::new(MessageRouter::new(&config.router)),
            directory: Arc::new(SessionDirectory::new(config.directory_max_age())),
            events: events::channel(config.event_channel_capacity),
            config: Arc::clone(&config),
        };
        Self {
            config,
            hub: Arc::new(RegistryHub::new(Arc::new(ctx))),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics,
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: Arc::clone(&self.hub),
            config: Arc::clone(&self.config),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/accounts/{account_id}/ws", get(ws_handler));
        if self.config.control_plane_enabled {
            router = router.merge(control::routes(state.clone()));
        }
        router
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address (useful with port `0`) and the server task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(err) = result {
                error!(error = %err, "server error");
            }
        });
        info!(%addr, "gateway listening");
        Ok((addr, handle))
    }

    /// Account registries.
    pub fn hub(&self) -> &Arc<RegistryHub> {
        &self.hub
    }

    /// Session snapshots.
    pub fn directory(&self) -> &Arc<SessionDirectory> {
        &self.hub.context().directory
    }

    /// Subscribe to device events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.hub.context().events.subscribe()
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The resolved configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}

/// Query parameters accepted on the device upgrade request.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    /// Identity token (alternative to the `Authorization` header).
    pub token: Option<String>,
    /// Requested connection id.
    pub device_id: Option<String>,
    /// Device platform.
    pub platform: Option<String>,
    /// Device name.
    pub name: Option<String>,
    /// Comma-separated capabilities.
    pub capabilities: Option<String>,
}

impl ConnectParams {
    fn into_request(self) -> AdmissionRequest {
        AdmissionRequest {
            requested_id: self
                .device_id
                .filter(|id| !id.is_empty())
                .map(ConnectionId::from),
            metadata: DeviceMetadata {
                platform: self.platform,
                name: self.name,
                capabilities: self
                    .capabilities
                    .as_deref()
                    .map(DeviceMetadata::parse_capabilities)
                    .unwrap_or_default(),
            },
        }
    }
}

/// GET /accounts/{account_id}/ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(account_id): Path<String>,
    Query(mut params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let token = bearer_token(&headers).or_else(|| params.token.take());
    let session = DeviceSession {
        registry: state.hub.handle(&AccountId::from(account_id)),
        router: Arc::clone(&state.hub.context().router),
        token,
        request: params.into_request(),
        shutdown: state.shutdown.token(),
    };
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_device_session(socket, session))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let ctx = state.hub.context();
    let counters = HealthCounters {
        connections: ctx.directory.connection_count(),
        accounts: state.hub.actor_count(),
        key_sets_cached: ctx.validator.key_cache().cached_domains(),
    };
    let features = HealthFeatures {
        control_plane: state.config.control_plane_enabled,
        api_key_required: state.config.api_key.is_some(),
        require_heartbeat: state.config.heartbeat.required,
        bind_subject: state.config.bind_subject,
    };
    Json(health::health_check(
        state.start_time,
        state.shutdown.is_shutting_down(),
        counters,
        features,
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    metrics::render(&state.metrics)
}
