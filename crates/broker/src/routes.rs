// HTTP surface: websocket upgrade, admin endpoints, health and metrics.

use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::{ws::WebSocketUpgrade, ConnectInfo, DefaultBodyLimit, Extension, Path, State},
    http::{header::CONTENT_TYPE, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wsbroker_common::{
    protocol::SocketEvent,
    types::{ConnectionInfo, UserId},
};

use crate::{
    auth::{
        jwt::{JwtAccessTokenService, Principal},
        middleware::{require_admin, require_bearer_auth},
    },
    broker::{Broker, DeliveryReport},
    error::{
        attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope, ApiError,
        ErrorCode,
    },
    metrics,
    transport::{websocket, RemoteInfo},
};

pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub broker: Broker,
    pub jwt_service: Arc<JwtAccessTokenService>,
    pub subprotocols: Arc<[String]>,
}

impl AppState {
    pub fn new(broker: Broker, jwt_service: Arc<JwtAccessTokenService>, subprotocols: Vec<String>) -> Self {
        Self { broker, jwt_service, subprotocols: subprotocols.into() }
    }
}

pub fn build_router(state: AppState) -> Router {
    let ws_routes = Router::new()
        .route("/v1/ws", get(ws_upgrade))
        .layer(middleware::from_fn_with_state(Arc::clone(&state.jwt_service), require_bearer_auth));

    let admin_routes = Router::new()
        .route("/v1/admin/sockets", get(list_sockets))
        .route("/v1/admin/sockets/{connection_id}", delete(close_socket))
        .route("/v1/admin/broadcast", post(broadcast))
        .route_layer(middleware::from_fn(require_admin))
        .layer(middleware::from_fn_with_state(Arc::clone(&state.jwt_service), require_bearer_auth));

    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics_endpoint))
            .merge(ws_routes)
            .merge(admin_routes)
            .with_state(state),
    )
}

pub fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn metrics_endpoint() -> Response {
    let body = metrics::global_metrics().map(|metrics| metrics.render_prometheus()).unwrap_or_default();
    (StatusCode::OK, [(CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response()
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let broker = state.broker.clone();
    let user_id = principal.user_id;

    upgrade
        .protocols(state.subprotocols.iter().cloned())
        .on_failed_upgrade(move |error| {
            warn!(user_id, remote_addr = %remote_addr, error = %error, "websocket upgrade failed");
        })
        .on_upgrade(move |socket| async move {
            let socket = websocket::into_upgraded(socket, RemoteInfo::tcp(remote_addr.to_string(), None));
            match broker.register_socket(user_id, socket).await {
                Ok(handle) => {
                    debug!(user_id, connection_id = %handle.connection_id(), "websocket registered");
                }
                Err(error) => {
                    warn!(user_id, remote_addr = %remote_addr, error = %error, "websocket registration failed");
                }
            }
        })
}

async fn list_sockets(State(state): State<AppState>) -> Result<Json<Vec<ConnectionInfo>>, ApiError> {
    let snapshot = state.broker.snapshot().await?;
    Ok(Json(snapshot.iter().cloned().collect()))
}

async fn close_socket(
    State(state): State<AppState>,
    Path(connection_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.broker.disconnect(connection_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::from_code(ErrorCode::NotFound)
            .with_details(serde_json::json!({ "connection_id": connection_id })))
    }
}

#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    user_ids: Vec<UserId>,
    event: SocketEvent,
}

async fn broadcast(
    State(state): State<AppState>,
    Json(request): Json<BroadcastRequest>,
) -> Result<Json<DeliveryReport>, ApiError> {
    if request.user_ids.is_empty() {
        return Err(ApiError::new(ErrorCode::ValidationFailed, "user_ids must not be empty"));
    }
    if request.event.event_name.trim().is_empty() {
        return Err(ApiError::new(ErrorCode::ValidationFailed, "event_name must not be empty"));
    }

    let report = state.broker.broadcast(&request.user_ids, &request.event).await?;
    Ok(Json(report))
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            ApiError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let latency_ms = started_at.elapsed().as_millis() as u64;
    metrics::record_http_request(method.as_str(), &path, response.status().as_u16(), latency_ms);
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms,
        "request completed"
    );

    response
}
