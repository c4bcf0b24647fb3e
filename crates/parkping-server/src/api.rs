use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::Method,
    middleware,
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use parkping_shared::constants::APP_NAME;
use parkping_shared::protocol::RegistrySummary;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hub::HubHandle;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::session::{run_session, EventLimits};

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    name: &'static str,
    version: &'static str,
    hub: RegistrySummary,
}

async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>, ServerError> {
    let hub = state.hub.stats().await.ok_or(ServerError::HubUnavailable)?;
    Ok(Json(HealthResponse {
        status: "ok",
        name: APP_NAME,
        version: env!("CARGO_PKG_VERSION"),
        hub,
    }))
}

async fn websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    let limits = EventLimits {
        rate: state.config.event_rate,
        burst: state.config.event_burst,
    };
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| run_session(socket, hub, peer, limits))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP / WebSocket server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
