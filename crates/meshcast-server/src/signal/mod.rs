//! Signaling surface: one long-lived WebSocket per client at `/ws`.

pub mod session;

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;

use meshcast_core::broker::Broker;
use meshcast_core::config::SignalConfig;
use meshcast_core::db::SignalDatabase;

use crate::metrics::Metrics;

/// Shared dependencies handed to every session.
pub struct SignalState {
    pub broker: Arc<Broker>,
    pub db: SignalDatabase,
    pub metrics: Arc<Metrics>,
    pub config: SignalConfig,
}

/// The signaling router.
pub fn router(state: Arc<SignalState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SignalState>>,
) -> Response {
    ws.on_upgrade(move |socket| session::run(socket, state))
}
