use axum::Router;

use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Build the axum Router. The realtime surface is deliberately small:
/// one WebSocket endpoint plus a health check. Everything else rides
/// the socket protocol.
pub fn build_router(state: AppState) -> Router {
    let ws_routes = Router::new().route("/ws", axum::routing::get(ws_handler::ws_upgrade));

    let health = Router::new().route("/healthz", axum::routing::get(health_check));

    Router::new().merge(ws_routes).merge(health).with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
