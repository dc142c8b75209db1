use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
};

use crate::state::AppState;
use crate::ws::actor;

/// GET /ws
///
/// WebSocket upgrade endpoint. Authentication happens in-band: the
/// first frame on the socket must be an `authenticate` event, so the
/// upgrade itself is unconditional and the actor enforces the rest.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| actor::run_connection(socket, state))
}
