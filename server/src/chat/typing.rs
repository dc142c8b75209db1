//! Ephemeral typing indicators.
//!
//! Pure pass-through: nothing is persisted and delivery is at most
//! once. Stale indicators expire client-side.

use crate::chat::target::RoomKey;
use crate::state::AppState;
use crate::ws::broadcast;
use crate::ws::protocol::{ServerEnvelope, ServerEvent};

/// Relay a typing start/stop signal to the live members of `room`,
/// skipping the originating connection. Signals from non-members or for
/// malformed rooms are dropped with a debug log.
pub fn relay(state: &AppState, room: &str, user_id: &str, connection_id: u64, is_typing: bool) {
    let Some(key) = RoomKey::parse(room) else {
        tracing::debug!(room = %room, user_id = %user_id, "typing signal for malformed room dropped");
        return;
    };
    if !state.rooms.is_member(key.as_str(), user_id) {
        tracing::debug!(room = %key, user_id = %user_id, "typing signal from non-member dropped");
        return;
    }
    let envelope = ServerEnvelope::push(ServerEvent::TypingIndicator {
        room: key.as_str().to_string(),
        user_id: user_id.to_string(),
        is_typing,
    });
    broadcast::send_to_room_except(
        &state.presence,
        &state.rooms,
        key.as_str(),
        connection_id,
        &envelope,
    );
}
