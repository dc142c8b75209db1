//! Fan-out helpers over the presence registry.
//!
//! Every helper encodes the envelope once and clones the frame per
//! connection. Pushes go through the bounded per-connection queues and
//! never block; a dropped frame is the slow consumer's problem, not the
//! sender's.

use std::collections::HashSet;

use axum::extract::ws::Message;

use crate::presence::rooms::RoomTracker;
use crate::presence::{ConnectionHandle, PresenceRegistry};
use crate::state::AppState;
use crate::ws::protocol::{ServerEnvelope, ServerEvent};

/// Serialize an envelope into a text frame. Wire events serialize
/// infallibly in practice; a failure is logged and the frame dropped.
pub fn encode(envelope: &ServerEnvelope) -> Option<Message> {
    match serde_json::to_string(envelope) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize outbound envelope");
            None
        }
    }
}

/// Send an envelope to every live session of one user.
pub fn send_to_user(registry: &PresenceRegistry, user_id: &str, envelope: &ServerEnvelope) {
    let Some(message) = encode(envelope) else { return };
    for handle in registry.sessions_for(user_id) {
        handle.push(message.clone());
    }
}

/// Send an envelope to every live session of each listed user.
/// Offline users are skipped.
pub fn send_to_users(registry: &PresenceRegistry, user_ids: &[String], envelope: &ServerEnvelope) {
    let Some(message) = encode(envelope) else { return };
    for user_id in user_ids {
        for handle in registry.sessions_for(user_id) {
            handle.push(message.clone());
        }
    }
}

/// Send an envelope to every live session of a room's members, skipping
/// one connection (typically the originator).
pub fn send_to_room_except(
    registry: &PresenceRegistry,
    rooms: &RoomTracker,
    room_key: &str,
    except_connection: u64,
    envelope: &ServerEnvelope,
) {
    let Some(message) = encode(envelope) else { return };
    for member in rooms.members(room_key) {
        for handle in registry.sessions_for(&member) {
            if handle.id() == except_connection {
                continue;
            }
            handle.push(message.clone());
        }
    }
}

/// Push a fresh `roomPresence` snapshot to the room's member sessions,
/// except the connection that caused the change (it gets a correlated
/// reply instead).
pub fn broadcast_room_presence_except(state: &AppState, room_key: &str, except_connection: u64) {
    let online_members = state.rooms.members_online(room_key, &state.presence);
    let envelope = ServerEnvelope::push(ServerEvent::RoomPresence {
        room: room_key.to_string(),
        online_members,
    });
    send_to_room_except(
        &state.presence,
        &state.rooms,
        room_key,
        except_connection,
        &envelope,
    );
}

/// Durable contacts of a user, resolved on the blocking pool. Presence
/// traffic is best-effort, so failures degrade to a warning.
async fn contacts_of(state: &AppState, user_id: &str) -> Option<HashSet<String>> {
    let store = state.store.clone();
    let user = user_id.to_string();
    match tokio::task::spawn_blocking(move || store.contacts_of(&user)).await {
        Ok(Ok(contacts)) => Some(contacts),
        Ok(Err(e)) => {
            tracing::warn!(user_id = %user_id, error = %e, "presence contact lookup failed");
            None
        }
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "presence contact task failed");
            None
        }
    }
}

/// Tell every durable contact of `user_id` about an online/offline
/// transition. Scoped: co-members of the user's groups and partners of
/// the user's personal chats, never the whole server.
pub async fn announce_user_status(state: &AppState, user_id: &str, is_online: bool) {
    let Some(contacts) = contacts_of(state, user_id).await else {
        return;
    };
    let envelope = ServerEnvelope::push(ServerEvent::UserStatus {
        user_id: user_id.to_string(),
        is_online,
    });
    let Some(message) = encode(&envelope) else { return };
    for contact in contacts {
        for handle in state.presence.sessions_for(&contact) {
            handle.push(message.clone());
        }
    }
}

/// Give a newly-authenticated session its one-time presence snapshot:
/// one `userStatus` per currently-online contact.
pub async fn send_contacts_snapshot(state: &AppState, handle: &ConnectionHandle) {
    let Some(contacts) = contacts_of(state, handle.user_id()).await else {
        return;
    };
    for contact in state.presence.online_among(contacts.iter()) {
        let envelope = ServerEnvelope::push(ServerEvent::UserStatus {
            user_id: contact,
            is_online: true,
        });
        if let Some(message) = encode(&envelope) {
            handle.push(message);
        }
    }
}
