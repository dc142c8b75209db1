//! Wire protocol: JSON envelopes and per-event dispatch.
//!
//! Every frame in either direction is an envelope `{ request_id, type,
//! ...fields }`. The `request_id` is an opaque client token echoed on
//! the direct reply; server-initiated pushes carry an empty one.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::dispatch::{self, SendError, SendRequest};
use crate::chat::target::RoomKey;
use crate::chat::typing;
use crate::presence::{ConnectionHandle, ConnectionSender};
use crate::state::AppState;
use crate::store::MessageRecord;
use crate::ws::broadcast;

#[derive(Debug, Deserialize)]
pub struct ClientEnvelope {
    #[serde(default)]
    pub request_id: String,
    #[serde(flatten)]
    pub event: ClientEvent,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    Authenticate {
        #[serde(default)]
        token: String,
    },
    JoinRoom {
        room: String,
    },
    LeaveRoom {
        room: String,
    },
    SendMessage {
        content: String,
        #[serde(default)]
        recipient_id: Option<String>,
        #[serde(default)]
        group_id: Option<String>,
        #[serde(default)]
        room_hint: Option<String>,
    },
    EditMessage {
        message_id: String,
        content: String,
    },
    DeleteMessage {
        message_id: String,
    },
    React {
        message_id: String,
        #[serde(default)]
        reaction: Option<String>,
    },
    MarkRead {
        message_id: String,
    },
    FetchHistory {
        room: String,
        #[serde(default)]
        before_sequence: Option<i64>,
        #[serde(default)]
        limit: Option<u32>,
    },
    TypingStart {
        room: String,
    },
    TypingStop {
        room: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerEnvelope {
    pub request_id: String,
    #[serde(flatten)]
    pub event: ServerEvent,
}

impl ServerEnvelope {
    /// Direct reply correlated to a client request.
    pub fn reply(request_id: &str, event: ServerEvent) -> Self {
        Self {
            request_id: request_id.to_string(),
            event,
        }
    }

    /// Server-initiated push with no originating request.
    pub fn push(event: ServerEvent) -> Self {
        Self {
            request_id: String::new(),
            event,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    Authenticated {
        user_id: String,
    },
    AuthError {
        reason: String,
    },
    SendAck {
        message: MessageRecord,
    },
    NewMessage {
        message: MessageRecord,
    },
    MessageEdited {
        message_id: String,
        room: String,
        content: String,
        edited_at: DateTime<Utc>,
    },
    MessageDeleted {
        message_id: String,
        room: String,
    },
    ReactionUpdated {
        message_id: String,
        room: String,
        user_id: String,
        reaction: Option<String>,
    },
    MessageRead {
        message_id: String,
        room: String,
        user_id: String,
        read_at: DateTime<Utc>,
    },
    History {
        room: String,
        messages: Vec<MessageRecord>,
        has_more: bool,
    },
    UserStatus {
        user_id: String,
        is_online: bool,
    },
    RoomPresence {
        room: String,
        online_members: Vec<String>,
    },
    TypingIndicator {
        room: String,
        user_id: String,
        is_typing: bool,
    },
    Error {
        code: String,
        message: String,
    },
}

/// Parse one inbound text frame.
pub fn parse_frame(text: &str) -> Result<ClientEnvelope, serde_json::Error> {
    serde_json::from_str(text)
}

/// Serialize and enqueue one envelope on a single connection.
pub fn send_envelope(sender: &ConnectionSender, envelope: &ServerEnvelope) {
    if let Some(message) = broadcast::encode(envelope) {
        sender.push(message);
    }
}

pub fn send_error(sender: &ConnectionSender, request_id: &str, code: &str, message: String) {
    send_envelope(
        sender,
        &ServerEnvelope::reply(
            request_id,
            ServerEvent::Error {
                code: code.to_string(),
                message,
            },
        ),
    );
}

/// Handle one parsed event on an authenticated session. `joined` is the
/// set of room keys this connection subscribed to, owned by the actor
/// and unwound on close.
pub async fn dispatch_authenticated(
    state: &AppState,
    handle: &ConnectionHandle,
    joined: &mut HashSet<String>,
    request_id: &str,
    event: ClientEvent,
) {
    match event {
        ClientEvent::Authenticate { .. } => {
            // Already authenticated; re-confirm rather than error.
            send_envelope(
                handle.sender(),
                &ServerEnvelope::reply(
                    request_id,
                    ServerEvent::Authenticated {
                        user_id: handle.user_id().to_string(),
                    },
                ),
            );
        }
        ClientEvent::JoinRoom { room } => {
            handle_join(state, handle, joined, request_id, &room).await;
        }
        ClientEvent::LeaveRoom { room } => {
            handle_leave(state, handle, joined, request_id, &room);
        }
        ClientEvent::SendMessage {
            content,
            recipient_id,
            group_id,
            room_hint,
        } => {
            let request = SendRequest {
                content,
                recipient_id,
                group_id,
                room_hint,
            };
            match dispatch::send(state, handle.user_id(), request).await {
                Ok(record) => send_envelope(
                    handle.sender(),
                    &ServerEnvelope::reply(request_id, ServerEvent::SendAck { message: record }),
                ),
                Err(e) => reply_error(handle, request_id, &e),
            }
        }
        ClientEvent::EditMessage {
            message_id,
            content,
        } => {
            let result = dispatch::edit(state, handle.user_id(), &message_id, &content).await;
            respond(handle, request_id, result);
        }
        ClientEvent::DeleteMessage { message_id } => {
            let result = dispatch::delete(state, handle.user_id(), &message_id).await;
            respond(handle, request_id, result);
        }
        ClientEvent::React {
            message_id,
            reaction,
        } => {
            let result =
                dispatch::react(state, handle.user_id(), &message_id, reaction.as_deref()).await;
            respond(handle, request_id, result);
        }
        ClientEvent::MarkRead { message_id } => {
            let result = dispatch::mark_read(state, handle.user_id(), &message_id).await;
            respond(handle, request_id, result);
        }
        ClientEvent::FetchHistory {
            room,
            before_sequence,
            limit,
        } => {
            let result =
                dispatch::history(state, handle.user_id(), &room, before_sequence, limit).await;
            respond(handle, request_id, result);
        }
        ClientEvent::TypingStart { room } => {
            typing::relay(state, &room, handle.user_id(), handle.id(), true);
        }
        ClientEvent::TypingStop { room } => {
            typing::relay(state, &room, handle.user_id(), handle.id(), false);
        }
    }
}

fn respond(handle: &ConnectionHandle, request_id: &str, result: Result<ServerEvent, SendError>) {
    match result {
        Ok(event) => send_envelope(handle.sender(), &ServerEnvelope::reply(request_id, event)),
        Err(e) => reply_error(handle, request_id, &e),
    }
}

fn reply_error(handle: &ConnectionHandle, request_id: &str, error: &SendError) {
    if error.is_storage() {
        tracing::error!(user_id = %handle.user_id(), error = %error, "request failed in storage");
    } else {
        tracing::debug!(user_id = %handle.user_id(), code = error.code(), "request rejected");
    }
    send_error(handle.sender(), request_id, error.code(), error.to_string());
}

async fn handle_join(
    state: &AppState,
    handle: &ConnectionHandle,
    joined: &mut HashSet<String>,
    request_id: &str,
    room: &str,
) {
    let Some(key) = RoomKey::parse(room) else {
        send_error(
            handle.sender(),
            request_id,
            "bad_room",
            format!("malformed room key: {}", room),
        );
        return;
    };

    // Durable authorization before any live-state mutation.
    let store = state.store.clone();
    let user = handle.user_id().to_string();
    let check_key = key.clone();
    let authorized = tokio::task::spawn_blocking(move || {
        dispatch::ensure_room_access(store.as_ref(), &check_key, &user)
    })
    .await;
    match authorized {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            reply_error(handle, request_id, &e);
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "room authorization task failed");
            send_error(
                handle.sender(),
                request_id,
                "storage",
                "room authorization failed".to_string(),
            );
            return;
        }
    }

    if state.rooms.join(key.as_str(), handle.user_id()) {
        // Other member sessions learn about the change; the joiner gets
        // the correlated snapshot below.
        broadcast::broadcast_room_presence_except(state, key.as_str(), handle.id());
        tracing::debug!(user_id = %handle.user_id(), room = %key, "joined room");
    }
    joined.insert(key.as_str().to_string());

    let online_members = state.rooms.members_online(key.as_str(), &state.presence);
    send_envelope(
        handle.sender(),
        &ServerEnvelope::reply(
            request_id,
            ServerEvent::RoomPresence {
                room: key.into_string(),
                online_members,
            },
        ),
    );
}

fn handle_leave(
    state: &AppState,
    handle: &ConnectionHandle,
    joined: &mut HashSet<String>,
    request_id: &str,
    room: &str,
) {
    let Some(key) = RoomKey::parse(room) else {
        send_error(
            handle.sender(),
            request_id,
            "bad_room",
            format!("malformed room key: {}", room),
        );
        return;
    };

    joined.remove(key.as_str());
    if state.rooms.leave(key.as_str(), handle.user_id()) {
        broadcast::broadcast_room_presence_except(state, key.as_str(), handle.id());
        tracing::debug!(user_id = %handle.user_id(), room = %key, "left room");
    }

    let online_members = state.rooms.members_online(key.as_str(), &state.presence);
    send_envelope(
        handle.sender(),
        &ServerEnvelope::reply(
            request_id,
            ServerEvent::RoomPresence {
                room: key.into_string(),
                online_members,
            },
        ),
    );
}
