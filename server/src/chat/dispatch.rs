//! Message dispatch: validate, authorize, persist, fan out, acknowledge.
//!
//! Every mutation follows the same shape. Input checks and target
//! resolution happen before anything touches the store; authorization
//! and the write share one `spawn_blocking` hop; fan-out runs only
//! after the write committed. Delivery is best-effort per recipient
//! and never fails the operation.

use std::fmt;
use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::chat::target::{RoomKey, RoomScope, Target};
use crate::state::AppState;
use crate::store::{MessageRecord, NewMessage, Store, StoreError};
use crate::ws::broadcast;
use crate::ws::protocol::{ServerEnvelope, ServerEvent};

/// Maximum message length in bytes after trimming.
pub const MAX_CONTENT_LENGTH: usize = 4000;
/// How long after creation a message may still be edited.
pub const EDIT_WINDOW_SECS: i64 = 15 * 60;
/// Default and maximum history page sizes.
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
pub const MAX_HISTORY_LIMIT: u32 = 100;

#[derive(Debug)]
pub enum SendError {
    EmptyContent,
    ContentTooLong,
    AmbiguousTarget,
    BadRoom,
    NotMember,
    RecipientNotFound,
    MessageNotFound,
    NotYourMessage,
    EditWindowElapsed,
    Storage(StoreError),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::EmptyContent => write!(f, "message content is empty"),
            SendError::ContentTooLong => {
                write!(f, "message content exceeds {} bytes", MAX_CONTENT_LENGTH)
            }
            SendError::AmbiguousTarget => {
                write!(f, "message must name exactly one recipient or group")
            }
            SendError::BadRoom => write!(f, "malformed room key"),
            SendError::NotMember => write!(f, "not a member of the target room"),
            SendError::RecipientNotFound => write!(f, "recipient does not exist"),
            SendError::MessageNotFound => write!(f, "message does not exist"),
            SendError::NotYourMessage => write!(f, "only the sender may modify a message"),
            SendError::EditWindowElapsed => write!(f, "edit window has elapsed"),
            SendError::Storage(e) => write!(f, "storage failure: {}", e),
        }
    }
}

impl std::error::Error for SendError {}

impl From<StoreError> for SendError {
    fn from(e: StoreError) -> Self {
        SendError::Storage(e)
    }
}

impl SendError {
    /// Stable wire code for the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            SendError::EmptyContent => "empty_content",
            SendError::ContentTooLong => "content_too_long",
            SendError::AmbiguousTarget => "ambiguous_target",
            SendError::BadRoom => "bad_room",
            SendError::NotMember => "not_member",
            SendError::RecipientNotFound => "recipient_not_found",
            SendError::MessageNotFound => "message_not_found",
            SendError::NotYourMessage => "not_your_message",
            SendError::EditWindowElapsed => "edit_window_elapsed",
            SendError::Storage(_) => "storage",
        }
    }

    /// Storage failures are server faults; everything else is caller input.
    pub fn is_storage(&self) -> bool {
        matches!(self, SendError::Storage(_))
    }
}

/// An inbound send as the protocol layer hands it over.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub content: String,
    pub recipient_id: Option<String>,
    pub group_id: Option<String>,
    pub room_hint: Option<String>,
}

fn validate_content(content: &str) -> Result<String, SendError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(SendError::EmptyContent);
    }
    if trimmed.len() > MAX_CONTENT_LENGTH {
        return Err(SendError::ContentTooLong);
    }
    Ok(trimmed.to_string())
}

/// Run a store closure on the blocking pool.
async fn run_store<T, F>(store: Arc<dyn Store>, f: F) -> Result<T, SendError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Store) -> Result<T, SendError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| SendError::Storage(StoreError::Db(format!("store task failed: {}", e))))?
}

fn load_live_message(store: &dyn Store, message_id: &str) -> Result<MessageRecord, SendError> {
    let record = store
        .load_message(message_id)?
        .ok_or(SendError::MessageNotFound)?;
    // Soft-deleted messages are gone as far as callers are concerned.
    if record.deleted {
        return Err(SendError::MessageNotFound);
    }
    Ok(record)
}

/// Durable recipient set of a message: the group's full member list or
/// the two chat participants, sender included. Store-backed, so offline
/// users and live room state do not affect it.
fn recipients_of(store: &dyn Store, record: &MessageRecord) -> Result<Vec<String>, SendError> {
    if let Some(group_id) = &record.group_id {
        let group = store.find_group(group_id)?;
        Ok(group.map(|g| g.members).unwrap_or_default())
    } else {
        let mut recipients = vec![record.sender_id.clone()];
        if let Some(recipient_id) = &record.recipient_id {
            recipients.push(recipient_id.clone());
        }
        Ok(recipients)
    }
}

fn ensure_participant(
    store: &dyn Store,
    record: &MessageRecord,
    user_id: &str,
) -> Result<(), SendError> {
    if let Some(group_id) = &record.group_id {
        let group = store.find_group(group_id)?.ok_or(SendError::NotMember)?;
        if !group.members.iter().any(|m| m == user_id) {
            return Err(SendError::NotMember);
        }
        Ok(())
    } else if record.sender_id == user_id || record.recipient_id.as_deref() == Some(user_id) {
        Ok(())
    } else {
        Err(SendError::NotMember)
    }
}

/// Durable authorization for a room: group rooms require the user in the
/// member list, personal rooms require the user to be one of the pair.
pub fn ensure_room_access(
    store: &dyn Store,
    room: &RoomKey,
    user_id: &str,
) -> Result<(), SendError> {
    match room.scope() {
        RoomScope::Group(group_id) => {
            let group = store.find_group(group_id)?.ok_or(SendError::NotMember)?;
            if group.members.iter().any(|m| m == user_id) {
                Ok(())
            } else {
                Err(SendError::NotMember)
            }
        }
        RoomScope::Personal(a, b) => {
            if a == user_id || b == user_id {
                Ok(())
            } else {
                Err(SendError::NotMember)
            }
        }
    }
}

/// Send a message. On success the persisted record has its id, per-room
/// sequence and timestamp filled in; `newMessage` has already been fanned
/// out to every live session of the durable recipient set.
pub async fn send(
    state: &AppState,
    sender_id: &str,
    request: SendRequest,
) -> Result<MessageRecord, SendError> {
    let content = validate_content(&request.content)?;
    let target = Target::resolve(
        sender_id,
        request.recipient_id.as_deref(),
        request.group_id.as_deref(),
        request.room_hint.as_deref(),
    )
    .ok_or(SendError::AmbiguousTarget)?;

    let sender = sender_id.to_string();
    let room_key = target.room_key(sender_id).into_string();
    let (record, recipients) = run_store(state.store.clone(), move |store| match &target {
        Target::Group(group_id) => {
            let group = store.find_group(group_id)?.ok_or(SendError::NotMember)?;
            if !group.members.iter().any(|m| m == &sender) {
                return Err(SendError::NotMember);
            }
            let record = store.save_message(NewMessage {
                sender_id: sender,
                recipient_id: None,
                group_id: Some(group_id.clone()),
                room_key,
                content,
            })?;
            Ok((record, group.members))
        }
        Target::Personal(recipient_id) => {
            if store.find_user(recipient_id)?.is_none() {
                return Err(SendError::RecipientNotFound);
            }
            let record = store.save_message(NewMessage {
                sender_id: sender.clone(),
                recipient_id: Some(recipient_id.clone()),
                group_id: None,
                room_key,
                content,
            })?;
            Ok((record, vec![sender, recipient_id.clone()]))
        }
    })
    .await?;

    broadcast::send_to_users(
        &state.presence,
        &recipients,
        &ServerEnvelope::push(ServerEvent::NewMessage {
            message: record.clone(),
        }),
    );
    tracing::debug!(
        message_id = %record.id,
        room = %record.room_key,
        sequence = record.room_sequence,
        "message dispatched"
    );
    Ok(record)
}

/// Edit a message's content. Sender-only, and only within the edit
/// window measured from creation.
pub async fn edit(
    state: &AppState,
    sender_id: &str,
    message_id: &str,
    content: &str,
) -> Result<ServerEvent, SendError> {
    let content = validate_content(content)?;
    let sender = sender_id.to_string();
    let message_id = message_id.to_string();
    let (event, recipients) = run_store(state.store.clone(), move |store| {
        let record = load_live_message(store, &message_id)?;
        if record.sender_id != sender {
            return Err(SendError::NotYourMessage);
        }
        let now = Utc::now();
        if now - record.created_at > Duration::seconds(EDIT_WINDOW_SECS) {
            return Err(SendError::EditWindowElapsed);
        }
        store.apply_edit(&record.id, &content, now)?;
        let recipients = recipients_of(store, &record)?;
        let event = ServerEvent::MessageEdited {
            message_id: record.id,
            room: record.room_key,
            content,
            edited_at: now,
        };
        Ok((event, recipients))
    })
    .await?;

    broadcast::send_to_users(&state.presence, &recipients, &ServerEnvelope::push(event.clone()));
    Ok(event)
}

/// Soft-delete a message. Sender-only; the row stays but drops out of
/// history and rejects further edits and reactions.
pub async fn delete(
    state: &AppState,
    sender_id: &str,
    message_id: &str,
) -> Result<ServerEvent, SendError> {
    let sender = sender_id.to_string();
    let message_id = message_id.to_string();
    let (event, recipients) = run_store(state.store.clone(), move |store| {
        let record = load_live_message(store, &message_id)?;
        if record.sender_id != sender {
            return Err(SendError::NotYourMessage);
        }
        store.apply_soft_delete(&record.id)?;
        let recipients = recipients_of(store, &record)?;
        let event = ServerEvent::MessageDeleted {
            message_id: record.id,
            room: record.room_key,
        };
        Ok((event, recipients))
    })
    .await?;

    broadcast::send_to_users(&state.presence, &recipients, &ServerEnvelope::push(event.clone()));
    Ok(event)
}

/// Set, replace or clear (`None`) the caller's reaction on a message.
/// Requires durable membership of the message's room; repeated identical
/// reactions are idempotent.
pub async fn react(
    state: &AppState,
    user_id: &str,
    message_id: &str,
    reaction: Option<&str>,
) -> Result<ServerEvent, SendError> {
    let user = user_id.to_string();
    let message_id = message_id.to_string();
    let reaction = reaction.map(str::to_string);
    let (event, recipients) = run_store(state.store.clone(), move |store| {
        let record = load_live_message(store, &message_id)?;
        ensure_participant(store, &record, &user)?;
        store.upsert_reaction(&record.id, &user, reaction.as_deref(), Utc::now())?;
        let recipients = recipients_of(store, &record)?;
        let event = ServerEvent::ReactionUpdated {
            message_id: record.id,
            room: record.room_key,
            user_id: user,
            reaction,
        };
        Ok((event, recipients))
    })
    .await?;

    broadcast::send_to_users(&state.presence, &recipients, &ServerEnvelope::push(event.clone()));
    Ok(event)
}

/// Record that the caller read a message. The receipt is appended at
/// most once per reader; only a first read fans out.
pub async fn mark_read(
    state: &AppState,
    reader_id: &str,
    message_id: &str,
) -> Result<ServerEvent, SendError> {
    let reader = reader_id.to_string();
    let message_id = message_id.to_string();
    let (event, recipients) = run_store(state.store.clone(), move |store| {
        let record = load_live_message(store, &message_id)?;
        ensure_participant(store, &record, &reader)?;
        let now = Utc::now();
        let newly_read = store.append_read_receipt(&record.id, &reader, now)?;
        let recipients = if newly_read {
            recipients_of(store, &record)?
        } else {
            Vec::new()
        };
        let event = ServerEvent::MessageRead {
            message_id: record.id,
            room: record.room_key,
            user_id: reader,
            read_at: now,
        };
        Ok((event, recipients))
    })
    .await?;

    if !recipients.is_empty() {
        broadcast::send_to_users(&state.presence, &recipients, &ServerEnvelope::push(event.clone()));
    }
    Ok(event)
}

/// Page through a room's history, newest first. The caller must be
/// durably authorized for the room.
pub async fn history(
    state: &AppState,
    caller_id: &str,
    room: &str,
    before_sequence: Option<i64>,
    limit: Option<u32>,
) -> Result<ServerEvent, SendError> {
    let key = RoomKey::parse(room).ok_or(SendError::BadRoom)?;
    let caller = caller_id.to_string();
    run_store(state.store.clone(), move |store| {
        ensure_room_access(store, &key, &caller)?;
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        let page = store.query_messages(key.as_str(), before_sequence, limit)?;
        Ok(ServerEvent::History {
            room: key.into_string(),
            messages: page.messages,
            has_more: page.has_more,
        })
    })
    .await
}
