//! Persistence interface for the realtime layer.
//!
//! The realtime server does not own the social graph — users, groups and
//! chats are provisioned by the platform application. Everything the
//! dispatcher and the presence layer need from disk goes through the
//! [`Store`] trait so tests can swap the backend.

pub mod sqlite;

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use sqlite::SqliteStore;

#[derive(Debug)]
pub enum StoreError {
    /// Underlying database failure.
    Db(String),
    /// The connection mutex was poisoned by a panicking writer.
    LockPoisoned,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Db(e) => write!(f, "database error: {}", e),
            StoreError::LockPoisoned => write!(f, "database lock poisoned"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Db(e.to_string())
    }
}

/// A platform user, read-only at this layer.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub display_name: String,
}

/// A platform group with its membership lists.
#[derive(Debug, Clone)]
pub struct GroupRecord {
    pub id: String,
    pub name: String,
    pub members: Vec<String>,
    pub admins: Vec<String>,
}

/// A one-to-one conversation. Participants are stored in lexicographic
/// order so the unique index can enforce at most one chat per pair.
#[derive(Debug, Clone)]
pub struct ChatRecord {
    pub id: String,
    pub participant_a: String,
    pub participant_b: String,
    pub last_message_text: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: i64,
}

/// One read receipt on a message, at most one per user.
#[derive(Debug, Clone, Serialize)]
pub struct ReadReceipt {
    pub user_id: String,
    pub read_at: DateTime<Utc>,
}

/// One reaction on a message, at most one per user, last write wins.
#[derive(Debug, Clone, Serialize)]
pub struct ReactionEntry {
    pub user_id: String,
    pub reaction: String,
    pub reacted_at: DateTime<Utc>,
}

/// A persisted message as it travels over the wire.
///
/// Exactly one of `recipient_id` / `group_id` is set. `room_sequence` is
/// assigned at persist time and increases monotonically within a room.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub id: String,
    pub room_key: String,
    pub sender_id: String,
    pub recipient_id: Option<String>,
    pub group_id: Option<String>,
    pub content: String,
    pub room_sequence: i64,
    pub created_at: DateTime<Utc>,
    pub edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub read_by: Vec<ReadReceipt>,
    pub reactions: Vec<ReactionEntry>,
}

/// Input to [`Store::save_message`]. Id, sequence and timestamp are
/// assigned by the store.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: String,
    pub recipient_id: Option<String>,
    pub group_id: Option<String>,
    pub room_key: String,
    pub content: String,
}

/// One page of history, newest first.
#[derive(Debug, Clone)]
pub struct MessagePage {
    pub messages: Vec<MessageRecord>,
    pub has_more: bool,
}

/// Synchronous persistence operations.
///
/// Implementations are called from async code via
/// `tokio::task::spawn_blocking`; they must never block on anything but
/// the database itself.
pub trait Store: Send + Sync {
    fn find_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError>;

    fn find_group(&self, group_id: &str) -> Result<Option<GroupRecord>, StoreError>;

    /// Look up the chat for an unordered user pair, creating it if absent.
    /// Concurrent callers for the same pair converge on one row.
    fn find_or_create_personal_chat(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> Result<ChatRecord, StoreError>;

    /// Persist a message, assigning id, timestamp and the next per-room
    /// sequence number. For personal messages the chat row is created if
    /// needed and its preview/unread fields are updated in the same
    /// transaction.
    fn save_message(&self, new: NewMessage) -> Result<MessageRecord, StoreError>;

    fn load_message(&self, message_id: &str) -> Result<Option<MessageRecord>, StoreError>;

    fn apply_edit(
        &self,
        message_id: &str,
        content: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Soft delete: the row stays, flagged, and drops out of history.
    fn apply_soft_delete(&self, message_id: &str) -> Result<(), StoreError>;

    /// Set or replace the user's reaction; `None` clears it.
    fn upsert_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        reaction: Option<&str>,
        reacted_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Record that `user_id` read the message. Returns false if a receipt
    /// already existed. For personal chats a read by the non-sender resets
    /// the chat's unread counter.
    fn append_read_receipt(
        &self,
        message_id: &str,
        user_id: &str,
        read_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Page through a room's messages, newest first, soft-deleted rows
    /// excluded. `before_sequence` restricts to strictly older messages.
    fn query_messages(
        &self,
        room_key: &str,
        before_sequence: Option<i64>,
        limit: u32,
    ) -> Result<MessagePage, StoreError>;

    /// Everyone who should see this user's presence: co-members of any
    /// group the user belongs to plus partners of any personal chat.
    /// The user itself is not included.
    fn contacts_of(&self, user_id: &str) -> Result<HashSet<String>, StoreError>;
}
