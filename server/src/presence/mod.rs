//! Live connection tracking.
//!
//! The registry maps a user id to the set of authenticated WebSocket
//! connections it currently owns. A user is online while at least one
//! handle is registered; the online/offline transitions are reported to
//! the caller exactly once so broadcast scoping stays with the session.

pub mod rooms;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;

/// Bounded outbound queue of one connection plus its overflow flag.
///
/// Pushes never block: a full queue sets the flag and drops the frame,
/// and the connection's writer task closes the socket once it sees the
/// flag. A slow consumer therefore never backpressures a sender.
#[derive(Clone)]
pub struct ConnectionSender {
    tx: mpsc::Sender<Message>,
    overflowed: Arc<AtomicBool>,
}

impl ConnectionSender {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self {
            tx,
            overflowed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Best-effort enqueue. Returns false if the frame was dropped.
    pub fn push(&self, message: Message) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.overflowed.store(true, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One authenticated connection as the rest of the server sees it.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    user_id: String,
    opened_at: DateTime<Utc>,
    sender: ConnectionSender,
}

impl ConnectionHandle {
    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// The connection's outbound queue.
    pub fn sender(&self) -> &ConnectionSender {
        &self.sender
    }

    /// Best-effort enqueue on this connection's outbound queue.
    pub fn push(&self, message: Message) -> bool {
        self.sender.push(message)
    }

    pub fn is_overflowed(&self) -> bool {
        self.sender.is_overflowed()
    }
}

/// user id -> live connection handles. Lock striping comes from dashmap;
/// there is no global lock across users.
#[derive(Clone)]
pub struct PresenceRegistry {
    entries: Arc<DashMap<String, Vec<ConnectionHandle>>>,
    next_connection_id: Arc<AtomicU64>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register an authenticated connection. The second return value is
    /// true when this was the user's first live connection (the
    /// came-online transition).
    pub fn bind(&self, user_id: &str, sender: ConnectionSender) -> (ConnectionHandle, bool) {
        let handle = ConnectionHandle {
            id: self.next_connection_id.fetch_add(1, Ordering::Relaxed),
            user_id: user_id.to_string(),
            opened_at: Utc::now(),
            sender,
        };
        let mut entry = self.entries.entry(user_id.to_string()).or_default();
        let came_online = entry.is_empty();
        entry.push(handle.clone());
        (handle, came_online)
    }

    /// Remove a connection by id. Idempotent; returns true exactly once
    /// per user, when the last handle goes away (the went-offline
    /// transition).
    pub fn record_disconnect(&self, handle: &ConnectionHandle) -> bool {
        let mut went_offline = false;
        if let Some(mut connections) = self.entries.get_mut(handle.user_id()) {
            let before = connections.len();
            connections.retain(|c| c.id != handle.id);
            went_offline = connections.len() < before && connections.is_empty();
        }
        // Drop the empty entry unless a concurrent bind already refilled it.
        self.entries
            .remove_if(handle.user_id(), |_, connections| connections.is_empty());
        went_offline
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.entries
            .get(user_id)
            .map(|connections| !connections.is_empty())
            .unwrap_or(false)
    }

    /// Snapshot of the user's live connections.
    pub fn sessions_for(&self, user_id: &str) -> Vec<ConnectionHandle> {
        self.entries
            .get(user_id)
            .map(|connections| connections.clone())
            .unwrap_or_default()
    }

    /// Filter a set of user ids down to the currently-online ones,
    /// sorted for deterministic output.
    pub fn online_among<'a>(&self, user_ids: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        let mut online: Vec<String> = user_ids
            .into_iter()
            .filter(|id| self.is_online(id))
            .cloned()
            .collect();
        online.sort();
        online
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
