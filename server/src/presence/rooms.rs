//! Live room membership.
//!
//! A room is a broadcast scope: a group or a personal conversation.
//! Membership here is a subscription concept only and is lost on
//! disconnect; authorization always comes from the persistent store.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;

use crate::presence::PresenceRegistry;

/// room key -> subscribed user ids.
#[derive(Clone)]
pub struct RoomTracker {
    rooms: Arc<DashMap<String, HashSet<String>>>,
}

impl RoomTracker {
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
        }
    }

    /// Idempotent subscribe. Returns true if the user was newly added.
    pub fn join(&self, room_key: &str, user_id: &str) -> bool {
        self.rooms
            .entry(room_key.to_string())
            .or_default()
            .insert(user_id.to_string())
    }

    /// Idempotent unsubscribe. Returns true if the user was actually
    /// removed. Empty rooms are dropped from the map.
    pub fn leave(&self, room_key: &str, user_id: &str) -> bool {
        let mut removed = false;
        if let Some(mut members) = self.rooms.get_mut(room_key) {
            removed = members.remove(user_id);
        }
        self.rooms.remove_if(room_key, |_, members| members.is_empty());
        removed
    }

    pub fn is_member(&self, room_key: &str, user_id: &str) -> bool {
        self.rooms
            .get(room_key)
            .map(|members| members.contains(user_id))
            .unwrap_or(false)
    }

    /// Snapshot of the room's subscribed user ids.
    pub fn members(&self, room_key: &str) -> HashSet<String> {
        self.rooms
            .get(room_key)
            .map(|members| members.clone())
            .unwrap_or_default()
    }

    /// Subscribed members that currently have at least one live
    /// connection, sorted.
    pub fn members_online(&self, room_key: &str, registry: &PresenceRegistry) -> Vec<String> {
        let members = self.members(room_key);
        registry.online_among(members.iter())
    }
}

impl Default for RoomTracker {
    fn default() -> Self {
        Self::new()
    }
}
