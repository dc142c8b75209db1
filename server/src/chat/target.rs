//! Room keys and message target resolution.
//!
//! Every broadcast scope is addressed by a string room key:
//! `grp:{group_id}` for group rooms and `dm:{lo}:{hi}` for personal
//! rooms, where `lo`/`hi` are the two participant ids in lexicographic
//! order. Normalizing the pair makes the key independent of who opened
//! the conversation.

use std::fmt;

/// Parsed form of a room key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomScope {
    Group(String),
    /// Participants in lexicographic order.
    Personal(String, String),
}

/// Canonical key of a broadcast scope, kept alongside its parsed form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomKey {
    key: String,
    scope: RoomScope,
}

impl RoomKey {
    pub fn group(group_id: &str) -> Self {
        RoomKey {
            key: format!("grp:{}", group_id),
            scope: RoomScope::Group(group_id.to_string()),
        }
    }

    /// Key of the personal room for an unordered user pair.
    pub fn personal(user_a: &str, user_b: &str) -> Self {
        let (lo, hi) = if user_a <= user_b {
            (user_a, user_b)
        } else {
            (user_b, user_a)
        };
        RoomKey {
            key: format!("dm:{}:{}", lo, hi),
            scope: RoomScope::Personal(lo.to_string(), hi.to_string()),
        }
    }

    /// Parse a client-supplied key. Personal pairs are re-normalized so
    /// `dm:b:a` and `dm:a:b` name the same room. Degenerate pairs
    /// (`a == b`) and unknown prefixes are rejected.
    pub fn parse(raw: &str) -> Option<RoomKey> {
        if let Some(group_id) = raw.strip_prefix("grp:") {
            if group_id.is_empty() || group_id.contains(':') {
                return None;
            }
            return Some(RoomKey::group(group_id));
        }
        if let Some(pair) = raw.strip_prefix("dm:") {
            let (a, b) = pair.split_once(':')?;
            if a.is_empty() || b.is_empty() || a == b || b.contains(':') {
                return None;
            }
            return Some(RoomKey::personal(a, b));
        }
        None
    }

    pub fn scope(&self) -> &RoomScope {
        &self.scope
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn into_string(self) -> String {
        self.key
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Delivery target of a message, resolved exactly once at the protocol
/// boundary. Everything downstream switches on this instead of
/// re-inspecting raw fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// One-to-one message to this user.
    Personal(String),
    /// Message to all members of this group.
    Group(String),
}

impl Target {
    /// Resolve a target from the explicit recipient/group fields, falling
    /// back to a room-key hint. Returns `None` when the input names both,
    /// neither, or resolves to the sender itself.
    pub fn resolve(
        sender_id: &str,
        recipient_id: Option<&str>,
        group_id: Option<&str>,
        room_hint: Option<&str>,
    ) -> Option<Target> {
        match (recipient_id, group_id) {
            (Some(_), Some(_)) => None,
            (Some(recipient), None) => {
                if recipient == sender_id || recipient.is_empty() {
                    None
                } else {
                    Some(Target::Personal(recipient.to_string()))
                }
            }
            (None, Some(group)) => {
                if group.is_empty() {
                    None
                } else {
                    Some(Target::Group(group.to_string()))
                }
            }
            (None, None) => match RoomKey::parse(room_hint?)?.scope {
                RoomScope::Group(group) => Some(Target::Group(group)),
                RoomScope::Personal(a, b) => {
                    // The sender must be one side of the pair; the other
                    // side is the recipient.
                    if a == sender_id {
                        Some(Target::Personal(b))
                    } else if b == sender_id {
                        Some(Target::Personal(a))
                    } else {
                        None
                    }
                }
            },
        }
    }

    /// Room key of this target from the sender's point of view.
    pub fn room_key(&self, sender_id: &str) -> RoomKey {
        match self {
            Target::Personal(recipient) => RoomKey::personal(sender_id, recipient),
            Target::Group(group_id) => RoomKey::group(group_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn personal_key_is_order_independent() {
        assert_eq!(
            RoomKey::personal("bob", "alice"),
            RoomKey::personal("alice", "bob")
        );
        assert_eq!(RoomKey::personal("alice", "bob").as_str(), "dm:alice:bob");
    }

    #[test]
    fn parse_normalizes_and_rejects_garbage() {
        assert_eq!(
            RoomKey::parse("dm:bob:alice"),
            Some(RoomKey::personal("alice", "bob"))
        );
        assert_eq!(RoomKey::parse("grp:g1"), Some(RoomKey::group("g1")));
        assert_eq!(RoomKey::parse("dm:alice:alice"), None);
        assert_eq!(RoomKey::parse("dm:alice"), None);
        assert_eq!(RoomKey::parse("grp:"), None);
        assert_eq!(RoomKey::parse("voice:g1"), None);
        assert_eq!(RoomKey::parse(""), None);
    }

    #[test]
    fn resolve_requires_exactly_one_target() {
        assert_eq!(
            Target::resolve("alice", Some("bob"), None, None),
            Some(Target::Personal("bob".into()))
        );
        assert_eq!(
            Target::resolve("alice", None, Some("g1"), None),
            Some(Target::Group("g1".into()))
        );
        assert_eq!(
            Target::resolve("alice", Some("bob"), Some("g1"), None),
            None
        );
        assert_eq!(Target::resolve("alice", None, None, None), None);
        assert_eq!(Target::resolve("alice", Some("alice"), None, None), None);
    }

    #[test]
    fn resolve_infers_recipient_from_room_hint() {
        assert_eq!(
            Target::resolve("alice", None, None, Some("dm:alice:bob")),
            Some(Target::Personal("bob".into()))
        );
        assert_eq!(
            Target::resolve("bob", None, None, Some("dm:alice:bob")),
            Some(Target::Personal("alice".into()))
        );
        // Sender outside the pair cannot use the room.
        assert_eq!(
            Target::resolve("carol", None, None, Some("dm:alice:bob")),
            None
        );
        assert_eq!(
            Target::resolve("alice", None, None, Some("grp:g1")),
            Some(Target::Group("g1".into()))
        );
    }
}
