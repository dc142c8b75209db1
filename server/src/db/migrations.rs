use rusqlite_migration::{Migrations, M};

/// Define all schema migrations.
/// Uses SQLite user_version pragma for tracking — no migration table needed.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "-- Migration 1: social graph (mirrored from the platform database)

CREATE TABLE users (
    id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE groups (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE group_members (
    group_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    is_admin INTEGER NOT NULL DEFAULT 0,
    joined_at TEXT NOT NULL,
    PRIMARY KEY (group_id, user_id),
    FOREIGN KEY (group_id) REFERENCES groups(id),
    FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE INDEX idx_group_members_user ON group_members(user_id);
",
        ),
        M::up(
            "-- Migration 2: chats and messages

CREATE TABLE chats (
    id TEXT PRIMARY KEY,
    participant_a TEXT NOT NULL,
    participant_b TEXT NOT NULL,
    last_message_text TEXT,
    last_message_at TEXT,
    unread_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    FOREIGN KEY (participant_a) REFERENCES users(id),
    FOREIGN KEY (participant_b) REFERENCES users(id),
    CHECK (participant_a < participant_b)
);

-- One chat per unordered participant pair. Callers store the pair in
-- lexicographic order so the index can enforce uniqueness.
CREATE UNIQUE INDEX idx_chats_participants ON chats(participant_a, participant_b);

CREATE TABLE messages (
    id TEXT PRIMARY KEY,
    room_key TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    recipient_id TEXT,
    group_id TEXT,
    content TEXT NOT NULL,
    room_sequence INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    edited INTEGER NOT NULL DEFAULT 0,
    edited_at TEXT,
    deleted INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (sender_id) REFERENCES users(id),
    CHECK ((recipient_id IS NULL) != (group_id IS NULL))
);

CREATE INDEX idx_messages_room ON messages(room_key, room_sequence);

CREATE TABLE message_reads (
    message_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    read_at TEXT NOT NULL,
    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id)
);

CREATE TABLE message_reactions (
    message_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    reaction TEXT NOT NULL,
    reacted_at TEXT NOT NULL,
    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id)
);
",
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_valid() {
        assert!(migrations().validate().is_ok());
    }
}
