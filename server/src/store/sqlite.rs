use std::collections::HashSet;
use std::sync::MutexGuard;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::DbPool;
use crate::store::{
    ChatRecord, GroupRecord, MessagePage, MessageRecord, NewMessage, ReactionEntry, ReadReceipt,
    Store, StoreError, UserRecord,
};

/// SQLite-backed [`Store`] over the shared connection.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbPool,
}

fn ordered_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        id: row.get(0)?,
        room_key: row.get(1)?,
        sender_id: row.get(2)?,
        recipient_id: row.get(3)?,
        group_id: row.get(4)?,
        content: row.get(5)?,
        room_sequence: row.get(6)?,
        created_at: row.get(7)?,
        edited: row.get(8)?,
        edited_at: row.get(9)?,
        deleted: row.get(10)?,
        read_by: Vec::new(),
        reactions: Vec::new(),
    })
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatRecord> {
    Ok(ChatRecord {
        id: row.get(0)?,
        participant_a: row.get(1)?,
        participant_b: row.get(2)?,
        last_message_text: row.get(3)?,
        last_message_at: row.get(4)?,
        unread_count: row.get(5)?,
    })
}

/// Fill in the read-by and reaction lists for already-loaded messages.
fn attach_annotations(conn: &Connection, messages: &mut [MessageRecord]) -> rusqlite::Result<()> {
    let mut reads = conn.prepare(
        "SELECT user_id, read_at FROM message_reads WHERE message_id = ?1 ORDER BY read_at",
    )?;
    let mut reactions = conn.prepare(
        "SELECT user_id, reaction, reacted_at FROM message_reactions
         WHERE message_id = ?1 ORDER BY reacted_at",
    )?;
    for message in messages.iter_mut() {
        message.read_by = reads
            .query_map([&message.id], |row| {
                Ok(ReadReceipt {
                    user_id: row.get(0)?,
                    read_at: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        message.reactions = reactions
            .query_map([&message.id], |row| {
                Ok(ReactionEntry {
                    user_id: row.get(0)?,
                    reaction: row.get(1)?,
                    reacted_at: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
    }
    Ok(())
}

impl SqliteStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Handle to the underlying connection pool for callers that need
    /// raw SQL (provisioning, maintenance, tests).
    pub fn pool(&self) -> DbPool {
        self.db.clone()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.db.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Insert a user row. Identity lifecycle lives in the platform
    /// application; rows here are a provisioned mirror.
    pub fn create_user(&self, user_id: &str, display_name: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (id, display_name, created_at) VALUES (?1, ?2, ?3)",
            params![user_id, display_name, Utc::now()],
        )?;
        Ok(())
    }

    /// Insert a group with its membership. Members listed in `admins`
    /// get the admin flag.
    pub fn create_group(
        &self,
        group_id: &str,
        name: &str,
        members: &[&str],
        admins: &[&str],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO groups (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![group_id, name, Utc::now()],
        )?;
        for member in members {
            tx.execute(
                "INSERT INTO group_members (group_id, user_id, is_admin, joined_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![group_id, member, admins.contains(member), Utc::now()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl Store for SqliteStore {
    fn find_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                "SELECT id, display_name FROM users WHERE id = ?1",
                [user_id],
                |row| {
                    Ok(UserRecord {
                        id: row.get(0)?,
                        display_name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    fn find_group(&self, group_id: &str) -> Result<Option<GroupRecord>, StoreError> {
        let conn = self.conn()?;
        let head = conn
            .query_row(
                "SELECT id, name FROM groups WHERE id = ?1",
                [group_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        let Some((id, name)) = head else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT user_id, is_admin FROM group_members WHERE group_id = ?1 ORDER BY user_id",
        )?;
        let rows = stmt.query_map([group_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?))
        })?;

        let mut members = Vec::new();
        let mut admins = Vec::new();
        for row in rows {
            let (user_id, is_admin) = row?;
            if is_admin {
                admins.push(user_id.clone());
            }
            members.push(user_id);
        }
        Ok(Some(GroupRecord {
            id,
            name,
            members,
            admins,
        }))
    }

    fn find_or_create_personal_chat(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> Result<ChatRecord, StoreError> {
        let (lo, hi) = ordered_pair(user_a, user_b);
        let conn = self.conn()?;
        // Insert-or-ignore under the unique participant index, then
        // re-read: concurrent callers for the same pair converge on the
        // row whichever of them created it.
        conn.execute(
            "INSERT INTO chats (id, participant_a, participant_b, unread_count, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)
             ON CONFLICT (participant_a, participant_b) DO NOTHING",
            params![Uuid::now_v7().to_string(), lo, hi, Utc::now()],
        )?;
        let chat = conn.query_row(
            "SELECT id, participant_a, participant_b, last_message_text, last_message_at,
                    unread_count
             FROM chats WHERE participant_a = ?1 AND participant_b = ?2",
            params![lo, hi],
            row_to_chat,
        )?;
        Ok(chat)
    }

    fn save_message(&self, new: NewMessage) -> Result<MessageRecord, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        // Next sequence number within the room. The connection mutex
        // serializes writers, so MAX+1 cannot race.
        let sequence: i64 = tx.query_row(
            "SELECT COALESCE(MAX(room_sequence), 0) + 1 FROM messages WHERE room_key = ?1",
            [new.room_key.as_str()],
            |row| row.get(0),
        )?;

        let id = Uuid::now_v7().to_string();
        let created_at = Utc::now();
        tx.execute(
            "INSERT INTO messages (id, room_key, sender_id, recipient_id, group_id, content,
                                   room_sequence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                new.room_key,
                new.sender_id,
                new.recipient_id,
                new.group_id,
                new.content,
                sequence,
                created_at
            ],
        )?;

        // Personal messages also maintain the chat row: lookup-or-create
        // plus preview and unread bookkeeping, inside the same transaction.
        if let Some(recipient_id) = &new.recipient_id {
            let (lo, hi) = ordered_pair(&new.sender_id, recipient_id);
            tx.execute(
                "INSERT INTO chats (id, participant_a, participant_b, unread_count, created_at)
                 VALUES (?1, ?2, ?3, 0, ?4)
                 ON CONFLICT (participant_a, participant_b) DO NOTHING",
                params![Uuid::now_v7().to_string(), lo, hi, created_at],
            )?;
            tx.execute(
                "UPDATE chats SET last_message_text = ?1, last_message_at = ?2,
                                  unread_count = unread_count + 1
                 WHERE participant_a = ?3 AND participant_b = ?4",
                params![new.content, created_at, lo, hi],
            )?;
        }
        tx.commit()?;

        Ok(MessageRecord {
            id,
            room_key: new.room_key,
            sender_id: new.sender_id,
            recipient_id: new.recipient_id,
            group_id: new.group_id,
            content: new.content,
            room_sequence: sequence,
            created_at,
            edited: false,
            edited_at: None,
            deleted: false,
            read_by: Vec::new(),
            reactions: Vec::new(),
        })
    }

    fn load_message(&self, message_id: &str) -> Result<Option<MessageRecord>, StoreError> {
        let conn = self.conn()?;
        let message = conn
            .query_row(
                "SELECT id, room_key, sender_id, recipient_id, group_id, content,
                        room_sequence, created_at, edited, edited_at, deleted
                 FROM messages WHERE id = ?1",
                [message_id],
                row_to_message,
            )
            .optional()?;
        let Some(mut message) = message else {
            return Ok(None);
        };
        attach_annotations(&conn, std::slice::from_mut(&mut message))?;
        Ok(Some(message))
    }

    fn apply_edit(
        &self,
        message_id: &str,
        content: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE messages SET content = ?1, edited = 1, edited_at = ?2
             WHERE id = ?3 AND deleted = 0",
            params![content, edited_at, message_id],
        )?;
        Ok(())
    }

    fn apply_soft_delete(&self, message_id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE messages SET deleted = 1 WHERE id = ?1",
            [message_id],
        )?;
        Ok(())
    }

    fn upsert_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        reaction: Option<&str>,
        reacted_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        match reaction {
            Some(value) => {
                conn.execute(
                    "INSERT INTO message_reactions (message_id, user_id, reaction, reacted_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (message_id, user_id)
                     DO UPDATE SET reaction = excluded.reaction, reacted_at = excluded.reacted_at",
                    params![message_id, user_id, value, reacted_at],
                )?;
            }
            None => {
                conn.execute(
                    "DELETE FROM message_reactions WHERE message_id = ?1 AND user_id = ?2",
                    params![message_id, user_id],
                )?;
            }
        }
        Ok(())
    }

    fn append_read_receipt(
        &self,
        message_id: &str,
        user_id: &str,
        read_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO message_reads (message_id, user_id, read_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (message_id, user_id) DO NOTHING",
            params![message_id, user_id, read_at],
        )?;
        if inserted > 0 {
            // A first read by the non-sender clears the personal chat's
            // unread counter.
            let participants: Option<(String, Option<String>)> = tx
                .query_row(
                    "SELECT sender_id, recipient_id FROM messages WHERE id = ?1",
                    [message_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if let Some((sender_id, Some(recipient_id))) = participants {
                if sender_id != user_id {
                    let (lo, hi) = ordered_pair(&sender_id, &recipient_id);
                    tx.execute(
                        "UPDATE chats SET unread_count = 0
                         WHERE participant_a = ?1 AND participant_b = ?2",
                        params![lo, hi],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(inserted > 0)
    }

    fn query_messages(
        &self,
        room_key: &str,
        before_sequence: Option<i64>,
        limit: u32,
    ) -> Result<MessagePage, StoreError> {
        let conn = self.conn()?;
        let limit = limit as i64;
        // Fetch one row past the page size to learn whether older rows
        // remain without a second COUNT query.
        let mut messages = match before_sequence {
            Some(before) => {
                let mut stmt = conn.prepare(
                    "SELECT id, room_key, sender_id, recipient_id, group_id, content,
                            room_sequence, created_at, edited, edited_at, deleted
                     FROM messages
                     WHERE room_key = ?1 AND deleted = 0 AND room_sequence < ?2
                     ORDER BY room_sequence DESC LIMIT ?3",
                )?;
                let rows = stmt
                    .query_map(params![room_key, before, limit + 1], row_to_message)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, room_key, sender_id, recipient_id, group_id, content,
                            room_sequence, created_at, edited, edited_at, deleted
                     FROM messages
                     WHERE room_key = ?1 AND deleted = 0
                     ORDER BY room_sequence DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![room_key, limit + 1], row_to_message)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        let has_more = messages.len() as i64 > limit;
        if has_more {
            messages.truncate(limit as usize);
        }
        attach_annotations(&conn, &mut messages)?;
        Ok(MessagePage { messages, has_more })
    }

    fn contacts_of(&self, user_id: &str) -> Result<HashSet<String>, StoreError> {
        let conn = self.conn()?;
        let mut contacts = HashSet::new();

        let mut stmt = conn.prepare(
            "SELECT DISTINCT gm2.user_id
             FROM group_members gm1
             JOIN group_members gm2 ON gm2.group_id = gm1.group_id
             WHERE gm1.user_id = ?1 AND gm2.user_id != ?1",
        )?;
        for row in stmt.query_map([user_id], |row| row.get::<_, String>(0))? {
            contacts.insert(row?);
        }

        let mut stmt = conn.prepare(
            "SELECT participant_a, participant_b FROM chats
             WHERE participant_a = ?1 OR participant_b = ?1",
        )?;
        for row in stmt.query_map([user_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })? {
            let (a, b) = row?;
            contacts.insert(if a == user_id { b } else { a });
        }

        Ok(contacts)
    }
}
