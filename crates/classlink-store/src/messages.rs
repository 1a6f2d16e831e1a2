//! CRUD operations for [`Message`] records.
//!
//! Per-conversation ordering is the server-assigned `created_at` column;
//! the only permitted mutation after insert is `is_read` flipping to 1.

use chrono::{DateTime, Utc};
use rusqlite::params;

use classlink_shared::types::{MessageId, MessageKind, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Message;

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new message.
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.conn().execute(
            "INSERT INTO messages (id, sender_id, receiver_id, content, kind, file_name, file_size, file_type, created_at, is_read)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                message.id.to_string(),
                message.sender_id.to_string(),
                message.receiver_id.to_string(),
                message.content,
                message.kind.as_str(),
                message.file_name,
                message.file_size,
                message.file_type,
                message.created_at.to_rfc3339(),
                message.read,
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single message by id.
    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("{SELECT_MESSAGE} WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Full history between two users, both directions, ascending by
    /// creation time.
    pub fn conversation(&self, a: UserId, b: UserId) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_MESSAGE}
             WHERE (sender_id = ?1 AND receiver_id = ?2)
                OR (sender_id = ?2 AND receiver_id = ?1)
             ORDER BY created_at ASC"
        ))?;

        let rows = stmt.query_map(params![a.to_string(), b.to_string()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Every message the user sent or received, ascending.  Backs the
    /// read-only history endpoint.
    pub fn messages_for_user(&self, user: UserId) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_MESSAGE}
             WHERE sender_id = ?1 OR receiver_id = ?1
             ORDER BY created_at ASC"
        ))?;

        let rows = stmt.query_map(params![user.to_string()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Persisted-but-unread messages addressed to the user, ascending.
    /// Replayed to the user's room on (re-)registration.
    pub fn pending_for(&self, user: UserId) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_MESSAGE}
             WHERE receiver_id = ?1 AND is_read = 0
             ORDER BY created_at ASC"
        ))?;

        let rows = stmt.query_map(params![user.to_string()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Number of unread messages from `from` to `to`.
    pub fn unread_count(&self, from: UserId, to: UserId) -> Result<i64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM messages
             WHERE sender_id = ?1 AND receiver_id = ?2 AND is_read = 0",
            params![from.to_string(), to.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Most recent message between the pair, if any.
    pub fn latest_between(&self, a: UserId, b: UserId) -> Result<Option<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_MESSAGE}
             WHERE (sender_id = ?1 AND receiver_id = ?2)
                OR (sender_id = ?2 AND receiver_id = ?1)
             ORDER BY created_at DESC
             LIMIT 1"
        ))?;

        let mut rows = stmt.query_map(params![a.to_string(), b.to_string()], row_to_message)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Mark every unread message from `from` to `to` as read, returning the
    /// affected ids so the senders' rooms can be notified.  Select and
    /// update run in one transaction so a concurrent insert cannot slip an
    /// id into the update that the caller never learns about.
    pub fn mark_conversation_read(&self, from: UserId, to: UserId) -> Result<Vec<MessageId>> {
        let tx = self.conn().unchecked_transaction()?;

        let ids = {
            let mut stmt = tx.prepare(
                "SELECT id FROM messages
                 WHERE sender_id = ?1 AND receiver_id = ?2 AND is_read = 0
                 ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map(params![from.to_string(), to.to_string()], |row| {
                let id_str: String = row.get(0)?;
                MessageId::parse(&id_str).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })
            })?;

            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };

        if !ids.is_empty() {
            let mut stmt = tx.prepare("UPDATE messages SET is_read = 1 WHERE id = ?1")?;
            for id in &ids {
                stmt.execute(params![id.to_string()])?;
            }
        }

        tx.commit()?;
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Remove the full bidirectional history between the pair.  A single
    /// statement, so the clear is atomic.  Returns the number of deleted
    /// messages.
    pub fn clear_conversation(&self, a: UserId, b: UserId) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM messages
             WHERE (sender_id = ?1 AND receiver_id = ?2)
                OR (sender_id = ?2 AND receiver_id = ?1)",
            params![a.to_string(), b.to_string()],
        )?;
        Ok(affected)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const SELECT_MESSAGE: &str = "SELECT id, sender_id, receiver_id, content, kind, file_name, file_size, file_type, created_at, is_read FROM messages";

/// Map a `rusqlite::Row` to a [`Message`].
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let sender_str: String = row.get(1)?;
    let receiver_str: String = row.get(2)?;
    let content: String = row.get(3)?;
    let kind_str: String = row.get(4)?;
    let file_name: Option<String> = row.get(5)?;
    let file_size: Option<i64> = row.get(6)?;
    let file_type: Option<String> = row.get(7)?;
    let created_str: String = row.get(8)?;
    let read: bool = row.get(9)?;

    let id = MessageId::parse(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let sender_id = UserId::parse(&sender_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let receiver_id = UserId::parse(&receiver_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let kind = MessageKind::parse(&kind_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Message {
        id,
        sender_id,
        receiver_id,
        content,
        kind,
        file_name,
        file_size,
        file_type,
        created_at,
        read,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use classlink_shared::types::Role;
    use crate::models::User;

    fn seed_user(db: &Database, role: Role) -> UserId {
        let id = UserId::new();
        db.create_user(&User {
            id,
            display_name: format!("u-{}", &id.to_string()[..8]),
            email: format!("{id}@example.edu"),
            role,
            verified: true,
            profile_image_url: None,
            is_online: false,
            created_at: Utc::now(),
        })
        .unwrap();
        id
    }

    fn text_message(sender: UserId, receiver: UserId, content: &str) -> Message {
        Message {
            id: MessageId::new(),
            sender_id: sender,
            receiver_id: receiver,
            content: content.into(),
            kind: MessageKind::Text,
            file_name: None,
            file_size: None,
            file_type: None,
            created_at: Utc::now(),
            read: false,
        }
    }

    #[test]
    fn insert_and_fetch_conversation() {
        let db = Database::open_in_memory().unwrap();
        let a = seed_user(&db, Role::User);
        let b = seed_user(&db, Role::Admin);

        db.insert_message(&text_message(a, b, "first")).unwrap();
        db.insert_message(&text_message(b, a, "second")).unwrap();

        let history = db.conversation(a, b).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "first");
        assert_eq!(history[1].content, "second");
        // Same history regardless of which side asks.
        assert_eq!(db.conversation(b, a).unwrap(), history);
    }

    #[test]
    fn mark_read_returns_affected_ids_once() {
        let db = Database::open_in_memory().unwrap();
        let a = seed_user(&db, Role::User);
        let b = seed_user(&db, Role::Admin);

        let m1 = text_message(a, b, "one");
        let m2 = text_message(a, b, "two");
        db.insert_message(&m1).unwrap();
        db.insert_message(&m2).unwrap();

        assert_eq!(db.unread_count(a, b).unwrap(), 2);

        let ids = db.mark_conversation_read(a, b).unwrap();
        assert_eq!(ids, vec![m1.id, m2.id]);
        assert_eq!(db.unread_count(a, b).unwrap(), 0);

        // Already read; nothing further to report.
        assert!(db.mark_conversation_read(a, b).unwrap().is_empty());
        assert!(db.get_message(m1.id).unwrap().read);
    }

    #[test]
    fn latest_between_picks_newest() {
        let db = Database::open_in_memory().unwrap();
        let a = seed_user(&db, Role::User);
        let b = seed_user(&db, Role::Admin);

        let mut old = text_message(a, b, "old");
        old.created_at = Utc::now() - chrono::Duration::minutes(5);
        let new = text_message(b, a, "new");
        db.insert_message(&old).unwrap();
        db.insert_message(&new).unwrap();

        let latest = db.latest_between(a, b).unwrap().unwrap();
        assert_eq!(latest.content, "new");
    }

    #[test]
    fn clear_removes_both_directions() {
        let db = Database::open_in_memory().unwrap();
        let a = seed_user(&db, Role::User);
        let b = seed_user(&db, Role::Admin);
        let c = seed_user(&db, Role::Admin);

        db.insert_message(&text_message(a, b, "a->b")).unwrap();
        db.insert_message(&text_message(b, a, "b->a")).unwrap();
        db.insert_message(&text_message(a, c, "a->c")).unwrap();

        assert_eq!(db.clear_conversation(a, b).unwrap(), 2);
        assert!(db.conversation(a, b).unwrap().is_empty());
        // The unrelated conversation survives.
        assert_eq!(db.conversation(a, c).unwrap().len(), 1);
    }

    #[test]
    fn pending_lists_only_unread_for_receiver() {
        let db = Database::open_in_memory().unwrap();
        let a = seed_user(&db, Role::User);
        let b = seed_user(&db, Role::Admin);

        let unread = text_message(a, b, "queued while offline");
        let mut read = text_message(a, b, "already seen");
        read.read = true;
        db.insert_message(&unread).unwrap();
        db.insert_message(&read).unwrap();

        let pending = db.pending_for(b).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, unread.id);
        assert!(db.pending_for(a).unwrap().is_empty());
    }
}
