use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use tether_shared::protocol::MessagePayload;
use tether_shared::{ChannelId, MessageId, UserId};

use crate::database::{Store, WriteSession};
use crate::error::{Result, StoreError};
use crate::models::{
    opt_sql_ts, parse_json, parse_opt_ts, parse_ts, to_sql_ts, LocalMessageState, Message,
};
use crate::notify::{RowChangeKind, Table};

const MESSAGE_COLUMNS: &str = "row_id, id, cid, user_id, text, created_at, updated_at, \
     deleted_at, local_state, locally_created_at, parent_id, reaction_counts, \
     reaction_scores, attachments";

impl WriteSession<'_> {
    /// Insert or update a message from its server representation. Server
    /// state clears any local state.
    pub fn save_message(&mut self, payload: &MessagePayload) -> Result<i64> {
        let existing = message_row_id(self.conn(), &payload.id)?;
        let row_id = match existing {
            Some(row_id) => {
                self.write_server_fields(row_id, payload)?;
                self.record(Table::Messages, row_id, RowChangeKind::Update);
                row_id
            }
            None => {
                self.conn().execute(
                    "INSERT INTO messages
                        (id, cid, user_id, text, created_at, updated_at, deleted_at,
                         parent_id, reaction_counts, reaction_scores, attachments)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        payload.id.as_str(),
                        payload.cid.to_string(),
                        payload.user.as_str(),
                        payload.text,
                        to_sql_ts(&payload.created_at),
                        to_sql_ts(&payload.updated_at),
                        opt_sql_ts(&payload.deleted_at),
                        payload.parent_id.as_ref().map(MessageId::as_str),
                        serde_json::to_string(&payload.reaction_counts)?,
                        serde_json::to_string(&payload.reaction_scores)?,
                        serde_json::to_string(&payload.attachments)?,
                    ],
                )?;
                let row_id = self.conn().last_insert_rowid();
                self.record(Table::Messages, row_id, RowChangeKind::Insert);
                row_id
            }
        };
        Ok(row_id)
    }

    /// Persist a locally created message.
    pub fn create_pending_message(&mut self, message: &Message) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO messages
                (id, cid, user_id, text, created_at, updated_at, deleted_at, local_state,
                 locally_created_at, parent_id, reaction_counts, reaction_scores, attachments)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                message.id.as_str(),
                message.cid.to_string(),
                message.author.as_str(),
                message.text,
                to_sql_ts(&message.created_at),
                to_sql_ts(&message.updated_at),
                opt_sql_ts(&message.deleted_at),
                message.local_state.map(|s| s.as_str()),
                opt_sql_ts(&message.locally_created_at),
                message.parent_id.as_ref().map(MessageId::as_str),
                serde_json::to_string(&message.reaction_counts)?,
                serde_json::to_string(&message.reaction_scores)?,
                serde_json::to_string(&message.attachments)?,
            ],
        )?;
        let row_id = self.conn().last_insert_rowid();
        self.record(Table::Messages, row_id, RowChangeKind::Insert);
        Ok(row_id)
    }

    pub fn set_local_state(
        &mut self,
        id: &MessageId,
        state: Option<LocalMessageState>,
    ) -> Result<()> {
        let row_id = message_row_id(self.conn(), id)?.ok_or(StoreError::NotFound)?;
        self.conn().execute(
            "UPDATE messages SET local_state = ?2 WHERE row_id = ?1",
            params![row_id, state.map(|s| s.as_str())],
        )?;
        self.record(Table::Messages, row_id, RowChangeKind::Update);
        Ok(())
    }

    /// Replace a pending message with its server-confirmed state in place.
    ///
    /// The local row keeps its row id even when the server assigned a new
    /// message id, so observers see an update rather than a remove and an
    /// insert. A row already saved under the server id (a realtime event that
    /// beat the confirmation) is dropped in the same transaction.
    pub fn confirm_message(&mut self, local_id: &MessageId, payload: &MessagePayload) -> Result<i64> {
        let row_id = message_row_id(self.conn(), local_id)?.ok_or(StoreError::NotFound)?;

        if &payload.id != local_id {
            if let Some(duplicate) = message_row_id(self.conn(), &payload.id)? {
                self.conn()
                    .execute("DELETE FROM messages WHERE row_id = ?1", params![duplicate])?;
                self.record(Table::Messages, duplicate, RowChangeKind::Delete);
            }
            self.conn().execute(
                "UPDATE messages SET id = ?2 WHERE row_id = ?1",
                params![row_id, payload.id.as_str()],
            )?;
        }

        self.write_server_fields(row_id, payload)?;
        self.record(Table::Messages, row_id, RowChangeKind::Update);
        Ok(row_id)
    }

    pub fn message(&self, id: &MessageId) -> Result<Option<Message>> {
        load_message(self.conn(), id)
    }

    pub(crate) fn delete_messages_before(&mut self, cid: &ChannelId, at: &DateTime<Utc>) -> Result<()> {
        let row_ids: Vec<i64> = {
            let mut stmt = self
                .conn()
                .prepare("SELECT row_id FROM messages WHERE cid = ?1 AND created_at <= ?2")?;
            let rows = stmt.query_map(params![cid.to_string(), to_sql_ts(at)], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for row_id in row_ids {
            self.conn()
                .execute("DELETE FROM messages WHERE row_id = ?1", params![row_id])?;
            self.record(Table::Messages, row_id, RowChangeKind::Delete);
        }
        Ok(())
    }

    fn write_server_fields(&self, row_id: i64, payload: &MessagePayload) -> Result<()> {
        self.conn().execute(
            "UPDATE messages
             SET cid = ?2, user_id = ?3, text = ?4, created_at = ?5, updated_at = ?6,
                 deleted_at = ?7, parent_id = ?8, reaction_counts = ?9,
                 reaction_scores = ?10, attachments = ?11, local_state = NULL
             WHERE row_id = ?1",
            params![
                row_id,
                payload.cid.to_string(),
                payload.user.as_str(),
                payload.text,
                to_sql_ts(&payload.created_at),
                to_sql_ts(&payload.updated_at),
                opt_sql_ts(&payload.deleted_at),
                payload.parent_id.as_ref().map(MessageId::as_str),
                serde_json::to_string(&payload.reaction_counts)?,
                serde_json::to_string(&payload.reaction_scores)?,
                serde_json::to_string(&payload.attachments)?,
            ],
        )?;
        Ok(())
    }
}

impl Store {
    pub fn message(&self, id: &MessageId) -> Result<Option<Message>> {
        let id = id.clone();
        self.read(move |conn| load_message(conn, &id))
    }

    /// Top-level messages of a channel in ascending creation order.
    pub fn channel_messages(&self, cid: &ChannelId) -> Result<Vec<Message>> {
        let cid = cid.clone();
        self.read(move |conn| {
            Ok(channel_messages(conn, &cid)?
                .into_iter()
                .map(|(_, message)| message)
                .collect())
        })
    }

    /// Messages still owned by `author` that never reached the server.
    pub fn pending_messages(&self, author: &UserId) -> Result<Vec<Message>> {
        let author = author.clone();
        self.read(move |conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE user_id = ?1 AND local_state IN ('pending_send', 'sending')
                 ORDER BY locally_created_at, row_id"
            );
            query_messages(conn, &sql, params![author.as_str()])
                .map(|rows| rows.into_iter().map(|(_, m)| m).collect())
        })
    }
}

pub(crate) fn message_row_id(conn: &Connection, id: &MessageId) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT row_id FROM messages WHERE id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn load_message(conn: &Connection, id: &MessageId) -> Result<Option<Message>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![id.as_str()], row_to_message)
        .optional()?
        .map(|(_, message)| message))
}

pub(crate) fn channel_messages(conn: &Connection, cid: &ChannelId) -> Result<Vec<(i64, Message)>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE cid = ?1 AND parent_id IS NULL
         ORDER BY created_at, row_id"
    );
    query_messages(conn, &sql, params![cid.to_string()])
}

pub(crate) fn thread_replies(conn: &Connection, parent: &MessageId) -> Result<Vec<(i64, Message)>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE parent_id = ?1
         ORDER BY created_at, row_id"
    );
    query_messages(conn, &sql, params![parent.as_str()])
}

pub(crate) fn message_by_id(conn: &Connection, id: &MessageId) -> Result<Vec<(i64, Message)>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
    query_messages(conn, &sql, params![id.as_str()])
}

fn query_messages<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<(i64, Message)>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, row_to_message)?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, Message)> {
    let row_id: i64 = row.get(0)?;
    let id: String = row.get(1)?;
    let cid_str: String = row.get(2)?;
    let user: String = row.get(3)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    let local_state: Option<String> = row.get(8)?;
    let parent_id: Option<String> = row.get(10)?;
    let reaction_counts: String = row.get(11)?;
    let reaction_scores: String = row.get(12)?;
    let attachments: String = row.get(13)?;

    let cid: ChannelId = cid_str.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
    })?;
    let local_state = local_state
        .map(|s| s.parse::<LocalMessageState>())
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, e.into())
        })?;

    Ok((
        row_id,
        Message {
            id: MessageId(id),
            cid,
            author: UserId(user),
            text: row.get(4)?,
            created_at: parse_ts(5, &created_at)?,
            updated_at: parse_ts(6, &updated_at)?,
            deleted_at: parse_opt_ts(7, row.get(7)?)?,
            local_state,
            locally_created_at: parse_opt_ts(9, row.get(9)?)?,
            parent_id: parent_id.map(MessageId),
            reaction_counts: parse_json(11, &reaction_counts)?,
            reaction_scores: parse_json(12, &reaction_scores)?,
            attachments: parse_json(13, &attachments)?,
        },
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::channels::tests::ts;

    pub(crate) fn message_payload(id: &str, cid: &str, created_at: &str) -> MessagePayload {
        MessagePayload {
            id: MessageId::from(id),
            cid: cid.parse().unwrap(),
            user: UserId::from("alice"),
            text: format!("text of {id}"),
            created_at: ts(created_at),
            updated_at: ts(created_at),
            deleted_at: None,
            parent_id: None,
            reaction_counts: BTreeMap::new(),
            reaction_scores: BTreeMap::new(),
            attachments: Vec::new(),
        }
    }

    fn open() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_at(&dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_channel_messages_ordered_by_created_at() {
        let (_dir, store) = open();
        let cid: ChannelId = "messaging:general".parse().unwrap();
        store
            .write(|s| {
                s.save_message(&message_payload("b", "messaging:general", "2024-01-01T10:00:02Z"))?;
                s.save_message(&message_payload("a", "messaging:general", "2024-01-01T10:00:01Z"))?;
                s.save_message(&message_payload("c", "messaging:other", "2024-01-01T10:00:00Z"))?;
                Ok(())
            })
            .unwrap();

        let ids: Vec<String> = store
            .channel_messages(&cid)
            .unwrap()
            .into_iter()
            .map(|m| m.id.0)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_confirm_message_remaps_id_in_place() {
        let (_dir, store) = open();
        let pending = Message::pending(
            "messaging:general".parse().unwrap(),
            UserId::from("alice"),
            "hello".into(),
            None,
            Vec::new(),
        );
        let local_row = store.write(|s| s.create_pending_message(&pending)).unwrap();

        let mut confirmed = message_payload("server-1", "messaging:general", "2024-01-01T10:00:00Z");
        confirmed.text = "hello".into();
        let confirmed_row = store
            .write(|s| s.confirm_message(&pending.id, &confirmed))
            .unwrap();

        assert_eq!(local_row, confirmed_row);
        assert!(store.message(&pending.id).unwrap().is_none());
        let stored = store.message(&confirmed.id).unwrap().unwrap();
        assert_eq!(stored.local_state, None);
        assert_eq!(stored.locally_created_at, pending.locally_created_at);
    }

    #[test]
    fn test_confirm_message_drops_realtime_duplicate() {
        let (_dir, store) = open();
        let cid: ChannelId = "messaging:general".parse().unwrap();
        let pending = Message::pending(cid.clone(), UserId::from("alice"), "hi".into(), None, Vec::new());
        store.write(|s| s.create_pending_message(&pending)).unwrap();

        let confirmed = message_payload("server-1", "messaging:general", "2024-01-01T10:00:00Z");
        store.write(|s| s.save_message(&confirmed)).unwrap();
        assert_eq!(store.channel_messages(&cid).unwrap().len(), 2);

        store.write(|s| s.confirm_message(&pending.id, &confirmed)).unwrap();
        let messages = store.channel_messages(&cid).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, confirmed.id);
    }

    #[test]
    fn test_set_local_state_on_missing_message() {
        let (_dir, store) = open();
        let err = store
            .write(|s| s.set_local_state(&MessageId::from("nope"), None))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[test]
    fn test_pending_messages_in_creation_order() {
        let (_dir, store) = open();
        let cid: ChannelId = "messaging:general".parse().unwrap();
        let first = Message::pending(cid.clone(), UserId::from("alice"), "1".into(), None, Vec::new());
        let second = Message::pending(cid.clone(), UserId::from("alice"), "2".into(), None, Vec::new());
        let failed = Message::pending(cid, UserId::from("alice"), "3".into(), None, Vec::new());
        store
            .write(|s| {
                s.create_pending_message(&first)?;
                s.create_pending_message(&second)?;
                s.create_pending_message(&failed)?;
                s.set_local_state(&failed.id, Some(LocalMessageState::SendingFailed))
            })
            .unwrap();

        let pending: Vec<MessageId> = store
            .pending_messages(&UserId::from("alice"))
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(pending, vec![first.id, second.id]);
    }
}
