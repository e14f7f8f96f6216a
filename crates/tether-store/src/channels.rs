use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use tether_shared::protocol::{ChannelPayload, ReadPayload};
use tether_shared::{ChannelId, UserId};

use crate::database::{Store, WriteSession};
use crate::error::Result;
use crate::models::{opt_sql_ts, parse_json, parse_opt_ts, parse_ts, to_sql_ts, Channel, ChannelRead};
use crate::notify::{RowChangeKind, Table};

const CHANNEL_COLUMNS: &str = "c.row_id, c.cid, c.name, c.created_at, c.updated_at, \
     c.last_message_at, c.deleted_at, c.truncated_at, c.hidden, c.members";

impl WriteSession<'_> {
    /// Insert or update a channel from its server representation. The row id
    /// of an existing channel is preserved.
    pub fn save_channel(&mut self, payload: &ChannelPayload) -> Result<i64> {
        let cid = payload.cid.to_string();
        let members = serde_json::to_string(&payload.members)?;

        let existing = channel_row_id(self.conn(), &payload.cid)?;
        let row_id = match existing {
            Some(row_id) => {
                self.conn().execute(
                    "UPDATE channels
                     SET name = ?2, created_at = ?3, updated_at = ?4, last_message_at = ?5,
                         deleted_at = ?6, truncated_at = ?7, hidden = ?8, members = ?9
                     WHERE row_id = ?1",
                    params![
                        row_id,
                        payload.name,
                        to_sql_ts(&payload.created_at),
                        to_sql_ts(&payload.updated_at),
                        opt_sql_ts(&payload.last_message_at),
                        opt_sql_ts(&payload.deleted_at),
                        opt_sql_ts(&payload.truncated_at),
                        payload.hidden,
                        members,
                    ],
                )?;
                self.record(Table::Channels, row_id, RowChangeKind::Update);
                row_id
            }
            None => {
                self.conn().execute(
                    "INSERT INTO channels
                        (cid, kind, id, name, created_at, updated_at, last_message_at,
                         deleted_at, truncated_at, hidden, members)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        cid,
                        payload.cid.kind,
                        payload.cid.id,
                        payload.name,
                        to_sql_ts(&payload.created_at),
                        to_sql_ts(&payload.updated_at),
                        opt_sql_ts(&payload.last_message_at),
                        opt_sql_ts(&payload.deleted_at),
                        opt_sql_ts(&payload.truncated_at),
                        payload.hidden,
                        members,
                    ],
                )?;
                let row_id = self.conn().last_insert_rowid();
                self.record(Table::Channels, row_id, RowChangeKind::Insert);
                row_id
            }
        };

        for read in &payload.read {
            self.upsert_read(&payload.cid, read)?;
        }

        Ok(row_id)
    }

    pub fn channel(&self, cid: &ChannelId) -> Result<Option<Channel>> {
        load_channel(self.conn(), cid)
    }

    pub fn set_channel_hidden(&mut self, cid: &ChannelId, hidden: bool) -> Result<bool> {
        self.touch_channel(
            cid,
            "UPDATE channels SET hidden = ?2 WHERE row_id = ?1",
            hidden,
        )
    }

    pub fn mark_channel_deleted(&mut self, cid: &ChannelId, at: DateTime<Utc>) -> Result<bool> {
        self.touch_channel(
            cid,
            "UPDATE channels SET deleted_at = ?2 WHERE row_id = ?1",
            to_sql_ts(&at),
        )
    }

    /// Record a truncation and drop every message created at or before it.
    pub fn truncate_channel(&mut self, cid: &ChannelId, at: DateTime<Utc>) -> Result<bool> {
        let touched = self.touch_channel(
            cid,
            "UPDATE channels SET truncated_at = ?2 WHERE row_id = ?1",
            to_sql_ts(&at),
        )?;
        if touched {
            self.delete_messages_before(cid, &at)?;
        }
        Ok(touched)
    }

    /// Move a member's read cursor and reset their unread count.
    pub fn mark_read(&mut self, cid: &ChannelId, user: &UserId, at: DateTime<Utc>) -> Result<bool> {
        if channel_row_id(self.conn(), cid)?.is_none() {
            return Ok(false);
        }
        self.upsert_read(
            cid,
            &ReadPayload {
                user: user.clone(),
                last_read: at,
                last_delivered_at: None,
                unread_messages: 0,
            },
        )?;
        Ok(true)
    }

    /// Bump `last_message_at` if `at` is newer.
    pub fn bump_last_message_at(&mut self, cid: &ChannelId, at: DateTime<Utc>) -> Result<bool> {
        let Some(row_id) = channel_row_id(self.conn(), cid)? else {
            return Ok(false);
        };
        let ts = to_sql_ts(&at);
        let affected = self.conn().execute(
            "UPDATE channels SET last_message_at = ?2
             WHERE row_id = ?1 AND (last_message_at IS NULL OR last_message_at < ?2)",
            params![row_id, ts],
        )?;
        if affected > 0 {
            self.record(Table::Channels, row_id, RowChangeKind::Update);
        }
        Ok(affected > 0)
    }

    fn touch_channel<V: rusqlite::ToSql>(&mut self, cid: &ChannelId, sql: &str, value: V) -> Result<bool> {
        let Some(row_id) = channel_row_id(self.conn(), cid)? else {
            return Ok(false);
        };
        self.conn().execute(sql, params![row_id, value])?;
        self.record(Table::Channels, row_id, RowChangeKind::Update);
        Ok(true)
    }

    /// Reads are part of the channel model, so a read change is published as
    /// an update of the owning channel row.
    fn upsert_read(&mut self, cid: &ChannelId, read: &ReadPayload) -> Result<()> {
        self.conn().execute(
            "INSERT INTO channel_reads (cid, user_id, last_read, last_delivered_at, unread_messages)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (cid, user_id) DO UPDATE SET
                last_read = excluded.last_read,
                last_delivered_at = COALESCE(excluded.last_delivered_at, last_delivered_at),
                unread_messages = excluded.unread_messages",
            params![
                cid.to_string(),
                read.user.as_str(),
                to_sql_ts(&read.last_read),
                opt_sql_ts(&read.last_delivered_at),
                read.unread_messages,
            ],
        )?;
        if let Some(row_id) = channel_row_id(self.conn(), cid)? {
            self.record(Table::Channels, row_id, RowChangeKind::Update);
        }
        Ok(())
    }
}

impl Store {
    pub fn channel(&self, cid: &ChannelId) -> Result<Option<Channel>> {
        let cid = cid.clone();
        self.read(move |conn| load_channel(conn, &cid))
    }
}

pub(crate) fn channel_row_id(conn: &Connection, cid: &ChannelId) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT row_id FROM channels WHERE cid = ?1",
            params![cid.to_string()],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn load_channel(conn: &Connection, cid: &ChannelId) -> Result<Option<Channel>> {
    let sql = format!("SELECT {CHANNEL_COLUMNS} FROM channels c WHERE c.cid = ?1");
    let found = conn
        .query_row(&sql, params![cid.to_string()], row_to_channel)
        .optional()?;
    match found {
        Some((_, mut channel)) => {
            channel.reads = load_reads(conn, &channel.cid)?;
            Ok(Some(channel))
        }
        None => Ok(None),
    }
}

/// Run a channel query whose select list starts with [`CHANNEL_COLUMNS`],
/// attaching read cursors to each result.
pub(crate) fn query_channels<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<(i64, Channel)>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, row_to_channel)?;

    let mut channels = Vec::new();
    for row in rows {
        let (row_id, mut channel) = row?;
        channel.reads = load_reads(conn, &channel.cid)?;
        channels.push((row_id, channel));
    }
    Ok(channels)
}

pub(crate) fn channel_columns() -> &'static str {
    CHANNEL_COLUMNS
}

fn load_reads(conn: &Connection, cid: &ChannelId) -> Result<Vec<ChannelRead>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, last_read, last_delivered_at, unread_messages
         FROM channel_reads WHERE cid = ?1 ORDER BY user_id",
    )?;
    let rows = stmt.query_map(params![cid.to_string()], |row| {
        let user: String = row.get(0)?;
        let last_read: String = row.get(1)?;
        Ok(ChannelRead {
            user: UserId(user),
            last_read: parse_ts(1, &last_read)?,
            last_delivered_at: parse_opt_ts(2, row.get(2)?)?,
            unread_messages: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

fn row_to_channel(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, Channel)> {
    let row_id: i64 = row.get(0)?;
    let cid_str: String = row.get(1)?;
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    let members: String = row.get(9)?;

    let cid: ChannelId = cid_str.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
    })?;

    Ok((
        row_id,
        Channel {
            cid,
            name: row.get(2)?,
            created_at: parse_ts(3, &created_at)?,
            updated_at: parse_ts(4, &updated_at)?,
            last_message_at: parse_opt_ts(5, row.get(5)?)?,
            deleted_at: parse_opt_ts(6, row.get(6)?)?,
            truncated_at: parse_opt_ts(7, row.get(7)?)?,
            is_hidden: row.get(8)?,
            members: parse_json(9, &members)?,
            reads: Vec::new(),
        },
    ))
}
