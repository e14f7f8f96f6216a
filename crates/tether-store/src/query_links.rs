//! Channel list query links.
//!
//! A link row says "this channel belongs to the result set of this query".
//! Links are keyed by [`ChannelListQuery::key`].

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use tether_shared::api::{ChannelListQuery, ChannelSort, ChannelSortField};
use tether_shared::ChannelId;

use crate::channels::{channel_columns, query_channels};
use crate::database::{Store, WriteSession};
use crate::error::Result;
use crate::models::{to_sql_ts, Channel};
use crate::notify::{RowChangeKind, Table};

impl WriteSession<'_> {
    /// Link a stored channel to a query. Returns `false` if it was already
    /// linked or the channel is unknown.
    pub fn link_channel(&mut self, query_key: &str, cid: &ChannelId) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO query_links (query_key, cid, linked_at)
             SELECT ?1, cid, ?3 FROM channels WHERE cid = ?2",
            params![query_key, cid.to_string(), to_sql_ts(&Utc::now())],
        )?;
        if inserted == 0 {
            return Ok(false);
        }
        let row_id = self.conn().last_insert_rowid();
        self.record(Table::QueryLinks, row_id, RowChangeKind::Insert);
        Ok(true)
    }

    pub fn unlink_channel(&mut self, query_key: &str, cid: &ChannelId) -> Result<bool> {
        let Some(row_id) = link_row_id(self.conn(), query_key, cid)? else {
            return Ok(false);
        };
        self.conn()
            .execute("DELETE FROM query_links WHERE row_id = ?1", params![row_id])?;
        self.record(Table::QueryLinks, row_id, RowChangeKind::Delete);
        Ok(true)
    }

    pub fn is_linked(&self, query_key: &str, cid: &ChannelId) -> Result<bool> {
        Ok(link_row_id(self.conn(), query_key, cid)?.is_some())
    }
}

impl Store {
    pub fn is_linked(&self, query_key: &str, cid: &ChannelId) -> Result<bool> {
        let (key, cid) = (query_key.to_string(), cid.clone());
        self.read(move |conn| Ok(link_row_id(conn, &key, &cid)?.is_some()))
    }

    /// Number of channels linked to a query, used as the next page offset.
    pub fn linked_count(&self, query_key: &str) -> Result<usize> {
        let key = query_key.to_string();
        self.read(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM query_links WHERE query_key = ?1",
                params![key],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    pub fn linked_channels(&self, query: &ChannelListQuery) -> Result<Vec<Channel>> {
        let query = query.clone();
        self.read(move |conn| {
            Ok(linked_channels(conn, &query)?
                .into_iter()
                .map(|(_, channel)| channel)
                .collect())
        })
    }
}

fn link_row_id(conn: &Connection, query_key: &str, cid: &ChannelId) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT row_id FROM query_links WHERE query_key = ?1 AND cid = ?2",
            params![query_key, cid.to_string()],
            |row| row.get(0),
        )
        .optional()?)
}

/// Channels linked to `query` in the query's sort order. Deleted channels are
/// never listed; hidden ones only when the filter asks for them.
pub(crate) fn linked_channels(conn: &Connection, query: &ChannelListQuery) -> Result<Vec<(i64, Channel)>> {
    let hidden_clause = if query.filter.selects_hidden() {
        ""
    } else {
        "AND c.hidden = 0"
    };
    let sql = format!(
        "SELECT {} FROM channels c
         JOIN query_links l ON l.cid = c.cid
         WHERE l.query_key = ?1 AND c.deleted_at IS NULL {hidden_clause}
         ORDER BY {}",
        channel_columns(),
        order_by(&query.sort),
    );
    query_channels(conn, &sql, params![query.key()])
}

fn order_by(sort: &[ChannelSort]) -> String {
    let mut terms: Vec<String> = sort
        .iter()
        .map(|s| {
            let column = match s.field {
                ChannelSortField::LastMessageAt => "COALESCE(c.last_message_at, c.created_at)",
                ChannelSortField::UpdatedAt => "c.updated_at",
                ChannelSortField::CreatedAt => "c.created_at",
            };
            format!("{column} {}", if s.ascending { "ASC" } else { "DESC" })
        })
        .collect();
    terms.push("c.cid ASC".to_string());
    terms.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::tests::{channel_payload, ts};
    use tether_shared::Filter;

    fn open() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_at(&dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_link_unlink() {
        let (_dir, store) = open();
        let query = ChannelListQuery::new(Filter::All);
        let key = query.key();
        let payload = channel_payload("messaging:general", &["alice"]);
        store.write(|s| s.save_channel(&payload)).unwrap();

        assert!(store.write(|s| s.link_channel(&key, &payload.cid)).unwrap());
        assert!(!store.write(|s| s.link_channel(&key, &payload.cid)).unwrap());
        assert!(store.is_linked(&key, &payload.cid).unwrap());
        assert_eq!(store.linked_count(&key).unwrap(), 1);

        assert!(store.write(|s| s.unlink_channel(&key, &payload.cid)).unwrap());
        assert!(!store.write(|s| s.unlink_channel(&key, &payload.cid)).unwrap());
        assert_eq!(store.linked_count(&key).unwrap(), 0);
    }

    #[test]
    fn test_link_unknown_channel_is_noop() {
        let (_dir, store) = open();
        let cid: ChannelId = "messaging:ghost".parse().unwrap();
        assert!(!store.write(|s| s.link_channel("q", &cid)).unwrap());
    }

    #[test]
    fn test_linked_channels_sorted_and_filtered() {
        let (_dir, store) = open();
        let query = ChannelListQuery::new(Filter::All);
        let key = query.key();

        let mut old = channel_payload("messaging:old", &[]);
        old.last_message_at = Some(ts("2024-01-01T00:00:00Z"));
        let mut new = channel_payload("messaging:new", &[]);
        new.last_message_at = Some(ts("2024-02-01T00:00:00Z"));
        let mut hidden = channel_payload("messaging:hidden", &[]);
        hidden.hidden = true;
        let mut deleted = channel_payload("messaging:deleted", &[]);
        deleted.deleted_at = Some(ts("2024-01-05T00:00:00Z"));

        store
            .write(|s| {
                for payload in [&old, &new, &hidden, &deleted] {
                    s.save_channel(payload)?;
                    s.link_channel(&key, &payload.cid)?;
                }
                Ok(())
            })
            .unwrap();

        let cids: Vec<String> = store
            .linked_channels(&query)
            .unwrap()
            .into_iter()
            .map(|c| c.cid.to_string())
            .collect();
        assert_eq!(cids, vec!["messaging:new", "messaging:old"]);
    }

    #[test]
    fn test_remove_all_data_clears_links() {
        let (_dir, store) = open();
        let payload = channel_payload("messaging:general", &[]);
        store
            .write(|s| {
                s.save_channel(&payload)?;
                s.link_channel("q", &payload.cid)
            })
            .unwrap();

        store.remove_all_data().unwrap();
        assert_eq!(store.linked_count("q").unwrap(), 0);
        assert!(store.channel(&payload.cid).unwrap().is_none());
    }
}
