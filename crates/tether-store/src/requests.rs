//! Fetch requests observed by [`ListDatabaseObserver`](crate::ListDatabaseObserver)
//! and [`EntityDatabaseObserver`](crate::EntityDatabaseObserver).

use rusqlite::Connection;

use tether_shared::api::ChannelListQuery;
use tether_shared::{ChannelId, MessageId};

use crate::channels::load_channel;
use crate::error::Result;
use crate::messages::{channel_messages, message_by_id, thread_replies};
use crate::models::{Channel, Message};
use crate::notify::Table;
use crate::query_links::linked_channels;

/// A predicate plus sort order over persisted rows.
pub trait FetchRequest: Send + Sync + 'static {
    type Row: Send + 'static;

    /// Tables whose commits can change the result.
    fn tables(&self) -> Vec<Table>;

    /// Table whose row ids identify result rows.
    fn identity_table(&self) -> Table;

    /// Ordered `(row_id, row)` pairs.
    fn fetch(&self, conn: &Connection) -> Result<Vec<(i64, Self::Row)>>;
}

/// Channels linked to a list query.
///
/// With `apply_filter` set, linked channels that no longer satisfy the
/// query's filter are left out of the result.
#[derive(Debug, Clone)]
pub struct ChannelListRequest {
    pub query: ChannelListQuery,
    pub apply_filter: bool,
}

impl FetchRequest for ChannelListRequest {
    type Row = Channel;

    fn tables(&self) -> Vec<Table> {
        vec![Table::Channels, Table::QueryLinks]
    }

    fn identity_table(&self) -> Table {
        Table::Channels
    }

    fn fetch(&self, conn: &Connection) -> Result<Vec<(i64, Channel)>> {
        let mut rows = linked_channels(conn, &self.query)?;
        if self.apply_filter {
            rows.retain(|(_, channel)| self.query.filter.matches(channel));
        }
        Ok(rows)
    }
}

/// Top-level messages of one channel, oldest first.
#[derive(Debug, Clone)]
pub struct ChannelMessagesRequest {
    pub cid: ChannelId,
}

impl FetchRequest for ChannelMessagesRequest {
    type Row = Message;

    fn tables(&self) -> Vec<Table> {
        vec![Table::Messages]
    }

    fn identity_table(&self) -> Table {
        Table::Messages
    }

    fn fetch(&self, conn: &Connection) -> Result<Vec<(i64, Message)>> {
        channel_messages(conn, &self.cid)
    }
}

/// Replies to one parent message, oldest first.
#[derive(Debug, Clone)]
pub struct ThreadRepliesRequest {
    pub parent_id: MessageId,
}

impl FetchRequest for ThreadRepliesRequest {
    type Row = Message;

    fn tables(&self) -> Vec<Table> {
        vec![Table::Messages]
    }

    fn identity_table(&self) -> Table {
        Table::Messages
    }

    fn fetch(&self, conn: &Connection) -> Result<Vec<(i64, Message)>> {
        thread_replies(conn, &self.parent_id)
    }
}

#[derive(Debug, Clone)]
pub struct ChannelRequest {
    pub cid: ChannelId,
}

impl FetchRequest for ChannelRequest {
    type Row = Channel;

    fn tables(&self) -> Vec<Table> {
        vec![Table::Channels]
    }

    fn identity_table(&self) -> Table {
        Table::Channels
    }

    fn fetch(&self, conn: &Connection) -> Result<Vec<(i64, Channel)>> {
        let row_id = crate::channels::channel_row_id(conn, &self.cid)?;
        let channel = load_channel(conn, &self.cid)?;
        Ok(row_id.zip(channel).into_iter().collect())
    }
}

#[derive(Debug, Clone)]
pub struct MessageRequest {
    pub id: MessageId,
}

impl FetchRequest for MessageRequest {
    type Row = Message;

    fn tables(&self) -> Vec<Table> {
        vec![Table::Messages]
    }

    fn identity_table(&self) -> Table {
        Table::Messages
    }

    fn fetch(&self, conn: &Connection) -> Result<Vec<(i64, Message)>> {
        message_by_id(conn, &self.id)
    }
}
