//! # tether-store
//!
//! Local persisted state for the tether chat core, backed by SQLite.
//!
//! The [`Store`] is the single source of truth for channels, messages and
//! query links. Writes go through [`Store::write`] transactions that record
//! the rows they touch; committed changes are delivered in commit order to
//! [`ListDatabaseObserver`] and [`EntityDatabaseObserver`], which turn them
//! into typed change records.

pub mod change;
pub mod channels;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod notify;
pub mod observer;
pub mod query_links;
pub mod requests;

mod error;

pub use change::{apply_changes, EntityChange, ListChange};
pub use database::{Store, WriteSession};
pub use error::{Result, StoreError};
pub use models::*;
pub use notify::{ChangeSet, RowChange, RowChangeKind, Subscription, Table};
pub use observer::{EntityDatabaseObserver, ItemReuse, ListDatabaseObserver};
pub use requests::{
    ChannelListRequest, ChannelMessagesRequest, ChannelRequest, FetchRequest, MessageRequest,
    ThreadRepliesRequest,
};
