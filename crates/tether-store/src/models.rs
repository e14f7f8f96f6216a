//! Plain data models handed to consumers. Never raw rows.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tether_shared::protocol::AttachmentPayload;
use tether_shared::{ChannelId, FilterTarget, MessageId, UserId};

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub cid: ChannelId,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub truncated_at: Option<DateTime<Utc>>,
    pub is_hidden: bool,
    pub members: Vec<UserId>,
    pub reads: Vec<ChannelRead>,
}

impl Channel {
    pub fn is_member(&self, user: &UserId) -> bool {
        self.members.contains(user)
    }

    pub fn read_for(&self, user: &UserId) -> Option<&ChannelRead> {
        self.reads.iter().find(|read| &read.user == user)
    }
}

impl FilterTarget for Channel {
    fn field(&self, name: &str) -> Option<Value> {
        match name {
            "cid" => Some(Value::from(self.cid.to_string())),
            "type" => Some(Value::from(self.cid.kind.clone())),
            "id" => Some(Value::from(self.cid.id.clone())),
            "name" => self.name.clone().map(Value::from),
            "hidden" => Some(Value::from(self.is_hidden)),
            "deleted" => Some(Value::from(self.deleted_at.is_some())),
            _ => None,
        }
    }

    fn has_member(&self, user: &UserId) -> bool {
        self.is_member(user)
    }
}

/// A member's read cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRead {
    pub user: UserId,
    pub last_read: DateTime<Utc>,
    pub last_delivered_at: Option<DateTime<Utc>>,
    pub unread_messages: u32,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Sync state of a locally originated change. `None` on a message means it
/// matches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalMessageState {
    PendingSend,
    Sending,
    SendingFailed,
    PendingSync,
    SyncFailed,
}

impl LocalMessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalMessageState::PendingSend => "pending_send",
            LocalMessageState::Sending => "sending",
            LocalMessageState::SendingFailed => "sending_failed",
            LocalMessageState::PendingSync => "pending_sync",
            LocalMessageState::SyncFailed => "sync_failed",
        }
    }
}

impl fmt::Display for LocalMessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LocalMessageState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_send" => Ok(LocalMessageState::PendingSend),
            "sending" => Ok(LocalMessageState::Sending),
            "sending_failed" => Ok(LocalMessageState::SendingFailed),
            "pending_sync" => Ok(LocalMessageState::PendingSync),
            "sync_failed" => Ok(LocalMessageState::SyncFailed),
            other => Err(format!("unknown local state `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub cid: ChannelId,
    pub author: UserId,
    pub text: String,
    /// Ordering timestamp for every pagination comparison.
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub local_state: Option<LocalMessageState>,
    pub locally_created_at: Option<DateTime<Utc>>,
    pub parent_id: Option<MessageId>,
    pub reaction_counts: BTreeMap<String, u32>,
    pub reaction_scores: BTreeMap<String, u32>,
    pub attachments: Vec<AttachmentPayload>,
}

impl Message {
    /// A locally created message awaiting its first send.
    pub fn pending(
        cid: ChannelId,
        author: UserId,
        text: String,
        parent_id: Option<MessageId>,
        attachments: Vec<AttachmentPayload>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::new_local(),
            cid,
            author,
            text,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            local_state: Some(LocalMessageState::PendingSend),
            locally_created_at: Some(now),
            parent_id,
            reaction_counts: BTreeMap::new(),
            reaction_scores: BTreeMap::new(),
            attachments,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// Timestamp columns
// ---------------------------------------------------------------------------

/// Fixed-width RFC-3339 so that text ordering equals time ordering.
pub(crate) fn to_sql_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn opt_sql_ts(ts: &Option<DateTime<Utc>>) -> Option<String> {
    ts.as_ref().map(to_sql_ts)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_timestamps_sort_lexicographically() {
        let early = DateTime::parse_from_rfc3339("2024-01-01T09:59:59.5Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2024-01-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(to_sql_ts(&early) < to_sql_ts(&late));
        assert_eq!(parse_ts(0, &to_sql_ts(&late)).unwrap(), late);
    }

    #[test]
    fn test_local_state_round_trips_through_text() {
        for state in [
            LocalMessageState::PendingSend,
            LocalMessageState::Sending,
            LocalMessageState::SendingFailed,
            LocalMessageState::PendingSync,
            LocalMessageState::SyncFailed,
        ] {
            assert_eq!(state.as_str().parse::<LocalMessageState>().unwrap(), state);
        }
        assert!("synced".parse::<LocalMessageState>().is_err());
    }

    #[test]
    fn test_pending_message_defaults() {
        let msg = Message::pending(
            ChannelId::new("messaging", "general"),
            UserId::from("alice"),
            "hi".into(),
            None,
            Vec::new(),
        );
        assert_eq!(msg.local_state, Some(LocalMessageState::PendingSend));
        assert_eq!(msg.locally_created_at, Some(msg.created_at));
    }
}
