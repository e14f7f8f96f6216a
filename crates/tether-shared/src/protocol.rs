use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ApiError, ProtocolError};
use crate::types::{ChannelId, MessageId, UserId};

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// A channel as described by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPayload {
    pub cid: ChannelId,
    #[serde(default)]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub truncated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub members: Vec<UserId>,
    #[serde(default)]
    pub read: Vec<ReadPayload>,
}

/// Read cursor of a single member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadPayload {
    pub user: UserId,
    pub last_read: DateTime<Utc>,
    #[serde(default)]
    pub last_delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_messages: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub cid: ChannelId,
    pub user: UserId,
    #[serde(default)]
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent_id: Option<MessageId>,
    #[serde(default)]
    pub reaction_counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub reaction_scores: BTreeMap<String, u32>,
    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub message_id: MessageId,
    pub user: UserId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_score")]
    pub score: u32,
}

fn default_score() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events pushed by the server over the realtime connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "health.check")]
    HealthCheck { connection_id: String },

    #[serde(rename = "message.new")]
    MessageNew {
        cid: ChannelId,
        message: MessagePayload,
        #[serde(default)]
        channel: Option<ChannelPayload>,
    },

    #[serde(rename = "message.updated")]
    MessageUpdated { cid: ChannelId, message: MessagePayload },

    #[serde(rename = "message.deleted")]
    MessageDeleted { cid: ChannelId, message: MessagePayload },

    #[serde(rename = "message.read")]
    MessageRead {
        cid: ChannelId,
        user: UserId,
        created_at: DateTime<Utc>,
    },

    #[serde(rename = "reaction.new")]
    ReactionNew {
        cid: ChannelId,
        message: MessagePayload,
        reaction: ReactionPayload,
    },

    #[serde(rename = "reaction.deleted")]
    ReactionDeleted {
        cid: ChannelId,
        message: MessagePayload,
        reaction: ReactionPayload,
    },

    #[serde(rename = "channel.created")]
    ChannelCreated { cid: ChannelId, channel: ChannelPayload },

    #[serde(rename = "channel.updated")]
    ChannelUpdated { cid: ChannelId, channel: ChannelPayload },

    #[serde(rename = "channel.deleted")]
    ChannelDeleted { cid: ChannelId, channel: ChannelPayload },

    #[serde(rename = "channel.truncated")]
    ChannelTruncated { cid: ChannelId, channel: ChannelPayload },

    #[serde(rename = "channel.hidden")]
    ChannelHidden {
        cid: ChannelId,
        created_at: DateTime<Utc>,
        #[serde(default)]
        clear_history: bool,
    },

    #[serde(rename = "channel.visible")]
    ChannelVisible { cid: ChannelId },

    #[serde(rename = "notification.message_new")]
    NotificationMessageNew {
        cid: ChannelId,
        message: MessagePayload,
        channel: ChannelPayload,
    },

    #[serde(rename = "notification.added_to_channel")]
    NotificationAddedToChannel { cid: ChannelId, channel: ChannelPayload },
}

impl ServerEvent {
    /// Type tags this client understands.
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "health.check",
        "message.new",
        "message.updated",
        "message.deleted",
        "message.read",
        "reaction.new",
        "reaction.deleted",
        "channel.created",
        "channel.updated",
        "channel.deleted",
        "channel.truncated",
        "channel.hidden",
        "channel.visible",
        "notification.message_new",
        "notification.added_to_channel",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::HealthCheck { .. } => "health.check",
            ServerEvent::MessageNew { .. } => "message.new",
            ServerEvent::MessageUpdated { .. } => "message.updated",
            ServerEvent::MessageDeleted { .. } => "message.deleted",
            ServerEvent::MessageRead { .. } => "message.read",
            ServerEvent::ReactionNew { .. } => "reaction.new",
            ServerEvent::ReactionDeleted { .. } => "reaction.deleted",
            ServerEvent::ChannelCreated { .. } => "channel.created",
            ServerEvent::ChannelUpdated { .. } => "channel.updated",
            ServerEvent::ChannelDeleted { .. } => "channel.deleted",
            ServerEvent::ChannelTruncated { .. } => "channel.truncated",
            ServerEvent::ChannelHidden { .. } => "channel.hidden",
            ServerEvent::ChannelVisible { .. } => "channel.visible",
            ServerEvent::NotificationMessageNew { .. } => "notification.message_new",
            ServerEvent::NotificationAddedToChannel { .. } => "notification.added_to_channel",
        }
    }

    pub fn cid(&self) -> Option<&ChannelId> {
        match self {
            ServerEvent::HealthCheck { .. } => None,
            ServerEvent::MessageNew { cid, .. }
            | ServerEvent::MessageUpdated { cid, .. }
            | ServerEvent::MessageDeleted { cid, .. }
            | ServerEvent::MessageRead { cid, .. }
            | ServerEvent::ReactionNew { cid, .. }
            | ServerEvent::ReactionDeleted { cid, .. }
            | ServerEvent::ChannelCreated { cid, .. }
            | ServerEvent::ChannelUpdated { cid, .. }
            | ServerEvent::ChannelDeleted { cid, .. }
            | ServerEvent::ChannelTruncated { cid, .. }
            | ServerEvent::ChannelHidden { cid, .. }
            | ServerEvent::ChannelVisible { cid }
            | ServerEvent::NotificationMessageNew { cid, .. }
            | ServerEvent::NotificationAddedToChannel { cid, .. } => Some(cid),
        }
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

/// Decode one text frame into a [`ServerEvent`].
///
/// Unknown type tags yield [`ProtocolError::UnsupportedType`] so callers can
/// skip them without treating the frame as corrupt. A server error envelope
/// (`{"error": {...}}`) yields [`ProtocolError::Server`].
pub fn decode_event(text: &str) -> Result<ServerEvent, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;

    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        if value.get("error").is_some() {
            let envelope: ErrorEnvelope = serde_json::from_value(value)?;
            return Err(ProtocolError::Server(envelope.error));
        }
        return Err(ProtocolError::MissingType);
    };

    if !ServerEvent::KNOWN_TYPES.contains(&kind) {
        return Err(ProtocolError::UnsupportedType(kind.to_string()));
    }

    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_health_check() {
        let event = decode_event(r#"{"type":"health.check","connection_id":"c-1"}"#).unwrap();
        assert_eq!(
            event,
            ServerEvent::HealthCheck {
                connection_id: "c-1".into()
            }
        );
        assert_eq!(event.cid(), None);
    }

    #[test]
    fn test_decode_message_new() {
        let text = r#"{
            "type": "message.new",
            "cid": "messaging:general",
            "message": {
                "id": "m-1",
                "cid": "messaging:general",
                "user": "alice",
                "text": "hi",
                "created_at": "2024-01-01T10:00:00Z",
                "updated_at": "2024-01-01T10:00:00Z",
                "reaction_counts": {"like": 2}
            }
        }"#;
        let event = decode_event(text).unwrap();
        assert_eq!(event.kind(), "message.new");
        match event {
            ServerEvent::MessageNew { cid, message, channel } => {
                assert_eq!(cid.to_string(), "messaging:general");
                assert_eq!(message.id.as_str(), "m-1");
                assert_eq!(message.reaction_counts.get("like"), Some(&2));
                assert!(channel.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_type_is_unsupported() {
        let err = decode_event(r#"{"type":"typing.start","cid":"a:b"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedType(t) if t == "typing.start"));
    }

    #[test]
    fn test_decode_error_envelope() {
        let err = decode_event(r#"{"error":{"code":40,"message":"token expired","StatusCode":401}}"#)
            .unwrap_err();
        match err {
            ProtocolError::Server(api) => {
                assert_eq!(api.code, 40);
                assert_eq!(api.status, Some(401));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            decode_event("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_event(r#"{"cid":"a:b"}"#),
            Err(ProtocolError::MissingType)
        ));
    }
}
