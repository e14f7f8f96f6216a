//! Request and response bodies of the REST API.

use serde::{Deserialize, Serialize};

use crate::constants::{CHANNELS_PAGE_SIZE, MESSAGES_PAGE_SIZE};
use crate::filter::Filter;
use crate::protocol::{AttachmentPayload, ChannelPayload, MessagePayload};
use crate::types::MessageId;

// ---------------------------------------------------------------------------
// Message pagination
// ---------------------------------------------------------------------------

/// Cursor of a message page request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationParameter {
    LessThan(MessageId),
    LessThanOrEqual(MessageId),
    GreaterThan(MessageId),
    GreaterThanOrEqual(MessageId),
    Around(MessageId),
}

impl PaginationParameter {
    fn query_pair(&self) -> (&'static str, String) {
        match self {
            PaginationParameter::LessThan(id) => ("id_lt", id.to_string()),
            PaginationParameter::LessThanOrEqual(id) => ("id_lte", id.to_string()),
            PaginationParameter::GreaterThan(id) => ("id_gt", id.to_string()),
            PaginationParameter::GreaterThanOrEqual(id) => ("id_gte", id.to_string()),
            PaginationParameter::Around(id) => ("id_around", id.to_string()),
        }
    }
}

/// A page request for messages. `parameter == None` asks for the newest page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesPagination {
    pub page_size: usize,
    pub parameter: Option<PaginationParameter>,
}

impl MessagesPagination {
    pub fn new(page_size: usize, parameter: Option<PaginationParameter>) -> Self {
        Self {
            page_size,
            parameter,
        }
    }

    pub fn first_page(page_size: usize) -> Self {
        Self::new(page_size, None)
    }

    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("limit", self.page_size.to_string())];
        if let Some(parameter) = &self.parameter {
            pairs.push(parameter.query_pair());
        }
        pairs
    }
}

impl Default for MessagesPagination {
    fn default() -> Self {
        Self::first_page(MESSAGES_PAGE_SIZE)
    }
}

// ---------------------------------------------------------------------------
// Channel list queries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelSortField {
    LastMessageAt,
    UpdatedAt,
    CreatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSort {
    pub field: ChannelSortField,
    pub ascending: bool,
}

impl ChannelSort {
    pub fn descending(field: ChannelSortField) -> Self {
        Self {
            field,
            ascending: false,
        }
    }
}

/// A live channel list query: filter, sort and page size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelListQuery {
    pub filter: Filter,
    pub sort: Vec<ChannelSort>,
    pub page_size: usize,
}

impl ChannelListQuery {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            sort: vec![ChannelSort::descending(ChannelSortField::LastMessageAt)],
            page_size: CHANNELS_PAGE_SIZE,
        }
    }

    /// Stable key identifying this query's linked result set.
    pub fn key(&self) -> String {
        serde_json::json!({
            "filter": self.filter.to_query_json(),
            "sort": self.sort,
        })
        .to_string()
    }
}

/// Body of a channel query request.
#[derive(Debug, Clone, Serialize)]
pub struct QueryChannelsRequest {
    pub filter_conditions: serde_json::Value,
    pub sort: Vec<ChannelSort>,
    pub limit: usize,
    pub offset: usize,
    pub watch: bool,
}

impl QueryChannelsRequest {
    pub fn page(query: &ChannelListQuery, offset: usize) -> Self {
        Self {
            filter_conditions: query.filter.to_query_json(),
            sort: query.sort.clone(),
            limit: query.page_size,
            offset,
            watch: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub id: MessageId,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentPayload>,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStatePayload {
    pub channel: ChannelPayload,
    #[serde(default)]
    pub messages: Vec<MessagePayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelsResponse {
    pub channels: Vec<ChannelStatePayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub messages: Vec<MessagePayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: MessagePayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_query_pairs() {
        let first = MessagesPagination::first_page(25);
        assert_eq!(first.query_pairs(), vec![("limit", "25".to_string())]);

        let around = MessagesPagination::new(
            10,
            Some(PaginationParameter::Around(MessageId::from("m-7"))),
        );
        assert_eq!(
            around.query_pairs(),
            vec![("limit", "10".to_string()), ("id_around", "m-7".to_string())]
        );
    }

    #[test]
    fn test_query_key_depends_on_filter_and_sort() {
        let a = ChannelListQuery::new(Filter::All);
        let mut b = a.clone();
        assert_eq!(a.key(), b.key());

        b.page_size = 50;
        assert_eq!(a.key(), b.key());

        b.sort = vec![ChannelSort::descending(ChannelSortField::UpdatedAt)];
        assert_ne!(a.key(), b.key());

        let c = ChannelListQuery::new(Filter::equal("type", "team"));
        assert_ne!(a.key(), c.key());
    }
}
