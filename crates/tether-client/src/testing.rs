//! Fixtures shared by the unit tests of this crate.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::Semaphore;

use tether_net::{ApiClient, NetError};
use tether_shared::api::{
    ChannelStatePayload, ChannelsResponse, MessageResponse, MessagesPagination, MessagesResponse,
    PaginationParameter, QueryChannelsRequest, SendMessageRequest,
};
use tether_shared::protocol::{ChannelPayload, MessagePayload};
use tether_shared::{ApiError, ChannelId, MessageId, UserId};
use tether_store::Store;

pub(crate) fn open_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_at(&dir.path().join("test.db")).unwrap();
    (dir, store)
}

pub(crate) fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

pub(crate) fn channel_payload(cid: &str, members: &[&str]) -> ChannelPayload {
    ChannelPayload {
        cid: cid.parse().unwrap(),
        name: Some(cid.to_string()),
        created_at: ts("2024-01-01T00:00:00Z"),
        updated_at: ts("2024-01-01T00:00:00Z"),
        last_message_at: None,
        deleted_at: None,
        truncated_at: None,
        hidden: false,
        members: members.iter().map(|m| UserId::from(*m)).collect(),
        read: Vec::new(),
    }
}

pub(crate) fn message_payload(id: &str, cid: &str, created_at: &str) -> MessagePayload {
    MessagePayload {
        id: MessageId::from(id),
        cid: cid.parse().unwrap(),
        user: UserId::from("bob"),
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

/// `count` messages `m-0 ..` one minute apart, oldest first.
pub(crate) fn history(cid: &str, count: usize) -> Vec<MessagePayload> {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    (0..count)
        .map(|i| {
            let at = (start + Duration::minutes(i as i64)).to_rfc3339();
            message_payload(&format!("m-{i}"), cid, &at)
        })
        .collect()
}

/// In-memory stand-in for the REST API.
pub(crate) struct MockApi {
    pub history: Mutex<Vec<MessagePayload>>,
    pub replies: Mutex<Vec<MessagePayload>>,
    pub channels: Mutex<Vec<ChannelStatePayload>>,
    pub fail_queries: AtomicBool,
    pub fail_watch: AtomicBool,
    pub fail_sends: AtomicBool,
    /// Server assigns its own ids instead of keeping the client's.
    pub remap_ids: AtomicBool,
    /// Each send consumes a permit; tests hold confirmations by withholding them.
    pub send_permits: Arc<Semaphore>,
    pub query_calls: AtomicUsize,
    pub sent: Mutex<Vec<(ChannelId, String)>>,
    pub watched: Mutex<Vec<ChannelId>>,
    pub channel_queries: Mutex<Vec<(usize, usize)>>,
}

impl MockApi {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(Vec::new()),
            replies: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            fail_queries: AtomicBool::new(false),
            fail_watch: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            remap_ids: AtomicBool::new(false),
            send_permits: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
            query_calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            watched: Mutex::new(Vec::new()),
            channel_queries: Mutex::new(Vec::new()),
        }
    }

    pub fn with_history(messages: Vec<MessagePayload>) -> Self {
        let api = Self::new();
        *api.history.lock().unwrap() = messages;
        api
    }

    fn failure(message: &str) -> NetError {
        let mut error = ApiError::new(-1, message);
        error.status = Some(500);
        NetError::Api(error)
    }
}

/// Cut one page out of an ascending message list.
fn page_of(all: &[MessagePayload], pagination: &MessagesPagination) -> Vec<MessagePayload> {
    let size = pagination.page_size;
    let index_of = |id: &MessageId| all.iter().position(|m| &m.id == id);
    let (start, end) = match &pagination.parameter {
        None => (all.len().saturating_sub(size), all.len()),
        Some(PaginationParameter::LessThan(id)) | Some(PaginationParameter::LessThanOrEqual(id)) => {
            let Some(idx) = index_of(id) else {
                return Vec::new();
            };
            let end = if matches!(pagination.parameter, Some(PaginationParameter::LessThan(_))) {
                idx
            } else {
                idx + 1
            };
            (end.saturating_sub(size), end)
        }
        Some(PaginationParameter::GreaterThan(id))
        | Some(PaginationParameter::GreaterThanOrEqual(id)) => {
            let Some(idx) = index_of(id) else {
                return Vec::new();
            };
            let start = if matches!(pagination.parameter, Some(PaginationParameter::GreaterThan(_))) {
                idx + 1
            } else {
                idx
            };
            (start, (start + size).min(all.len()))
        }
        Some(PaginationParameter::Around(id)) => {
            let Some(idx) = index_of(id) else {
                return Vec::new();
            };
            let start = idx.saturating_sub(size / 2);
            let end = (start + size).min(all.len());
            (end.saturating_sub(size), end)
        }
    };
    all[start.min(end)..end].to_vec()
}

#[async_trait]
impl ApiClient for MockApi {
    async fn query_channels(
        &self,
        request: &QueryChannelsRequest,
    ) -> tether_net::Result<ChannelsResponse> {
        self.channel_queries
            .lock()
            .unwrap()
            .push((request.offset, request.limit));
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(Self::failure("query failed"));
        }
        let all = self.channels.lock().unwrap();
        let channels = all
            .iter()
            .skip(request.offset)
            .take(request.limit)
            .cloned()
            .collect();
        Ok(ChannelsResponse { channels })
    }

    async fn query_messages(
        &self,
        _cid: &ChannelId,
        pagination: &MessagesPagination,
    ) -> tether_net::Result<MessagesResponse> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(Self::failure("query failed"));
        }
        let messages = page_of(&self.history.lock().unwrap(), pagination);
        Ok(MessagesResponse { messages })
    }

    async fn query_replies(
        &self,
        _parent_id: &MessageId,
        pagination: &MessagesPagination,
    ) -> tether_net::Result<MessagesResponse> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(Self::failure("query failed"));
        }
        let messages = page_of(&self.replies.lock().unwrap(), pagination);
        Ok(MessagesResponse { messages })
    }

    async fn send_message(
        &self,
        cid: &ChannelId,
        request: &SendMessageRequest,
    ) -> tether_net::Result<MessageResponse> {
        let permit = self
            .send_permits
            .acquire()
            .await
            .map_err(|_| Self::failure("closed"))?;
        permit.forget();

        self.sent
            .lock()
            .unwrap()
            .push((cid.clone(), request.text.clone()));
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Self::failure("send rejected"));
        }

        let id = if self.remap_ids.load(Ordering::SeqCst) {
            MessageId(format!("srv-{}", request.id))
        } else {
            request.id.clone()
        };
        let now = Utc::now();
        Ok(MessageResponse {
            message: MessagePayload {
                id,
                cid: cid.clone(),
                user: UserId::from("alice"),
                text: request.text.clone(),
                created_at: now,
                updated_at: now,
                deleted_at: None,
                parent_id: request.parent_id.clone(),
                reaction_counts: BTreeMap::new(),
                reaction_scores: BTreeMap::new(),
                attachments: request.attachments.clone(),
            },
        })
    }

    async fn watch_channel(&self, cid: &ChannelId) -> tether_net::Result<ChannelStatePayload> {
        self.watched.lock().unwrap().push(cid.clone());
        if self.fail_watch.load(Ordering::SeqCst) {
            return Err(Self::failure("watch failed"));
        }
        Ok(ChannelStatePayload {
            channel: channel_payload(&cid.to_string(), &["alice"]),
            messages: Vec::new(),
        })
    }

    async fn stop_watching(&self, _cid: &ChannelId) -> tether_net::Result<()> {
        Ok(())
    }
}

#[test]
fn test_mock_pages() {
    let all = history("messaging:general", 10);
    let ids = |page: Vec<MessagePayload>| page.into_iter().map(|m| m.id.0).collect::<Vec<_>>();

    assert_eq!(
        ids(page_of(&all, &MessagesPagination::first_page(3))),
        vec!["m-7", "m-8", "m-9"]
    );
    assert_eq!(
        ids(page_of(
            &all,
            &MessagesPagination::new(3, Some(PaginationParameter::LessThan("m-2".into())))
        )),
        vec!["m-0", "m-1"]
    );
    assert_eq!(
        ids(page_of(
            &all,
            &MessagesPagination::new(3, Some(PaginationParameter::Around("m-5".into())))
        )),
        vec!["m-4", "m-5", "m-6"]
    );
}
