//! Message window loading for a channel or a thread.
//!
//! Every load runs the same sequence under the entity's pagination gate:
//! `begin` on the tracker, fetch the page, save it, then `end` (or `fail`).

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use tether_net::ApiClient;
use tether_shared::api::{MessagesPagination, PaginationParameter};
use tether_shared::protocol::MessagePayload;
use tether_shared::{ChannelId, MessageId};
use tether_store::{
    ChannelMessagesRequest, ItemReuse, ListDatabaseObserver, Message, Store, ThreadRepliesRequest,
};

use crate::error::Result;
use crate::pagination::{FetchedMessage, MessagesPaginationState, MessagesPaginationStateHandler};

/// What a loader pages through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSource {
    Channel(ChannelId),
    Thread { parent_id: MessageId },
}

pub struct MessagesLoader {
    source: MessageSource,
    api: Arc<dyn ApiClient>,
    store: Store,
    page_size: usize,
    pagination: MessagesPaginationStateHandler,
}

impl MessagesLoader {
    pub fn for_channel(cid: ChannelId, api: Arc<dyn ApiClient>, store: Store, page_size: usize) -> Self {
        Self::new(MessageSource::Channel(cid), api, store, page_size)
    }

    pub fn for_thread(parent_id: MessageId, api: Arc<dyn ApiClient>, store: Store, page_size: usize) -> Self {
        Self::new(MessageSource::Thread { parent_id }, api, store, page_size)
    }

    fn new(source: MessageSource, api: Arc<dyn ApiClient>, store: Store, page_size: usize) -> Self {
        Self {
            source,
            api,
            store,
            page_size,
            pagination: MessagesPaginationStateHandler::new(),
        }
    }

    pub fn source(&self) -> &MessageSource {
        &self.source
    }

    pub fn pagination_state(&self) -> MessagesPaginationState {
        self.pagination.state()
    }

    pub fn subscribe_pagination(&self) -> watch::Receiver<MessagesPaginationState> {
        self.pagination.subscribe()
    }

    /// Observer over the stored messages of this source, oldest first.
    pub fn channel_observer(&self) -> Option<ListDatabaseObserver<Message, ChannelMessagesRequest>> {
        let MessageSource::Channel(cid) = &self.source else {
            return None;
        };
        Some(ListDatabaseObserver::with_item_reuse(
            self.store.clone(),
            ChannelMessagesRequest { cid: cid.clone() },
            |message| message,
            ItemReuse::by_keys(|m: &Message| m.id.clone(), |m: &Message| m.id.clone()),
        ))
    }

    pub fn thread_observer(&self) -> Option<ListDatabaseObserver<Message, ThreadRepliesRequest>> {
        let MessageSource::Thread { parent_id } = &self.source else {
            return None;
        };
        Some(ListDatabaseObserver::with_item_reuse(
            self.store.clone(),
            ThreadRepliesRequest {
                parent_id: parent_id.clone(),
            },
            |message| message,
            ItemReuse::by_keys(|m: &Message| m.id.clone(), |m: &Message| m.id.clone()),
        ))
    }

    /// Reload the newest page, resetting the window to the tail.
    pub async fn load_first_page(&self) -> Result<()> {
        let page_size = self.page_size;
        self.load_with(move |_| Some(MessagesPagination::first_page(page_size)))
            .await
    }

    /// Extend the window backwards from `before`, or from its oldest message.
    /// No-op once the start of history is loaded.
    pub async fn load_previous(&self, before: Option<MessageId>) -> Result<()> {
        let page_size = self.page_size;
        self.load_with(move |state| {
            if state.has_loaded_all_previous_messages {
                return None;
            }
            match before.or_else(|| state.oldest_fetched_message.as_ref().map(|m| m.id.clone())) {
                Some(id) => Some(MessagesPagination::new(
                    page_size,
                    Some(PaginationParameter::LessThan(id)),
                )),
                None => Some(MessagesPagination::first_page(page_size)),
            }
        })
        .await
    }

    /// Extend the window forwards from `after`, or from its newest message.
    /// No-op while the window already reaches the live tail.
    pub async fn load_next(&self, after: Option<MessageId>) -> Result<()> {
        let page_size = self.page_size;
        self.load_with(move |state| {
            if state.has_loaded_all_next_messages {
                return None;
            }
            let id = after.or_else(|| state.newest_fetched_message.as_ref().map(|m| m.id.clone()))?;
            Some(MessagesPagination::new(
                page_size,
                Some(PaginationParameter::GreaterThan(id)),
            ))
        })
        .await
    }

    /// Jump to a page centred on `id`.
    pub async fn load_around(&self, id: MessageId) -> Result<()> {
        let page_size = self.page_size;
        self.load_with(move |_| {
            Some(MessagesPagination::new(
                page_size,
                Some(PaginationParameter::Around(id)),
            ))
        })
        .await
    }

    async fn load_with<F>(&self, choose: F) -> Result<()>
    where
        F: FnOnce(&MessagesPaginationState) -> Option<MessagesPagination>,
    {
        let _gate = self.pagination.gate().enter().await;

        let Some(pagination) = choose(&self.pagination.state()) else {
            debug!(source = ?self.source, "Nothing to load");
            return Ok(());
        };

        self.pagination.begin(&pagination)?;
        match self.fetch_and_save(&pagination).await {
            Ok(page) => {
                self.pagination.end(&pagination, &page);
                Ok(())
            }
            Err(e) => {
                warn!(source = ?self.source, error = %e, "Failed to load messages");
                self.pagination.fail(&pagination);
                Err(e)
            }
        }
    }

    async fn fetch_and_save(&self, pagination: &MessagesPagination) -> Result<Vec<FetchedMessage>> {
        let response = match &self.source {
            MessageSource::Channel(cid) => self.api.query_messages(cid, pagination).await?,
            MessageSource::Thread { parent_id } => {
                self.api.query_replies(parent_id, pagination).await?
            }
        };

        let mut messages: Vec<MessagePayload> = response.messages;
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        debug!(source = ?self.source, count = messages.len(), "Page fetched");

        let page = messages
            .iter()
            .map(|m| FetchedMessage {
                id: m.id.clone(),
                created_at: m.created_at,
            })
            .collect();

        self.store
            .write_async(move |session| {
                for message in &messages {
                    session.save_message(message)?;
                }
                Ok(())
            })
            .await?;

        Ok(page)
    }
}
