//! A live, paginated channel list for one query.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_net::ApiClient;
use tether_shared::api::{ChannelListQuery, QueryChannelsRequest};
use tether_shared::UserId;
use tether_store::{
    Channel, ChannelListRequest, ItemReuse, ListChange, ListDatabaseObserver, Store,
};

use crate::error::Result;
use crate::events::EventBus;
use crate::linker::{ChannelListLinker, QueryMatchers};

/// Channels linked to a query, kept current by a [`ChannelListLinker`] and
/// extended page by page from the server.
pub struct ChannelList {
    query: ChannelListQuery,
    store: Store,
    api: Arc<dyn ApiClient>,
    linker: Arc<ChannelListLinker>,
    observer: ListDatabaseObserver<Channel, ChannelListRequest>,
    has_loaded_all_channels: Mutex<bool>,
    gate: AsyncMutex<()>,
    linker_task: JoinHandle<()>,
}

impl ChannelList {
    pub fn new(
        query: ChannelListQuery,
        store: Store,
        api: Arc<dyn ApiClient>,
        bus: &EventBus,
        current_user: UserId,
        automatic_filtering: bool,
        matchers: QueryMatchers,
    ) -> Self {
        let linker = ChannelListLinker::new(
            query.clone(),
            store.clone(),
            Arc::clone(&api),
            current_user,
            automatic_filtering,
        )
        .with_matchers(matchers);
        let linker = Arc::new(linker);
        let linker_task = Arc::clone(&linker).spawn(bus.subscribe());

        let observer = ListDatabaseObserver::with_item_reuse(
            store.clone(),
            ChannelListRequest {
                query: query.clone(),
                apply_filter: automatic_filtering,
            },
            |channel| channel,
            ItemReuse::by_keys(|c: &Channel| c.cid.clone(), |c: &Channel| c.cid.clone()),
        );

        Self {
            query,
            store,
            api,
            linker,
            observer,
            has_loaded_all_channels: Mutex::new(false),
            gate: AsyncMutex::new(()),
            linker_task,
        }
    }

    pub fn query(&self) -> &ChannelListQuery {
        &self.query
    }

    pub fn linker(&self) -> &ChannelListLinker {
        &self.linker
    }

    pub fn has_loaded_all_channels(&self) -> bool {
        *self
            .has_loaded_all_channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn channels(&self) -> Result<Vec<Arc<Channel>>> {
        Ok(self.observer.items()?)
    }

    /// Start receiving change records. Returns the current channels.
    pub fn start_observing(
        &self,
    ) -> Result<(Vec<Arc<Channel>>, mpsc::UnboundedReceiver<Vec<ListChange<Arc<Channel>>>>)> {
        Ok(self.observer.start_observing_forwarded()?)
    }

    pub fn stop_observing(&self) {
        self.observer.stop_observing();
    }

    /// Fetch the page after the channels already linked and link it.
    /// Returns the number of channels received.
    pub async fn load_next_channels(&self) -> Result<usize> {
        let _gate = self.gate.lock().await;
        if self.has_loaded_all_channels() {
            debug!(query = %self.linker.query_key(), "All channels loaded");
            return Ok(0);
        }

        let offset = self.store.linked_count(self.linker.query_key())?;
        let request = QueryChannelsRequest::page(&self.query, offset);
        let response = match self.api.query_channels(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(offset, error = %e, "Failed to load channels");
                return Err(e.into());
            }
        };

        let received = response.channels.len();
        let key = self.linker.query_key().to_string();
        self.store
            .write_async(move |session| {
                for state in &response.channels {
                    session.save_channel(&state.channel)?;
                    for message in &state.messages {
                        session.save_message(message)?;
                    }
                    session.link_channel(&key, &state.channel.cid)?;
                }
                Ok(())
            })
            .await?;

        if received < self.query.page_size {
            *self
                .has_loaded_all_channels
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = true;
        }
        info!(offset, received, "Channels page loaded");
        Ok(received)
    }
}

impl Drop for ChannelList {
    fn drop(&mut self) {
        self.linker_task.abort();
    }
}
