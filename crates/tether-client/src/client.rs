//! The chat client: owns the store, the transports and the background tasks,
//! and hands out loaders, channel lists and observers wired to them.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use tether_net::{
    default_engine_factory, spawn_websocket_client, ApiClient, ConnectionState,
    DisconnectionSource, HttpApiClient, WebSocketClient,
};
use tether_shared::api::ChannelListQuery;
use tether_shared::protocol::{AttachmentPayload, ServerEvent};
use tether_shared::{ChannelId, MessageId};
use tether_store::{
    Channel, ChannelRequest, EntityDatabaseObserver, Message, MessageRequest, Store,
};

use crate::channel_list::ChannelList;
use crate::config::ChatClientConfig;
use crate::error::{Result, SendError};
use crate::events::{DomainEvent, EventBus};
use crate::linker::{QueryMatcher, QueryMatchers};
use crate::loader::MessagesLoader;
use crate::processor::EventProcessor;
use crate::sender::{MessageSender, PendingMessage};

pub struct ChatClient {
    config: ChatClientConfig,
    store: Store,
    api: Arc<dyn ApiClient>,
    bus: EventBus,
    websocket: WebSocketClient,
    sender: MessageSender,
    tasks: Vec<JoinHandle<()>>,
}

impl ChatClient {
    /// Open the store and start the realtime client for `config`.
    /// Must be called from within a tokio runtime.
    pub fn new(config: ChatClientConfig) -> Result<Self> {
        let store = match &config.database_path {
            Some(path) => Store::open_at(path)?,
            None => Store::new()?,
        };
        let http = Arc::new(HttpApiClient::new(
            config.base_url.clone(),
            config.api_key.clone(),
            config.token.clone(),
        ));
        let endpoint = config.connect_url()?;
        let (websocket, events) = spawn_websocket_client(
            Some(endpoint.to_string()),
            config.reconnect.clone(),
            default_engine_factory(config.engine.clone()),
        );
        let connection_sync =
            spawn_connection_id_sync(websocket.subscribe_state(), Arc::clone(&http));

        let mut client = Self::with_components(config, store, http, websocket, events);
        client.tasks.push(connection_sync);
        Ok(client)
    }

    /// Assemble a client from already constructed parts.
    pub fn with_components(
        config: ChatClientConfig,
        store: Store,
        api: Arc<dyn ApiClient>,
        websocket: WebSocketClient,
        events: mpsc::UnboundedReceiver<ServerEvent>,
    ) -> Self {
        let bus = EventBus::new();
        let processor = EventProcessor::new(store.clone(), bus.clone()).spawn(events);
        let sender = MessageSender::new(
            store.clone(),
            Arc::clone(&api),
            bus.clone(),
            config.user_id.clone(),
        );
        info!(user = %config.user_id, "Chat client ready");

        Self {
            config,
            store,
            api,
            bus,
            websocket,
            sender,
            tasks: vec![processor],
        }
    }

    pub fn config(&self) -> &ChatClientConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Connection
    // -----------------------------------------------------------------------

    pub fn connect(&self) {
        self.websocket.connect();
    }

    pub fn disconnect(&self) {
        self.websocket.disconnect(DisconnectionSource::UserInitiated);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.websocket.connection_state()
    }

    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.websocket.subscribe_state()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DomainEvent> {
        self.bus.subscribe()
    }

    // -----------------------------------------------------------------------
    // Factories
    // -----------------------------------------------------------------------

    pub fn channel_loader(&self, cid: ChannelId) -> MessagesLoader {
        MessagesLoader::for_channel(
            cid,
            Arc::clone(&self.api),
            self.store.clone(),
            self.config.message_page_size,
        )
    }

    pub fn thread_loader(&self, parent_id: MessageId) -> MessagesLoader {
        MessagesLoader::for_thread(
            parent_id,
            Arc::clone(&self.api),
            self.store.clone(),
            self.config.message_page_size,
        )
    }

    /// A live list for `query`. Its linker follows the event bus until the
    /// list is dropped.
    pub fn channel_list(&self, query: ChannelListQuery) -> ChannelList {
        self.channel_list_with_matchers(query, QueryMatchers::default())
    }

    /// A live list whose membership is decided by `matcher` instead of the
    /// built-in rules.
    pub fn channel_list_with_matcher(
        &self,
        query: ChannelListQuery,
        matcher: QueryMatcher,
    ) -> ChannelList {
        self.channel_list_with_matchers(query, QueryMatchers::both(matcher))
    }

    pub fn channel_list_with_matchers(
        &self,
        mut query: ChannelListQuery,
        matchers: QueryMatchers,
    ) -> ChannelList {
        query.page_size = self.config.channel_page_size;
        ChannelList::new(
            query,
            self.store.clone(),
            Arc::clone(&self.api),
            &self.bus,
            self.config.user_id.clone(),
            self.config.is_channel_automatic_filtering_enabled,
            matchers,
        )
    }

    pub fn channel_observer(
        &self,
        cid: ChannelId,
    ) -> EntityDatabaseObserver<Channel, ChannelRequest> {
        EntityDatabaseObserver::new(self.store.clone(), ChannelRequest { cid }, |channel| channel)
    }

    pub fn message_observer(
        &self,
        id: MessageId,
    ) -> EntityDatabaseObserver<Message, MessageRequest> {
        EntityDatabaseObserver::new(self.store.clone(), MessageRequest { id }, |message| message)
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    pub async fn send_message(
        &self,
        cid: &ChannelId,
        text: impl Into<String>,
        parent_id: Option<MessageId>,
        attachments: Vec<AttachmentPayload>,
    ) -> std::result::Result<PendingMessage, SendError> {
        self.sender
            .send_message(cid, text, parent_id, attachments)
            .await
    }

    /// Queue messages left unsent by a previous session.
    pub fn resume_pending_messages(&self) -> std::result::Result<usize, SendError> {
        self.sender.resume_pending()
    }

    /// Start receiving realtime events for a channel and store its state.
    pub async fn watch_channel(&self, cid: &ChannelId) -> Result<()> {
        let state = self.api.watch_channel(cid).await?;
        self.store
            .write_async(move |session| {
                session.save_channel(&state.channel)?;
                for message in &state.messages {
                    session.save_message(message)?;
                }
                Ok(())
            })
            .await?;
        debug!(cid = %cid, "Watching channel");
        Ok(())
    }

    pub async fn stop_watching(&self, cid: &ChannelId) -> Result<()> {
        self.api.stop_watching(cid).await?;
        Ok(())
    }

    /// Wipe local state, e.g. on logout.
    pub async fn remove_all_data(&self) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.remove_all_data())
            .await
            .map_err(|e| tether_store::StoreError::Task(e.to_string()))??;
        info!("Local data removed");
        Ok(())
    }

    /// Close the connection and stop background tasks.
    pub fn shutdown(&self) {
        self.websocket.shutdown();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Keep the REST client's connection id in step with the realtime
/// connection, so watch requests bind to the live socket.
fn spawn_connection_id_sync(
    mut state: watch::Receiver<ConnectionState>,
    http: Arc<HttpApiClient>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let connection_id = state
                .borrow_and_update()
                .connection_id()
                .map(str::to_string);
            http.set_connection_id(connection_id);
            if state.changed().await.is_err() {
                break;
            }
        }
    })
}
