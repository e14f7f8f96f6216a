//! Query linking: keeps a live channel list's result set in step with
//! domain events.
//!
//! New channels and channels with fresh activity are linked to the query and
//! watched. A plain update can only unlink: linking on update would insert
//! into the middle of a list that has already been paginated.

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_net::ApiClient;
use tether_shared::api::ChannelListQuery;
use tether_shared::{ChannelId, UserId};
use tether_store::{Channel, Store};

use crate::error::Result;
use crate::events::DomainEvent;

/// Caller-supplied membership test for a query.
pub type QueryMatcher = Arc<dyn Fn(&Channel) -> bool + Send + Sync>;

/// Membership tests for a query. `new_channel` decides whether a channel is
/// linked; `updated_channel` decides whether a linked channel stays and
/// falls back to `new_channel` when unset.
#[derive(Clone, Default)]
pub struct QueryMatchers {
    pub new_channel: Option<QueryMatcher>,
    pub updated_channel: Option<QueryMatcher>,
}

impl QueryMatchers {
    /// The same test for new and updated channels.
    pub fn both(matcher: QueryMatcher) -> Self {
        Self {
            new_channel: Some(Arc::clone(&matcher)),
            updated_channel: Some(matcher),
        }
    }
}

/// What an event asks the linker to do with its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkAction {
    Link,
    Unlink,
    /// Re-read the channel and either link or unlink it.
    Reevaluate,
}

impl LinkAction {
    fn of(event: &DomainEvent) -> Option<Self> {
        match event {
            DomainEvent::ChannelCreated { .. }
            | DomainEvent::AddedToChannel { .. }
            | DomainEvent::MessageNew { .. }
            | DomainEvent::PendingMessageCreated { .. } => Some(LinkAction::Link),
            DomainEvent::ChannelUpdated { .. } => Some(LinkAction::Unlink),
            DomainEvent::ChannelVisible { .. } => Some(LinkAction::Reevaluate),
            _ => None,
        }
    }
}

pub struct ChannelListLinker {
    query: ChannelListQuery,
    query_key: String,
    store: Store,
    api: Arc<dyn ApiClient>,
    current_user: UserId,
    automatic_filtering: bool,
    matchers: QueryMatchers,
    /// Serializes link/unlink for this query.
    lock: AsyncMutex<()>,
}

impl ChannelListLinker {
    pub fn new(
        query: ChannelListQuery,
        store: Store,
        api: Arc<dyn ApiClient>,
        current_user: UserId,
        automatic_filtering: bool,
    ) -> Self {
        let query_key = query.key();
        Self {
            query,
            query_key,
            store,
            api,
            current_user,
            automatic_filtering,
            matchers: QueryMatchers::default(),
            lock: AsyncMutex::new(()),
        }
    }

    pub fn with_matcher(self, matcher: QueryMatcher) -> Self {
        self.with_matchers(QueryMatchers::both(matcher))
    }

    pub fn with_matchers(mut self, matchers: QueryMatchers) -> Self {
        self.matchers = matchers;
        self
    }

    pub fn query(&self) -> &ChannelListQuery {
        &self.query
    }

    pub fn query_key(&self) -> &str {
        &self.query_key
    }

    /// Whether a channel not yet in the list belongs to it.
    pub fn is_query_matching(&self, channel: &Channel) -> bool {
        match &self.matchers.new_channel {
            Some(matcher) => matcher(channel),
            None => self.default_match(channel),
        }
    }

    /// Whether a channel already in the list still belongs to it.
    pub fn is_still_matching(&self, channel: &Channel) -> bool {
        match &self.matchers.updated_channel {
            Some(matcher) => matcher(channel),
            None => self.is_query_matching(channel),
        }
    }

    fn default_match(&self, channel: &Channel) -> bool {
        self.automatic_filtering || channel.is_member(&self.current_user)
    }

    pub async fn handle_event(&self, event: &DomainEvent) -> Result<()> {
        let Some(action) = LinkAction::of(event) else {
            return Ok(());
        };
        let cid = event.cid();
        let _guard = self.lock.lock().await;

        let Some(channel) = self.store.channel(cid)? else {
            debug!(cid = %cid, "Channel not stored, nothing to link");
            return Ok(());
        };
        let linked = self.store.is_linked(&self.query_key, cid)?;

        match action {
            LinkAction::Link | LinkAction::Reevaluate if !linked => {
                if self.is_query_matching(&channel) {
                    self.link(cid).await?;
                }
                Ok(())
            }
            LinkAction::Unlink | LinkAction::Reevaluate if linked => {
                if !self.is_still_matching(&channel) {
                    self.unlink(cid).await?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn link(&self, cid: &ChannelId) -> Result<()> {
        let (key, target) = (self.query_key.clone(), cid.clone());
        let linked = self
            .store
            .write_async(move |session| session.link_channel(&key, &target))
            .await?;
        if !linked {
            return Ok(());
        }
        info!(cid = %cid, "Linked channel to query");

        if let Err(e) = self.api.watch_channel(cid).await {
            warn!(cid = %cid, error = %e, "Failed to watch linked channel");
        }
        Ok(())
    }

    async fn unlink(&self, cid: &ChannelId) -> Result<()> {
        let (key, target) = (self.query_key.clone(), cid.clone());
        let unlinked = self
            .store
            .write_async(move |session| session.unlink_channel(&key, &target))
            .await?;
        if unlinked {
            info!(cid = %cid, "Unlinked channel from query");
        }
        Ok(())
    }

    /// Handle bus events until the bus closes. Failures are logged.
    pub fn spawn(self: Arc<Self>, mut events: broadcast::Receiver<DomainEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Err(e) = self.handle_event(&event).await {
                            warn!(cid = %event.cid(), error = %e, "Query linking failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Linker lagged behind the event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(query = %self.query_key, "Linker stopped");
        })
    }
}
