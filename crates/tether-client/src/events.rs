//! Domain events published after realtime events have been persisted.

use tokio::sync::broadcast;

use tether_shared::{ChannelId, MessageId, UserId};

const BUS_CAPACITY: usize = 1024;

/// A change that has already been written to the store.
///
/// Events carry identifiers only; subscribers read current state from the
/// store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    ChannelCreated { cid: ChannelId },
    ChannelUpdated { cid: ChannelId },
    ChannelDeleted { cid: ChannelId },
    ChannelTruncated { cid: ChannelId },
    ChannelHidden { cid: ChannelId },
    ChannelVisible { cid: ChannelId },
    /// The current user was added to a channel.
    AddedToChannel { cid: ChannelId },
    MessageNew {
        cid: ChannelId,
        message_id: MessageId,
        from_notification: bool,
    },
    MessageUpdated { cid: ChannelId, message_id: MessageId },
    MessageDeleted { cid: ChannelId, message_id: MessageId },
    MessageRead { cid: ChannelId, user: UserId },
    ReactionChanged { cid: ChannelId, message_id: MessageId },
    /// A local message was persisted and is about to be sent.
    PendingMessageCreated { cid: ChannelId, message_id: MessageId },
}

impl DomainEvent {
    pub fn cid(&self) -> &ChannelId {
        match self {
            DomainEvent::ChannelCreated { cid }
            | DomainEvent::ChannelUpdated { cid }
            | DomainEvent::ChannelDeleted { cid }
            | DomainEvent::ChannelTruncated { cid }
            | DomainEvent::ChannelHidden { cid }
            | DomainEvent::ChannelVisible { cid }
            | DomainEvent::AddedToChannel { cid }
            | DomainEvent::MessageNew { cid, .. }
            | DomainEvent::MessageUpdated { cid, .. }
            | DomainEvent::MessageDeleted { cid, .. }
            | DomainEvent::MessageRead { cid, .. }
            | DomainEvent::ReactionChanged { cid, .. }
            | DomainEvent::PendingMessageCreated { cid, .. } => cid,
        }
    }
}

/// Fan-out of [`DomainEvent`]s to any number of subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, event: DomainEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
