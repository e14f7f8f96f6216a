//! Applies realtime events to the store, in receipt order, and republishes
//! them as [`DomainEvent`]s once the write has committed.

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_shared::protocol::ServerEvent;
use tether_store::{Store, WriteSession};

use crate::error::Result;
use crate::events::{DomainEvent, EventBus};

#[derive(Clone)]
pub struct EventProcessor {
    store: Store,
    bus: EventBus,
}

impl EventProcessor {
    pub fn new(store: Store, bus: EventBus) -> Self {
        Self { store, bus }
    }

    /// Persist one event, then publish what it changed.
    pub async fn process(&self, event: ServerEvent) -> Result<()> {
        let kind = event.kind();
        let published = self
            .store
            .write_async(move |session| apply_event(session, &event))
            .await?;
        debug!(kind, published = published.len(), "Event applied");
        for domain_event in published {
            self.bus.publish(domain_event);
        }
        Ok(())
    }

    /// Consume `events` one at a time until the sender goes away.
    pub fn spawn(self, mut events: mpsc::UnboundedReceiver<ServerEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let kind = event.kind();
                if let Err(e) = self.process(event).await {
                    warn!(kind, error = %e, "Failed to apply event");
                }
            }
            info!("Event processor stopped");
        })
    }
}

fn apply_event(
    session: &mut WriteSession<'_>,
    event: &ServerEvent,
) -> tether_store::Result<Vec<DomainEvent>> {
    let mut out = Vec::new();
    match event {
        ServerEvent::HealthCheck { .. } => {}

        ServerEvent::MessageNew {
            cid,
            message,
            channel,
        } => {
            if let Some(channel) = channel {
                session.save_channel(channel)?;
            }
            session.save_message(message)?;
            if message.parent_id.is_none() {
                session.bump_last_message_at(cid, message.created_at)?;
            }
            out.push(DomainEvent::MessageNew {
                cid: cid.clone(),
                message_id: message.id.clone(),
                from_notification: false,
            });
        }

        ServerEvent::NotificationMessageNew {
            cid,
            message,
            channel,
        } => {
            session.save_channel(channel)?;
            session.save_message(message)?;
            if message.parent_id.is_none() {
                session.bump_last_message_at(cid, message.created_at)?;
            }
            out.push(DomainEvent::MessageNew {
                cid: cid.clone(),
                message_id: message.id.clone(),
                from_notification: true,
            });
        }

        ServerEvent::MessageUpdated { cid, message } => {
            session.save_message(message)?;
            out.push(DomainEvent::MessageUpdated {
                cid: cid.clone(),
                message_id: message.id.clone(),
            });
        }

        ServerEvent::MessageDeleted { cid, message } => {
            session.save_message(message)?;
            out.push(DomainEvent::MessageDeleted {
                cid: cid.clone(),
                message_id: message.id.clone(),
            });
        }

        ServerEvent::MessageRead {
            cid,
            user,
            created_at,
        } => {
            if session.mark_read(cid, user, *created_at)? {
                out.push(DomainEvent::MessageRead {
                    cid: cid.clone(),
                    user: user.clone(),
                });
            }
        }

        ServerEvent::ReactionNew { cid, message, .. }
        | ServerEvent::ReactionDeleted { cid, message, .. } => {
            session.save_message(message)?;
            out.push(DomainEvent::ReactionChanged {
                cid: cid.clone(),
                message_id: message.id.clone(),
            });
        }

        ServerEvent::ChannelCreated { cid, channel } => {
            session.save_channel(channel)?;
            out.push(DomainEvent::ChannelCreated { cid: cid.clone() });
        }

        ServerEvent::ChannelUpdated { cid, channel } => {
            session.save_channel(channel)?;
            out.push(DomainEvent::ChannelUpdated { cid: cid.clone() });
        }

        ServerEvent::ChannelDeleted { cid, channel } => {
            session.save_channel(channel)?;
            let at = channel.deleted_at.unwrap_or_else(Utc::now);
            session.mark_channel_deleted(cid, at)?;
            out.push(DomainEvent::ChannelDeleted { cid: cid.clone() });
        }

        ServerEvent::ChannelTruncated { cid, channel } => {
            session.save_channel(channel)?;
            let at = channel.truncated_at.unwrap_or_else(Utc::now);
            session.truncate_channel(cid, at)?;
            out.push(DomainEvent::ChannelTruncated { cid: cid.clone() });
        }

        ServerEvent::ChannelHidden {
            cid,
            created_at,
            clear_history,
        } => {
            if session.set_channel_hidden(cid, true)? {
                if *clear_history {
                    session.truncate_channel(cid, *created_at)?;
                }
                out.push(DomainEvent::ChannelHidden { cid: cid.clone() });
            }
        }

        ServerEvent::ChannelVisible { cid } => {
            if session.set_channel_hidden(cid, false)? {
                out.push(DomainEvent::ChannelVisible { cid: cid.clone() });
            }
        }

        ServerEvent::NotificationAddedToChannel { cid, channel } => {
            session.save_channel(channel)?;
            out.push(DomainEvent::AddedToChannel { cid: cid.clone() });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{channel_payload, message_payload, open_store, ts};
    use tether_shared::{ChannelId, MessageId};

    #[tokio::test]
    async fn test_events_are_persisted_then_published_in_order() {
        let (_dir, store) = open_store();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let processor = EventProcessor::new(store.clone(), bus);

        let cid = ChannelId::new("messaging", "general");
        let channel = channel_payload("messaging:general", &["alice"]);
        let (tx, events) = mpsc::unbounded_channel();
        let handle = processor.spawn(events);

        tx.send(ServerEvent::ChannelCreated {
            cid: cid.clone(),
            channel: channel.clone(),
        })
        .unwrap();
        for (id, at) in [("m-1", "2024-01-01T10:00:00Z"), ("m-2", "2024-01-01T10:01:00Z")] {
            tx.send(ServerEvent::MessageNew {
                cid: cid.clone(),
                message: message_payload(id, "messaging:general", at),
                channel: None,
            })
            .unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), DomainEvent::ChannelCreated { cid: cid.clone() });
        for id in ["m-1", "m-2"] {
            assert_eq!(
                rx.recv().await.unwrap(),
                DomainEvent::MessageNew {
                    cid: cid.clone(),
                    message_id: MessageId::from(id),
                    from_notification: false,
                }
            );
        }

        let ids: Vec<_> = store
            .channel_messages(&cid)
            .unwrap()
            .into_iter()
            .map(|m| m.id.0)
            .collect();
        assert_eq!(ids, vec!["m-1", "m-2"]);
        let stored = store.channel(&cid).unwrap().unwrap();
        assert_eq!(stored.last_message_at, Some(ts("2024-01-01T10:01:00Z")));
    }

    #[tokio::test]
    async fn test_hidden_with_clear_history_truncates() {
        let (_dir, store) = open_store();
        let processor = EventProcessor::new(store.clone(), EventBus::new());
        let cid = ChannelId::new("messaging", "general");

        processor
            .process(ServerEvent::ChannelCreated {
                cid: cid.clone(),
                channel: channel_payload("messaging:general", &["alice"]),
            })
            .await
            .unwrap();
        processor
            .process(ServerEvent::MessageNew {
                cid: cid.clone(),
                message: message_payload("m-1", "messaging:general", "2024-01-01T10:00:00Z"),
                channel: None,
            })
            .await
            .unwrap();
        processor
            .process(ServerEvent::ChannelHidden {
                cid: cid.clone(),
                created_at: ts("2024-01-02T00:00:00Z"),
                clear_history: true,
            })
            .await
            .unwrap();

        let channel = store.channel(&cid).unwrap().unwrap();
        assert!(channel.is_hidden);
        assert!(store.channel_messages(&cid).unwrap().is_empty());

        processor
            .process(ServerEvent::ChannelVisible { cid: cid.clone() })
            .await
            .unwrap();
        assert!(!store.channel(&cid).unwrap().unwrap().is_hidden);
    }

    #[tokio::test]
    async fn test_events_for_unknown_channels_publish_nothing() {
        let (_dir, store) = open_store();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let processor = EventProcessor::new(store, bus);

        processor
            .process(ServerEvent::ChannelVisible {
                cid: ChannelId::new("messaging", "ghost"),
            })
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }
}
