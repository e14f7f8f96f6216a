//! Send/sync coordination for locally created messages.
//!
//! A send persists the pending message and returns before any network call.
//! Each channel has one queue so its messages are confirmed in creation
//! order; different channels send in parallel. A channel's queue lives only
//! while it has work.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use tether_net::ApiClient;
use tether_shared::api::SendMessageRequest;
use tether_shared::protocol::AttachmentPayload;
use tether_shared::{ChannelId, MessageId, UserId};
use tether_store::{LocalMessageState, Message, Store};

use crate::error::SendError;
use crate::events::{DomainEvent, EventBus};

type Confirmation = oneshot::Sender<Result<Message, SendError>>;

/// A message that has been persisted locally and queued for sending.
#[derive(Debug)]
pub struct PendingMessage {
    pub id: MessageId,
    confirmation: oneshot::Receiver<Result<Message, SendError>>,
}

impl PendingMessage {
    /// Wait for the server to confirm or reject the message. On success the
    /// returned message carries the server's fields, including an id the
    /// server may have reassigned.
    pub async fn confirmed(self) -> Result<Message, SendError> {
        match self.confirmation.await {
            Ok(result) => result,
            Err(_) => Err(SendError::Interrupted(self.id)),
        }
    }
}

struct SendJob {
    message: Message,
    reply: Option<Confirmation>,
}

#[derive(Clone)]
pub struct MessageSender {
    store: Store,
    api: Arc<dyn ApiClient>,
    bus: EventBus,
    current_user: UserId,
    queues: Queues,
}

type Queues = Arc<Mutex<HashMap<ChannelId, mpsc::UnboundedSender<SendJob>>>>;

impl MessageSender {
    pub fn new(store: Store, api: Arc<dyn ApiClient>, bus: EventBus, current_user: UserId) -> Self {
        Self {
            store,
            api,
            bus,
            current_user,
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create, persist and queue a message.
    pub async fn send_message(
        &self,
        cid: &ChannelId,
        text: impl Into<String>,
        parent_id: Option<MessageId>,
        attachments: Vec<AttachmentPayload>,
    ) -> Result<PendingMessage, SendError> {
        let text = text.into();
        if text.trim().is_empty() && attachments.is_empty() {
            return Err(SendError::Validation(
                "a message needs text or at least one attachment".into(),
            ));
        }

        let message = Message::pending(
            cid.clone(),
            self.current_user.clone(),
            text,
            parent_id,
            attachments,
        );
        let stored = message.clone();
        self.store
            .write_async(move |session| session.create_pending_message(&stored))
            .await?;
        debug!(cid = %cid, id = %message.id, "Pending message created");

        self.bus.publish(DomainEvent::PendingMessageCreated {
            cid: cid.clone(),
            message_id: message.id.clone(),
        });

        let (reply, confirmation) = oneshot::channel();
        let id = message.id.clone();
        self.enqueue(SendJob {
            message,
            reply: Some(reply),
        });
        Ok(PendingMessage { id, confirmation })
    }

    /// Re-queue messages of the current user that never reached the server,
    /// e.g. after a restart. Returns how many were queued.
    pub fn resume_pending(&self) -> Result<usize, SendError> {
        let pending = self.store.pending_messages(&self.current_user)?;
        let count = pending.len();
        for message in pending {
            self.enqueue(SendJob {
                message,
                reply: None,
            });
        }
        if count > 0 {
            info!(count, "Resuming pending messages");
        }
        Ok(count)
    }

    fn enqueue(&self, job: SendJob) {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let cid = job.message.cid.clone();

        let job = match queues.get(&cid) {
            Some(queue) => match queue.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // A fresh receiver is alive, so this cannot fail.
        let _ = tx.send(job);
        queues.insert(cid.clone(), tx);

        let worker = SendWorker {
            store: self.store.clone(),
            api: Arc::clone(&self.api),
            queues: Arc::clone(&self.queues),
        };
        tokio::spawn(worker.run(cid, rx));
    }
}

struct SendWorker {
    store: Store,
    api: Arc<dyn ApiClient>,
    queues: Queues,
}

impl SendWorker {
    async fn run(self, cid: ChannelId, mut jobs: mpsc::UnboundedReceiver<SendJob>) {
        while let Some(job) = self.next_job(&cid, &mut jobs) {
            let id = job.message.id.clone();
            let result = self.send(job.message).await;
            if let Err(e) = &result {
                warn!(cid = %cid, id = %id, error = %e, "Message send failed");
            }
            if let Some(reply) = job.reply {
                let _ = reply.send(result);
            }
        }
        debug!(cid = %cid, "Send queue drained");
    }

    /// Next queued job, or `None` after retiring the channel's queue. Checked
    /// under the map lock so nothing is enqueued to a retired queue.
    fn next_job(
        &self,
        cid: &ChannelId,
        jobs: &mut mpsc::UnboundedReceiver<SendJob>,
    ) -> Option<SendJob> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        match jobs.try_recv() {
            Ok(job) => Some(job),
            Err(_) => {
                queues.remove(cid);
                None
            }
        }
    }

    async fn send(&self, message: Message) -> Result<Message, SendError> {
        let local_id = message.id.clone();
        self.set_state(&local_id, LocalMessageState::Sending).await?;

        let request = SendMessageRequest {
            id: local_id.clone(),
            text: message.text,
            parent_id: message.parent_id,
            attachments: message.attachments,
        };

        match self.api.send_message(&message.cid, &request).await {
            Ok(response) => {
                let confirmed = response.message;
                let server_id = confirmed.id.clone();
                let id = local_id.clone();
                let stored = self
                    .store
                    .write_async(move |session| {
                        session.confirm_message(&id, &confirmed)?;
                        session.message(&confirmed.id)
                    })
                    .await?;
                debug!(local_id = %local_id, id = %server_id, "Message confirmed");
                stored.ok_or(SendError::Interrupted(local_id))
            }
            Err(source) => {
                self.set_state(&local_id, LocalMessageState::SendingFailed)
                    .await?;
                Err(SendError::Failed {
                    id: local_id,
                    source,
                })
            }
        }
    }

    async fn set_state(&self, id: &MessageId, state: LocalMessageState) -> Result<(), SendError> {
        let id = id.clone();
        self.store
            .write_async(move |session| session.set_local_state(&id, Some(state)))
            .await?;
        Ok(())
    }
}
