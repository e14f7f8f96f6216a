//! Pagination state of a channel or thread message window.
//!
//! The window is the contiguous range of messages fetched so far. The
//! handler tracks its bounds, whether it reaches either end of history, and
//! which load is in flight. `begin`/`end` mutate under one lock; readers get
//! immutable snapshots through a `watch` channel and never take it.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tracing::debug;

use tether_shared::api::{MessagesPagination, PaginationParameter};
use tether_shared::MessageId;
use tether_store::Message;

use crate::error::PaginationError;

/// Identity and ordering timestamp of a message at a window edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    pub id: MessageId,
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for FetchedMessage {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagesPaginationState {
    pub oldest_fetched_message: Option<FetchedMessage>,
    pub newest_fetched_message: Option<FetchedMessage>,
    /// The window reaches the live tail.
    pub has_loaded_all_next_messages: bool,
    /// The window reaches the start of history.
    pub has_loaded_all_previous_messages: bool,
    pub is_loading_previous_messages: bool,
    pub is_loading_next_messages: bool,
    pub is_loading_middle_messages: bool,
}

impl MessagesPaginationState {
    /// Nothing loaded, anchored at the tail.
    pub fn initial() -> Self {
        Self {
            oldest_fetched_message: None,
            newest_fetched_message: None,
            has_loaded_all_next_messages: true,
            has_loaded_all_previous_messages: false,
            is_loading_previous_messages: false,
            is_loading_next_messages: false,
            is_loading_middle_messages: false,
        }
    }

    /// The window is detached from the live tail.
    pub fn is_jumping_to_message(&self) -> bool {
        !self.has_loaded_all_next_messages
    }

    pub fn is_loading_messages(&self) -> bool {
        self.is_loading_previous_messages
            || self.is_loading_next_messages
            || self.is_loading_middle_messages
    }

    fn clear_loading(&mut self) {
        self.is_loading_previous_messages = false;
        self.is_loading_next_messages = false;
        self.is_loading_middle_messages = false;
    }
}

impl Default for MessagesPaginationState {
    fn default() -> Self {
        Self::initial()
    }
}

/// Direction of a page request, derived from its cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaginationDirection {
    Previous,
    Next,
    Middle(MessageId),
    /// No cursor: reload the newest page from scratch.
    Reset,
}

impl PaginationDirection {
    pub fn of(pagination: &MessagesPagination) -> Self {
        match &pagination.parameter {
            Some(PaginationParameter::LessThan(_))
            | Some(PaginationParameter::LessThanOrEqual(_)) => PaginationDirection::Previous,
            Some(PaginationParameter::GreaterThan(_))
            | Some(PaginationParameter::GreaterThanOrEqual(_)) => PaginationDirection::Next,
            Some(PaginationParameter::Around(id)) => PaginationDirection::Middle(id.clone()),
            None => PaginationDirection::Reset,
        }
    }
}

/// Serializes whole load operations (begin, fetch, save, end) of one entity.
/// Waiters queue in FIFO order.
#[derive(Default)]
pub struct PaginationGate {
    lock: AsyncMutex<()>,
}

impl PaginationGate {
    pub async fn enter(&self) -> AsyncMutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

pub struct MessagesPaginationStateHandler {
    state: Mutex<MessagesPaginationState>,
    snapshot: watch::Sender<MessagesPaginationState>,
    gate: PaginationGate,
}

impl MessagesPaginationStateHandler {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(MessagesPaginationState::initial());
        Self {
            state: Mutex::new(MessagesPaginationState::initial()),
            snapshot,
            gate: PaginationGate::default(),
        }
    }

    pub fn state(&self) -> MessagesPaginationState {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MessagesPaginationState> {
        self.snapshot.subscribe()
    }

    pub fn gate(&self) -> &PaginationGate {
        &self.gate
    }

    fn lock(&self) -> MutexGuard<'_, MessagesPaginationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &MessagesPaginationState) {
        self.snapshot.send_replace(state.clone());
    }

    /// Mark a page load as started.
    ///
    /// Rejected while another load of this entity is in flight. A reset
    /// returns the state to `initial()` and counts as a previous-direction
    /// load until it ends.
    pub fn begin(&self, pagination: &MessagesPagination) -> Result<(), PaginationError> {
        let mut state = self.lock();
        if state.is_loading_messages() {
            return Err(PaginationError::AlreadyLoading);
        }

        match PaginationDirection::of(pagination) {
            PaginationDirection::Previous => state.is_loading_previous_messages = true,
            PaginationDirection::Next => state.is_loading_next_messages = true,
            PaginationDirection::Middle(_) => {
                state.has_loaded_all_next_messages = false;
                state.is_loading_middle_messages = true;
            }
            PaginationDirection::Reset => {
                *state = MessagesPaginationState::initial();
                state.is_loading_previous_messages = true;
            }
        }

        debug!(state = ?*state, "Pagination began");
        self.publish(&state);
        Ok(())
    }

    /// Record a successful page. `messages` must be ordered oldest first.
    pub fn end(&self, pagination: &MessagesPagination, messages: &[FetchedMessage]) {
        let mut state = self.lock();
        state.clear_loading();

        if let (Some(first), Some(last)) = (messages.first(), messages.last()) {
            let is_short = messages.len() < pagination.page_size;
            match PaginationDirection::of(pagination) {
                PaginationDirection::Previous => {
                    state.oldest_fetched_message = Some(first.clone());
                    if is_short {
                        state.has_loaded_all_previous_messages = true;
                    }
                }
                PaginationDirection::Next => {
                    state.newest_fetched_message = Some(last.clone());
                    if is_short {
                        state.has_loaded_all_next_messages = true;
                    }
                }
                PaginationDirection::Middle(anchor) => {
                    state.oldest_fetched_message = Some(first.clone());
                    state.newest_fetched_message = Some(last.clone());
                    apply_midpoint(&mut state, messages, &anchor);
                    if is_short {
                        state.has_loaded_all_previous_messages = true;
                        state.has_loaded_all_next_messages = true;
                    }
                }
                PaginationDirection::Reset => {
                    state.oldest_fetched_message = Some(first.clone());
                    state.newest_fetched_message = Some(last.clone());
                    state.has_loaded_all_next_messages = true;
                    if is_short {
                        state.has_loaded_all_previous_messages = true;
                    }
                }
            }
        }

        debug!(state = ?*state, "Pagination ended");
        self.publish(&state);
    }

    /// Record a failed load. Bounds stay untouched so the caller can retry.
    pub fn fail(&self, _pagination: &MessagesPagination) {
        let mut state = self.lock();
        state.clear_loading();
        self.publish(&state);
    }
}

impl Default for MessagesPaginationStateHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Index of the page element the anchor lands on when the server has
/// messages on both sides of it: `round(count / 2) - 1`.
pub fn midpoint_index(count: usize) -> usize {
    ((count + 1) / 2).saturating_sub(1)
}

fn apply_midpoint(state: &mut MessagesPaginationState, page: &[FetchedMessage], anchor: &MessageId) {
    let mid = midpoint_index(page.len());
    match page.iter().position(|m| &m.id == anchor) {
        Some(index) if index == mid => {
            state.has_loaded_all_previous_messages = false;
            state.has_loaded_all_next_messages = false;
        }
        Some(index) if index > mid => state.has_loaded_all_next_messages = true,
        Some(_) => state.has_loaded_all_previous_messages = true,
        None => {
            debug!(anchor = %anchor, "Anchor not in page");
            state.has_loaded_all_previous_messages = false;
            state.has_loaded_all_next_messages = false;
        }
    }
}
