//! # tether-client
//!
//! The sync and pagination core of the tether chat SDK.
//!
//! [`ChatClient`] owns a [`tether_store::Store`], the REST and realtime
//! transports, and the background tasks that keep the store current:
//!
//! - [`EventProcessor`] writes realtime events to the store in receipt order
//!   and republishes them on the [`EventBus`].
//! - [`ChannelListLinker`] keeps each live [`ChannelList`] in step with the bus.
//! - [`MessageSender`] persists pending messages and confirms them per channel.
//! - [`MessagesLoader`] pages message windows through a
//!   [`MessagesPaginationStateHandler`].

pub mod channel_list;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod linker;
pub mod loader;
pub mod pagination;
pub mod processor;
pub mod sender;

#[cfg(test)]
mod testing;

pub use channel_list::ChannelList;
pub use client::ChatClient;
pub use config::ChatClientConfig;
pub use error::{ClientError, PaginationError, Result, SendError};
pub use events::{DomainEvent, EventBus};
pub use linker::{ChannelListLinker, QueryMatcher, QueryMatchers};
pub use loader::{MessageSource, MessagesLoader};
pub use pagination::{
    FetchedMessage, MessagesPaginationState, MessagesPaginationStateHandler, PaginationDirection,
    PaginationGate,
};
pub use processor::EventProcessor;
pub use sender::{MessageSender, PendingMessage};
