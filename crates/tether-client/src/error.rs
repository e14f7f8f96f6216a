use tether_net::NetError;
use tether_shared::MessageId;
use tether_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Network error: {0}")]
    Net(#[from] NetError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Pagination(#[from] PaginationError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaginationError {
    /// A page load for the same channel or thread is still in flight.
    #[error("A page is already loading")]
    AlreadyLoading,
}

/// Outcome of a failed send. The pending message stays in the store.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("Invalid message: {0}")]
    Validation(String),

    #[error("Failed to persist message: {0}")]
    Store(#[from] StoreError),

    #[error("Sending message {id} failed: {source}")]
    Failed {
        id: MessageId,
        #[source]
        source: NetError,
    },

    #[error("Message {0} was not resolved before the sender stopped")]
    Interrupted(MessageId),
}

pub type Result<T> = std::result::Result<T, ClientError>;
