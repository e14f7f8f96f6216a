//! Types shared by every tether crate: identifiers, the realtime wire
//! protocol, REST payloads and the error taxonomy for remote failures.

pub mod api;
pub mod constants;
pub mod error;
pub mod filter;
pub mod protocol;
pub mod types;

pub use error::{ApiError, ProtocolError};
pub use filter::{Filter, FilterTarget};
pub use types::{ChannelId, MessageId, UserId};
