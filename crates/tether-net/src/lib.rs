// Realtime connection and REST transport for the tether sync core.

pub mod api;
pub mod client;
pub mod engine;
pub mod error;
pub mod reconnect;

pub use api::{ApiClient, HttpApiClient};
pub use client::{
    default_engine_factory, spawn_websocket_client, ConnectionState, DisconnectionSource,
    EngineFactory, WebSocketClient, WebSocketError,
};
pub use engine::{
    create_engine, AmbientRuntimeEngine, DedicatedRuntimeEngine, EngineConfig, EngineEvent,
    WebSocketEngine,
};
pub use error::{EngineError, NetError, Result};
pub use reconnect::{ReconnectionStrategy, RetryPolicy};
