/// Application name, used for the data directory.
pub const APP_NAME: &str = "tether";

/// Interval between liveness pings on the realtime connection, in seconds.
pub const PING_INTERVAL_SECS: u64 = 25;

/// How long a ping may stay unanswered before the connection is considered dead.
pub const PONG_TIMEOUT_SECS: u64 = 3;

/// Upper bound on the websocket handshake, in seconds.
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default number of messages requested per page.
pub const MESSAGES_PAGE_SIZE: usize = 25;

/// Default number of channels requested per page.
pub const CHANNELS_PAGE_SIZE: usize = 20;

/// Reconnect backoff bounds in milliseconds.
pub const RECONNECT_BASE_DELAY_MS: u64 = 500;
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Path of the realtime endpoint relative to the websocket base URL.
pub const CONNECT_PATH: &str = "connect";
