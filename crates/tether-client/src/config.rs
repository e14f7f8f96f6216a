//! Client configuration loaded from environment variables.
//!
//! Every option is listed explicitly with its default. Credentials have no
//! meaningful default and must be supplied by the application or the env.

use std::path::PathBuf;
use std::time::Duration;

use reqwest::Url;

use tether_net::{EngineConfig, ReconnectionStrategy};
use tether_shared::constants::{CHANNELS_PAGE_SIZE, CONNECT_PATH, MESSAGES_PAGE_SIZE};
use tether_shared::UserId;

use crate::error::{ClientError, Result};

#[derive(Debug, Clone)]
pub struct ChatClientConfig {
    /// Application key sent with every request.
    /// Env: `TETHER_API_KEY`
    pub api_key: String,

    /// Base URL of the REST API.
    /// Env: `TETHER_BASE_URL`
    /// Default: `http://localhost:3030`
    pub base_url: String,

    /// Base URL of the realtime endpoint.
    /// Env: `TETHER_WS_URL`
    /// Default: `ws://localhost:3030`
    pub ws_url: String,

    /// The current user.
    /// Env: `TETHER_USER_ID`
    pub user_id: UserId,

    /// Auth token for the current user.
    /// Env: `TETHER_TOKEN`
    pub token: String,

    /// SQLite database file. `None` uses the platform data directory.
    /// Env: `TETHER_DB_PATH`
    pub database_path: Option<PathBuf>,

    /// When enabled, the store's own filter decides which channels a list
    /// shows and the linker links every candidate.
    /// Env: `TETHER_AUTO_FILTERING` (true/false)
    /// Default: `true`
    pub is_channel_automatic_filtering_enabled: bool,

    /// Default: 25
    pub message_page_size: usize,

    /// Default: 20
    pub channel_page_size: usize,

    /// Env: `TETHER_PING_INTERVAL_SECS`, `TETHER_PONG_TIMEOUT_SECS`
    pub engine: EngineConfig,

    pub reconnect: ReconnectionStrategy,
}

impl Default for ChatClientConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "http://localhost:3030".to_string(),
            ws_url: "ws://localhost:3030".to_string(),
            user_id: UserId::from(""),
            token: String::new(),
            database_path: None,
            is_channel_automatic_filtering_enabled: true,
            message_page_size: MESSAGES_PAGE_SIZE,
            channel_page_size: CHANNELS_PAGE_SIZE,
            engine: EngineConfig::default(),
            reconnect: ReconnectionStrategy::default(),
        }
    }
}

impl ChatClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(key) = std::env::var("TETHER_API_KEY") {
            config.api_key = key;
        }

        if let Ok(url) = std::env::var("TETHER_BASE_URL") {
            config.base_url = url;
        }

        if let Ok(url) = std::env::var("TETHER_WS_URL") {
            config.ws_url = url;
        }

        if let Ok(user) = std::env::var("TETHER_USER_ID") {
            config.user_id = UserId(user);
        }

        if let Ok(token) = std::env::var("TETHER_TOKEN") {
            config.token = token;
        }

        if let Ok(path) = std::env::var("TETHER_DB_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        if let Ok(val) = std::env::var("TETHER_AUTO_FILTERING") {
            config.is_channel_automatic_filtering_enabled = val != "false" && val != "0";
        }

        if let Ok(val) = std::env::var("TETHER_PING_INTERVAL_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.engine.ping_interval = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid TETHER_PING_INTERVAL_SECS, using default"),
            }
        }

        if let Ok(val) = std::env::var("TETHER_PONG_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.engine.pong_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid TETHER_PONG_TIMEOUT_SECS, using default"),
            }
        }

        config
    }

    /// Realtime endpoint for the configured user.
    pub fn connect_url(&self) -> Result<Url> {
        let base = format!("{}/{}", self.ws_url.trim_end_matches('/'), CONNECT_PATH);
        Url::parse_with_params(
            &base,
            &[
                ("api_key", self.api_key.as_str()),
                ("user_id", self.user_id.as_str()),
                ("authorization", self.token.as_str()),
            ],
        )
        .map_err(|e| ClientError::Config(format!("invalid ws_url `{}`: {e}", self.ws_url)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ChatClientConfig::default();
        assert!(config.is_channel_automatic_filtering_enabled);
        assert_eq!(config.message_page_size, 25);
        assert_eq!(config.channel_page_size, 20);
        assert_eq!(config.engine.ping_interval, Duration::from_secs(25));
        assert_eq!(config.engine.pong_timeout, Duration::from_secs(3));
        assert!(config.database_path.is_none());
    }

    #[test]
    fn test_connect_url_encodes_credentials() {
        let config = ChatClientConfig {
            api_key: "key".into(),
            ws_url: "wss://chat.test/".into(),
            user_id: UserId::from("alice"),
            token: "a b&c".into(),
            ..Default::default()
        };
        let url = config.connect_url().unwrap();
        assert_eq!(url.path(), "/connect");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("user_id".into(), "alice".into())));
        assert!(pairs.contains(&("authorization".into(), "a b&c".into())));
    }

    #[test]
    fn test_connect_url_rejects_garbage() {
        let config = ChatClientConfig {
            ws_url: "not a url".into(),
            ..Default::default()
        };
        assert!(matches!(
            config.connect_url(),
            Err(ClientError::Config(_))
        ));
    }
}
