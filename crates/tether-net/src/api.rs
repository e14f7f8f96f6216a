//! Request/response client for the REST API.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use tether_shared::api::{
    ChannelStatePayload, ChannelsResponse, MessageResponse, MessagesPagination, MessagesResponse,
    QueryChannelsRequest, SendMessageRequest,
};
use tether_shared::{ApiError, ChannelId, MessageId};

use crate::error::{NetError, Result};

/// Remote calls the sync core depends on.
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn query_channels(&self, request: &QueryChannelsRequest) -> Result<ChannelsResponse>;

    async fn query_messages(
        &self,
        cid: &ChannelId,
        pagination: &MessagesPagination,
    ) -> Result<MessagesResponse>;

    async fn query_replies(
        &self,
        parent_id: &MessageId,
        pagination: &MessagesPagination,
    ) -> Result<MessagesResponse>;

    async fn send_message(
        &self,
        cid: &ChannelId,
        request: &SendMessageRequest,
    ) -> Result<MessageResponse>;

    /// Subscribe the current connection to realtime events of a channel.
    async fn watch_channel(&self, cid: &ChannelId) -> Result<ChannelStatePayload>;

    async fn stop_watching(&self, cid: &ChannelId) -> Result<()>;
}

pub struct HttpApiClient {
    http: Client,
    base_url: String,
    api_key: String,
    token: String,
    connection_id: RwLock<Option<String>>,
}

impl HttpApiClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            token: token.into(),
            connection_id: RwLock::new(None),
        }
    }

    /// Attach the realtime connection id to subsequent requests.
    pub fn set_connection_id(&self, connection_id: Option<String>) {
        *self
            .connection_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = connection_id;
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    fn common_query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![("api_key", self.api_key.clone())];
        let connection_id = self
            .connection_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(id) = connection_id {
            query.push(("connection_id", id));
        }
        query
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        mut query: Vec<(&'static str, String)>,
    ) -> Result<T> {
        query.extend(self.common_query());
        debug!(path, "GET");
        let res = self
            .http
            .get(self.url(path))
            .header("Authorization", &self.token)
            .query(&query)
            .send()
            .await?;
        decode(res).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        debug!(path, "POST");
        let res = self
            .http
            .post(self.url(path))
            .header("Authorization", &self.token)
            .query(&self.common_query())
            .json(body)
            .send()
            .await?;
        decode(res).await
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn query_channels(&self, request: &QueryChannelsRequest) -> Result<ChannelsResponse> {
        self.post("channels", request).await
    }

    async fn query_messages(
        &self,
        cid: &ChannelId,
        pagination: &MessagesPagination,
    ) -> Result<MessagesResponse> {
        self.get(&channel_path(cid, "messages"), pagination.query_pairs())
            .await
    }

    async fn query_replies(
        &self,
        parent_id: &MessageId,
        pagination: &MessagesPagination,
    ) -> Result<MessagesResponse> {
        self.get(
            &format!("messages/{}/replies", parent_id),
            pagination.query_pairs(),
        )
        .await
    }

    async fn send_message(
        &self,
        cid: &ChannelId,
        request: &SendMessageRequest,
    ) -> Result<MessageResponse> {
        self.post(&channel_path(cid, "message"), &json!({ "message": request }))
            .await
    }

    async fn watch_channel(&self, cid: &ChannelId) -> Result<ChannelStatePayload> {
        self.post(
            &channel_path(cid, "query"),
            &json!({ "watch": true, "state": true }),
        )
        .await
    }

    async fn stop_watching(&self, cid: &ChannelId) -> Result<()> {
        let _: serde_json::Value = self
            .post(&channel_path(cid, "stop-watching"), &json!({}))
            .await?;
        Ok(())
    }
}

fn channel_path(cid: &ChannelId, action: &str) -> String {
    format!("channels/{}/{}/{}", cid.kind, cid.id, action)
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

async fn decode<T: DeserializeOwned>(res: reqwest::Response) -> Result<T> {
    let status = res.status();
    if status.is_success() {
        let bytes = res.bytes().await?;
        return Ok(serde_json::from_slice(&bytes)?);
    }
    let body = res.text().await.unwrap_or_default();
    Err(NetError::Api(parse_error(status.as_u16(), &body)))
}

/// Turn an error response into an [`ApiError`], keeping the HTTP status.
fn parse_error(status: u16, body: &str) -> ApiError {
    match serde_json::from_str::<ApiError>(body) {
        Ok(mut error) => {
            error.status.get_or_insert(status);
            error
        }
        Err(_) => {
            let message = if body.trim().is_empty() {
                format!("HTTP {status}")
            } else {
                body.trim().to_string()
            };
            ApiError {
                code: -1,
                message,
                status: Some(status),
            }
        }
    }
}
