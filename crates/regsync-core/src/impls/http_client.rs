//! ReqwestFeedClient - 上流レジストリへの HTTP クライアント
//!
//! レジストリごとに 1 つ作成し、トークンがあれば Bearer 認証を付ける。

use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION};

use crate::domain::FeedError;
use crate::ports::{ByteStream, FeedClient};

const USER_AGENT: &str = concat!("regsync/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct ReqwestFeedClient {
    client: reqwest::Client,
    token: Option<String>,
}

impl ReqwestFeedClient {
    pub fn new(token: Option<String>) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, token })
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response, FeedError> {
        let mut request = self.client.get(url).header(ACCEPT, "application/json");
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(FeedError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl FeedClient for ReqwestFeedClient {
    async fn get_json(&self, url: &str) -> Result<serde_json::Value, FeedError> {
        Ok(self.send(url).await?.json().await?)
    }

    async fn get_stream(&self, url: &str) -> Result<ByteStream, FeedError> {
        let response = self.send(url).await?;
        Ok(response.bytes_stream().map_err(FeedError::from).boxed())
    }
}
