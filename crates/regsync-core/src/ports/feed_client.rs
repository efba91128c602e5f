//! FeedClient port - 上流レジストリへの HTTP アクセス
//!
//! - `get_json`: 有限のレスポンスを一括で取得（bulk JSON / modified-since）
//! - `get_stream`: レスポンスボディをチャンク単位で取得（streaming）

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::domain::FeedError;

/// A response body as it arrives. Errors end the stream.
pub type ByteStream = BoxStream<'static, Result<Bytes, FeedError>>;

#[async_trait]
pub trait FeedClient: Send + Sync {
    async fn get_json(&self, url: &str) -> Result<serde_json::Value, FeedError>;

    /// Non-2xx statuses fail here, before any body chunk is yielded.
    async fn get_stream(&self, url: &str) -> Result<ByteStream, FeedError>;
}
