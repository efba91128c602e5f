//! CouchDB-style `_changes` feed read as it streams in.
//!
//! `GET {endpoint}/_changes?since={seq}` answers
//! `{"results":[{"seq":1,"id":"name","deleted":true?}, ...],"last_seq":N}`.
//! Design documents (`_design/...`) are skipped.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;

use super::{ChangeBatch, RegistryConfig, RegistrySource, parse_seq, parse_update_seq};
use crate::domain::{ChangeRecord, Cursor, FeedError};
use crate::feed::{ChangeFeedStream, FeedFraming, RecordDecoder};
use crate::ports::FeedClient;

pub struct StreamingChangesSource {
    config: RegistryConfig,
    client: Arc<dyn FeedClient>,
}

impl StreamingChangesSource {
    pub fn new(config: RegistryConfig, client: Arc<dyn FeedClient>) -> Self {
        Self { config, client }
    }

    fn decoder() -> RecordDecoder {
        Box::new(|raw: serde_json::Value| {
            let Some(cursor) = parse_seq(raw.get("seq")) else {
                return Err(FeedError::InvalidRecord {
                    field: "seq",
                    raw: raw.to_string(),
                });
            };
            let Some(id) = raw.get("id").and_then(|v| v.as_str()) else {
                return Err(FeedError::InvalidRecord {
                    field: "id",
                    raw: raw.to_string(),
                });
            };
            if id.starts_with("_design/") {
                return Ok(None);
            }
            let deleted = raw
                .get("deleted")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let id = id.to_string();
            Ok(Some(ChangeRecord::new(cursor, id, raw).deleted(deleted)))
        })
    }
}

#[async_trait]
impl RegistrySource for StreamingChangesSource {
    fn config(&self) -> &RegistryConfig {
        &self.config
    }

    async fn initial_cursor(&self) -> Result<Cursor, FeedError> {
        let root = self.client.get_json(&self.config.url("/")).await?;
        parse_update_seq(&root)
    }

    async fn fetch_since(&self, since: &Cursor) -> Result<ChangeBatch, FeedError> {
        let url = self
            .config
            .url(&format!("/_changes?since={}", since.position()));
        let body = self.client.get_stream(&url).await?;
        tracing::debug!(registry = %self.config.id, %url, "opened change stream");

        let since = since.clone();
        let after = since.clone();
        let records = ChangeFeedStream::new(body, FeedFraming::ResultsEnvelope, Self::decoder())
            // `since` is inclusive on some mirrors
            .filter(move |r| {
                let keep = r.as_ref().map_or(true, |r| r.cursor > after);
                futures::future::ready(keep)
            })
            .boxed();
        Ok(ChangeBatch::new(since, records, self.config.scope_filter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceMode;
    use crate::source::testing::FakeFeedClient;
    use futures::TryStreamExt;

    fn source(client: FakeFeedClient, scopes: &[&str]) -> StreamingChangesSource {
        let config = RegistryConfig::new("npm", "https://r.example", SourceMode::Streaming)
            .with_scopes(scopes);
        StreamingChangesSource::new(config, Arc::new(client))
    }

    #[tokio::test]
    async fn streams_records_after_since() {
        let client = FakeFeedClient::default().with_body(
            "https://r.example/_changes?since=10",
            vec![
                r#"{"results":[{"seq":10,"id":"old"},{"seq":11,"id":"_design/app"},"#,
                r#"{"seq":12,"id":"@foo/a","changes":[{"rev":"3-x"}]},{"seq":13,"id":"@foo/b","del"#,
                r#"eted":true}],"last_seq":13}"#,
            ],
        );
        let src = source(client, &[]);
        let mut batch = src.fetch_since(&Cursor::new(10)).await.unwrap();
        let records: Vec<_> = (&mut batch).try_collect().await.unwrap();
        let got: Vec<_> = records
            .iter()
            .map(|r| (r.cursor.position(), r.fullname.as_str(), r.deleted))
            .collect();
        assert_eq!(got, vec![(12, "@foo/a", false), (13, "@foo/b", true)]);
        assert_eq!(batch.next_cursor(), &Cursor::new(13));
    }

    #[tokio::test]
    async fn scope_allow_list_applies() {
        let client = FakeFeedClient::default().with_body(
            "https://r.example/_changes?since=0",
            vec![r#"{"results":[{"seq":1,"id":"@bar/x"},{"seq":2,"id":"@foo/x"},{"seq":3,"id":"left-pad"}]}"#],
        );
        let src = source(client, &["@foo"]);
        let mut batch = src.fetch_since(&Cursor::new(0)).await.unwrap();
        let records: Vec<_> = (&mut batch).try_collect().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fullname, "@foo/x");
        assert_eq!(batch.next_cursor(), &Cursor::new(3));
    }

    #[tokio::test]
    async fn initial_cursor_is_update_seq() {
        let client = FakeFeedClient::default().with_json(
            "https://r.example/",
            serde_json::json!({"db_name": "registry", "update_seq": 9001}),
        );
        assert_eq!(source(client, &[]).initial_cursor().await.unwrap(), Cursor::new(9001));
    }

    #[tokio::test]
    async fn non_2xx_fails_before_any_record() {
        let src = source(FakeFeedClient::default(), &[]);
        let err = src.fetch_since(&Cursor::new(0)).await.err().unwrap();
        assert!(matches!(err, FeedError::Status { status: 404, .. }));
    }
}
