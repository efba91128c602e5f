//! Paged `_changes` feed fetched one bounded page at a time.
//!
//! `GET {endpoint}/_changes?since={seq}&limit={page_limit}` answers
//! `{"results":[{"seq":N,"type":"...","id":"name","changes":[{"version":"1.0.0"}]}]}`.
//! A page holding more records than `page_limit` means the upstream ignored
//! the limit; it is rejected with `FeedTooLarge` instead of being truncated.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;

use super::{ChangeBatch, RegistryConfig, RegistrySource, parse_seq, parse_update_seq};
use crate::domain::{ChangeRecord, Cursor, FeedError};
use crate::ports::FeedClient;

const UNPUBLISHED: &str = "PACKAGE_UNPUBLISHED";

pub struct BulkJsonChangesSource {
    config: RegistryConfig,
    client: Arc<dyn FeedClient>,
}

impl BulkJsonChangesSource {
    pub fn new(config: RegistryConfig, client: Arc<dyn FeedClient>) -> Self {
        Self { config, client }
    }

    fn record(raw: serde_json::Value) -> Result<ChangeRecord, FeedError> {
        let cursor = parse_seq(raw.get("seq")).ok_or_else(|| FeedError::InvalidRecord {
            field: "seq",
            raw: raw.to_string(),
        })?;
        let name = raw
            .get("id")
            .or_else(|| raw.get("fullname"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| FeedError::InvalidRecord {
                field: "id",
                raw: raw.to_string(),
            })?
            .to_string();
        let deleted = raw.get("type").and_then(|v| v.as_str()) == Some(UNPUBLISHED)
            || raw.get("deleted").and_then(|v| v.as_bool()) == Some(true);
        let versions = raw
            .get("changes")
            .and_then(|v| v.as_array())
            .map(|changes| {
                changes
                    .iter()
                    .filter_map(|c| c.get("version").and_then(|v| v.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(ChangeRecord::new(cursor, name, raw)
            .deleted(deleted)
            .with_versions(versions))
    }
}

#[async_trait]
impl RegistrySource for BulkJsonChangesSource {
    fn config(&self) -> &RegistryConfig {
        &self.config
    }

    async fn initial_cursor(&self) -> Result<Cursor, FeedError> {
        let root = self.client.get_json(&self.config.url("/")).await?;
        parse_update_seq(&root)
    }

    async fn fetch_since(&self, since: &Cursor) -> Result<ChangeBatch, FeedError> {
        let limit = self.config.page_limit;
        let url = self.config.url(&format!(
            "/_changes?since={}&limit={limit}",
            since.position()
        ));
        let page = self.client.get_json(&url).await?;
        let results = match page.get("results") {
            Some(serde_json::Value::Array(results)) => results.clone(),
            _ => {
                return Err(FeedError::MalformedResponse(format!(
                    "{url}: missing results array"
                )));
            }
        };
        if results.len() > limit {
            return Err(FeedError::FeedTooLarge {
                since: since.clone(),
                limit,
                received: results.len(),
            });
        }

        let mut records = results
            .into_iter()
            .map(Self::record)
            .collect::<Result<Vec<_>, _>>()?;
        records.retain(|r| r.cursor > *since);
        records.sort_by(|a, b| a.cursor.cmp(&b.cursor));
        tracing::debug!(
            registry = %self.config.id,
            %since,
            records = records.len(),
            "fetched change page"
        );

        let last_seq = parse_seq(page.get("last_seq"));
        let records = stream::iter(records.into_iter().map(Ok)).boxed();
        Ok(ChangeBatch::new(since.clone(), records, self.config.scope_filter())
            .with_final_cursor(last_seq))
    }
}
