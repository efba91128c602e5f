//! Feed of packages keyed by modification time.
//!
//! `GET {endpoint}/-/all/since?since={millis}&limit={page_limit}` answers
//! `[{"name":"pkg","gmt_modified":"2024-01-01T00:00:00.000Z"}, ...]` with
//! every package modified at or after `since`. The upstream has no sequence
//! number, so the cursor is `(modified millis, name)`.
//!
//! Several packages can share one millisecond. A full page may therefore cut
//! a group of equal timestamps in half; the trailing group is dropped and
//! re-read in full on the next poll, which resumes at the bare timestamp of
//! that group. A full page that starts and ends at the `since` timestamp can
//! never advance and is rejected with `FeedTooLarge`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use futures::StreamExt;
use futures::stream;

use super::{ChangeBatch, RegistryConfig, RegistrySource};
use crate::domain::{ChangeRecord, Cursor, FeedError};
use crate::ports::{Clock, FeedClient};

pub struct ModifiedSinceSource {
    config: RegistryConfig,
    client: Arc<dyn FeedClient>,
    clock: Arc<dyn Clock>,
}

impl ModifiedSinceSource {
    pub fn new(config: RegistryConfig, client: Arc<dyn FeedClient>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            client,
            clock,
        }
    }

    fn record(raw: serde_json::Value) -> Result<ChangeRecord, FeedError> {
        let name = raw
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| FeedError::InvalidRecord {
                field: "name",
                raw: raw.to_string(),
            })?
            .to_string();
        let millis = raw
            .get("gmt_modified")
            .and_then(modified_millis)
            .ok_or_else(|| FeedError::InvalidRecord {
                field: "gmt_modified",
                raw: raw.to_string(),
            })?;
        Ok(ChangeRecord::new(Cursor::with_tiebreak(millis, name.clone()), name, raw))
    }
}

/// RFC 3339 text or epoch milliseconds.
fn modified_millis(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .and_then(|t| u64::try_from(t.timestamp_millis()).ok()),
        _ => None,
    }
}

#[async_trait]
impl RegistrySource for ModifiedSinceSource {
    fn config(&self) -> &RegistryConfig {
        &self.config
    }

    async fn initial_cursor(&self) -> Result<Cursor, FeedError> {
        let now = self.clock.now().timestamp_millis().max(0) as u64;
        Ok(Cursor::new(now))
    }

    async fn fetch_since(&self, since: &Cursor) -> Result<ChangeBatch, FeedError> {
        let limit = self.config.page_limit;
        let url = self.config.url(&format!(
            "/-/all/since?since={}&limit={limit}",
            since.position()
        ));
        let page = self.client.get_json(&url).await?;
        let serde_json::Value::Array(items) = page else {
            return Err(FeedError::MalformedResponse(format!(
                "{url}: expected an array"
            )));
        };
        let received = items.len();
        let mut records = items
            .into_iter()
            .map(Self::record)
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by(|a, b| a.cursor.cmp(&b.cursor));

        // Everything before the trailing group was delivered in full, so the
        // next poll can restart at the start of that group.
        let mut resume_at = None;
        if received >= limit
            && let Some(last) = records.last().map(|r| r.cursor.position())
        {
            if last <= since.position() {
                return Err(FeedError::FeedTooLarge {
                    since: since.clone(),
                    limit,
                    received,
                });
            }
            records.retain(|r| r.cursor.position() < last);
            resume_at = Some(Cursor::new(last));
        }
        records.retain(|r| r.cursor > *since);
        tracing::debug!(
            registry = %self.config.id,
            %since,
            received,
            records = records.len(),
            "fetched modified-since page"
        );

        let records = stream::iter(records.into_iter().map(Ok)).boxed();
        Ok(ChangeBatch::new(since.clone(), records, self.config.scope_filter())
            .with_final_cursor(resume_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use crate::source::SourceMode;
    use crate::source::testing::FakeFeedClient;
    use chrono::{TimeZone, Utc};
    use futures::TryStreamExt;
    use serde_json::json;

    fn source(client: FakeFeedClient, limit: usize) -> ModifiedSinceSource {
        let config = RegistryConfig::new("cnpmjs", "https://r.example", SourceMode::ModifiedSince)
            .with_page_limit(limit);
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        ModifiedSinceSource::new(config, Arc::new(client), Arc::new(clock))
    }

    async fn names(src: &ModifiedSinceSource, since: Cursor) -> (Vec<String>, Cursor) {
        let mut batch = src.fetch_since(&since).await.unwrap();
        let records: Vec<ChangeRecord> = (&mut batch).try_collect().await.unwrap();
        (
            records.into_iter().map(|r| r.fullname).collect(),
            batch.next_cursor().clone(),
        )
    }

    #[tokio::test]
    async fn same_millisecond_records_are_ordered_by_name() {
        let client = FakeFeedClient::default().with_json(
            "https://r.example/-/all/since?since=100&limit=10",
            json!([
                {"name": "b", "gmt_modified": 200},
                {"name": "a", "gmt_modified": 200},
                {"name": "c", "gmt_modified": 150},
                {"name": "edge", "gmt_modified": 100}
            ]),
        );
        // a bare timestamp has seen nothing at that millisecond yet
        let (got, next) = names(&source(client, 10), Cursor::new(100)).await;
        assert_eq!(got, vec!["edge", "c", "a", "b"]);
        assert_eq!(next, Cursor::with_tiebreak(200, "b"));
    }

    #[tokio::test]
    async fn resuming_inside_a_millisecond_skips_seen_names() {
        let client = FakeFeedClient::default().with_json(
            "https://r.example/-/all/since?since=200&limit=10",
            json!([
                {"name": "a", "gmt_modified": 200},
                {"name": "b", "gmt_modified": 200},
                {"name": "z", "gmt_modified": 200}
            ]),
        );
        let (got, _) = names(&source(client, 10), Cursor::with_tiebreak(200, "b")).await;
        assert_eq!(got, vec!["z"]);
    }

    #[tokio::test]
    async fn full_page_drops_trailing_timestamp_group() {
        let client = FakeFeedClient::default().with_json(
            "https://r.example/-/all/since?since=0&limit=3",
            json!([
                {"name": "a", "gmt_modified": "2024-01-01T00:00:00.001Z"},
                {"name": "b", "gmt_modified": "2024-01-01T00:00:00.002Z"},
                {"name": "c", "gmt_modified": "2024-01-01T00:00:00.002Z"}
            ]),
        );
        let (got, next) = names(&source(client, 3), Cursor::new(0)).await;
        assert_eq!(got, vec!["a"]);
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap().timestamp_millis() as u64;
        // nothing at the cut millisecond has been seen yet
        assert_eq!(next, Cursor::new(base + 2));
    }

    #[tokio::test]
    async fn poll_after_a_cut_group_reads_that_group_in_full() {
        let client = FakeFeedClient::default()
            .with_json(
                "https://r.example/-/all/since?since=100&limit=3",
                json!([
                    {"name": "a", "gmt_modified": 200},
                    {"name": "z", "gmt_modified": 200},
                    {"name": "c", "gmt_modified": 300}
                ]),
            )
            .with_json(
                "https://r.example/-/all/since?since=300&limit=3",
                json!([
                    {"name": "c", "gmt_modified": 300},
                    {"name": "d", "gmt_modified": 300}
                ]),
            );
        let src = source(client, 3);

        let (got, next) = names(&src, Cursor::new(100)).await;
        assert_eq!(got, vec!["a", "z"]);
        assert_eq!(next, Cursor::new(300));

        let (got, next) = names(&src, next).await;
        assert_eq!(got, vec!["c", "d"]);
        assert_eq!(next, Cursor::with_tiebreak(300, "d"));
    }

    #[tokio::test]
    async fn full_page_of_one_newer_timestamp_waits_for_the_next_poll() {
        let client = FakeFeedClient::default().with_json(
            "https://r.example/-/all/since?since=100&limit=2",
            json!([
                {"name": "a", "gmt_modified": 200},
                {"name": "b", "gmt_modified": 200}
            ]),
        );
        let src = source(client, 2);
        let (got, next) = names(&src, Cursor::new(100)).await;
        assert!(got.is_empty());
        assert_eq!(next, Cursor::new(200));
    }

    #[tokio::test]
    async fn full_page_of_one_timestamp_is_feed_too_large() {
        let client = FakeFeedClient::default().with_json(
            "https://r.example/-/all/since?since=5&limit=2",
            json!([
                {"name": "a", "gmt_modified": 5},
                {"name": "b", "gmt_modified": 5}
            ]),
        );
        let err = source(client, 2).fetch_since(&Cursor::new(5)).await.err().unwrap();
        assert!(matches!(err, FeedError::FeedTooLarge { limit: 2, received: 2, .. }));
    }

    #[tokio::test]
    async fn initial_cursor_is_now() {
        let src = source(FakeFeedClient::default(), 10);
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap().timestamp_millis() as u64;
        assert_eq!(src.initial_cursor().await.unwrap(), Cursor::new(expected));
    }
}
