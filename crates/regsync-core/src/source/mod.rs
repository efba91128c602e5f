//! Upstream registry sources.
//!
//! A [`RegistrySource`] turns one upstream's wire format into a
//! [`ChangeBatch`]: a lazy, scope-filtered stream of [`ChangeRecord`]s in
//! non-decreasing cursor order. The concrete adapter is chosen from
//! [`SourceMode`] when the configuration is loaded.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt, ready};
use serde::{Deserialize, Serialize};

use crate::domain::{ChangeRecord, Cursor, FeedError};
use crate::ports::{Clock, FeedClient};

pub mod bulk_json;
pub mod modified_since;
pub mod streaming;

pub use bulk_json::BulkJsonChangesSource;
pub use modified_since::ModifiedSinceSource;
pub use streaming::StreamingChangesSource;

/// Wire format of an upstream change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    /// Long-lived `_changes` body parsed while it arrives.
    Streaming,
    /// Bounded `_changes` pages fetched in one request.
    BulkJson,
    /// Package list keyed by modification time.
    ModifiedSince,
}

fn default_page_limit() -> usize {
    1000
}

/// One `[[registries]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub id: String,
    pub endpoint: String,
    pub mode: SourceMode,

    /// Scope allow-list (`@foo`). Empty accepts every package.
    #[serde(default)]
    pub scopes: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
}

impl RegistryConfig {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>, mode: SourceMode) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            mode,
            scopes: Vec::new(),
            token: None,
            page_limit: default_page_limit(),
        }
    }

    pub fn with_scopes(mut self, scopes: &[&str]) -> Self {
        self.scopes = scopes.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_page_limit(mut self, page_limit: usize) -> Self {
        self.page_limit = page_limit;
        self
    }

    /// `endpoint` joined with `path`, without doubled slashes.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn scope_filter(&self) -> ScopeFilter {
        ScopeFilter::new(self.scopes.clone())
    }
}

/// Scope allow-list applied before records reach ingestion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeFilter {
    scopes: Vec<String>,
}

impl ScopeFilter {
    pub fn new(scopes: Vec<String>) -> Self {
        Self { scopes }
    }

    /// An empty list accepts everything; otherwise only packages whose scope
    /// is listed pass, so unscoped packages are rejected.
    pub fn allows(&self, record: &ChangeRecord) -> bool {
        if self.scopes.is_empty() {
            return true;
        }
        match record.scope() {
            Some(scope) => self.scopes.iter().any(|s| s == scope),
            None => false,
        }
    }
}

/// The records of one `fetch_since` call.
///
/// `next_cursor` covers every record pulled so far, including the ones the
/// scope filter dropped, so it is safe to persist once everything yielded
/// before it has been handled.
pub struct ChangeBatch {
    records: BoxStream<'static, Result<ChangeRecord, FeedError>>,
    filter: ScopeFilter,
    next_cursor: Cursor,
    final_cursor: Option<Cursor>,
    filtered: u64,
}

impl ChangeBatch {
    pub fn new(
        since: Cursor,
        records: BoxStream<'static, Result<ChangeRecord, FeedError>>,
        filter: ScopeFilter,
    ) -> Self {
        Self {
            records,
            filter,
            next_cursor: since,
            final_cursor: None,
            filtered: 0,
        }
    }

    /// Cursor to adopt once the batch has been read to its end, for feeds
    /// that report their own position (`last_seq`).
    pub fn with_final_cursor(mut self, cursor: Option<Cursor>) -> Self {
        self.final_cursor = cursor;
        self
    }

    pub fn next_cursor(&self) -> &Cursor {
        &self.next_cursor
    }

    /// Records dropped by the scope filter so far.
    pub fn filtered(&self) -> u64 {
        self.filtered
    }

    fn observe(&mut self, cursor: &Cursor) {
        if *cursor > self.next_cursor {
            self.next_cursor = cursor.clone();
        }
    }
}

impl Stream for ChangeBatch {
    type Item = Result<ChangeRecord, FeedError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match ready!(this.records.poll_next_unpin(cx)) {
                Some(Ok(record)) => {
                    this.observe(&record.cursor);
                    if this.filter.allows(&record) {
                        return Poll::Ready(Some(Ok(record)));
                    }
                    this.filtered += 1;
                }
                Some(Err(e)) => return Poll::Ready(Some(Err(e))),
                None => {
                    if let Some(cursor) = this.final_cursor.take() {
                        this.observe(&cursor);
                    }
                    return Poll::Ready(None);
                }
            }
        }
    }
}

/// One upstream registry.
#[async_trait]
pub trait RegistrySource: Send + Sync {
    fn config(&self) -> &RegistryConfig;

    fn registry_id(&self) -> &str {
        &self.config().id
    }

    /// Where a fresh mirror starts: the upstream's current head.
    async fn initial_cursor(&self) -> Result<Cursor, FeedError>;

    /// Changes strictly after `since`.
    async fn fetch_since(&self, since: &Cursor) -> Result<ChangeBatch, FeedError>;
}

/// Pick the adapter for `config.mode`.
pub fn build_source(
    config: RegistryConfig,
    client: Arc<dyn FeedClient>,
    clock: Arc<dyn Clock>,
) -> Arc<dyn RegistrySource> {
    match config.mode {
        SourceMode::Streaming => Arc::new(StreamingChangesSource::new(config, client)),
        SourceMode::BulkJson => Arc::new(BulkJsonChangesSource::new(config, client)),
        SourceMode::ModifiedSince => Arc::new(ModifiedSinceSource::new(config, client, clock)),
    }
}

/// `update_seq` of a CouchDB-style registry root document.
pub(crate) fn parse_update_seq(root: &serde_json::Value) -> Result<Cursor, FeedError> {
    parse_seq(root.get("update_seq")).ok_or_else(|| FeedError::InvalidRecord {
        field: "update_seq",
        raw: root.to_string(),
    })
}

/// A sequence number, either as a JSON number or as `"123"` / `"123-abc"`.
pub(crate) fn parse_seq(value: Option<&serde_json::Value>) -> Option<Cursor> {
    match value? {
        serde_json::Value::Number(n) => n.as_u64().map(Cursor::new),
        serde_json::Value::String(s) => {
            let head = s.split_once('-').map_or(s.as_str(), |(head, _)| head);
            head.parse().ok().map(Cursor::new)
        }
        _ => None,
    }
}
