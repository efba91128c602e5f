//! Errors - エラー型と分類
//!
//! Every error can be classified with [`ErrorKind`] so callers (scheduler,
//! CLI) can tell "retry on the next tick" from "fix the configuration".

use super::cursor::{Cursor, InvalidCursor};
use super::state::TaskState;
use super::task_type::TaskType;
use super::TaskId;

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（次の poll で再試行）
/// - Permanent: 恒久的なエラー（設定の見直しが必要）
/// - Infrastructure: ストア / キューの障害
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// Errors raised while fetching or parsing an upstream change feed.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream {url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("malformed feed record: {0}")]
    MalformedRecord(#[source] serde_json::Error),

    #[error("malformed feed response: {0}")]
    MalformedResponse(String),

    #[error("feed framing is unbalanced at byte {offset}")]
    Unbalanced { offset: usize },

    #[error("feed ended inside a record ({buffered} bytes buffered)")]
    Truncated { buffered: usize },

    #[error("record is missing {field}: {raw}")]
    InvalidRecord { field: &'static str, raw: String },

    /// The upstream holds more changes at one position than a single page
    /// can carry; paging cannot make progress without a larger limit.
    #[error("limit too large, current since: {since}, limit: {limit}, received: {received}")]
    FeedTooLarge {
        since: Cursor,
        limit: usize,
        received: usize,
    },

    #[error(transparent)]
    InvalidCursor(#[from] InvalidCursor),
}

impl FeedError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FeedError::FeedTooLarge { .. } | FeedError::InvalidCursor(_) => ErrorKind::Permanent,
            _ => ErrorKind::Transient,
        }
    }
}

/// Invalid transition requested on the pure task state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {action} task {task_id} in state {from}")]
pub struct TaskError {
    pub task_id: TaskId,
    pub from: TaskState,
    pub action: &'static str,
}

/// Errors raised by a [`crate::ports::TaskStore`] or [`crate::ports::CursorStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("task {0} not found")]
    NotFound(TaskId),

    /// A conditional update lost against a concurrent writer.
    #[error("task {task_id} changed concurrently (now {state})")]
    Conflict { task_id: TaskId, state: TaskState },

    #[error(transparent)]
    InvalidTransition(#[from] TaskError),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Conflict { .. } | StoreError::InvalidTransition(_) => ErrorKind::Transient,
            _ => ErrorKind::Infrastructure,
        }
    }
}

/// Errors raised by a hint queue. Callers log and ignore them.
#[derive(Debug, thiserror::Error)]
pub enum HintError {
    #[error("hint queue unavailable: {0}")]
    Unavailable(String),
}

/// Orchestrator-level error.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("handler not found for task_type={0}")]
    HandlerNotFound(TaskType),

    #[error("duplicate handler for task_type={0}")]
    DuplicateHandler(TaskType),

    #[error("unknown registry {0:?}")]
    UnknownRegistry(String),

    /// Another poller moved the cursor of this registry.
    #[error("cursor of registry {registry:?} moved concurrently")]
    CursorConflict { registry: String },

    #[error("handler failed: {0}")]
    Handler(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Feed(e) => e.kind(),
            SyncError::Store(e) => e.kind(),
            SyncError::HandlerNotFound(_)
            | SyncError::DuplicateHandler(_)
            | SyncError::UnknownRegistry(_) => ErrorKind::Permanent,
            SyncError::Handler(_) | SyncError::CursorConflict { .. } => ErrorKind::Transient,
        }
    }
}
