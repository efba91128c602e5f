//! HintQueue port - claim 候補のヒントキュー
//!
//! HintQueue は task_id のみを流します（状態や data は含まない）。
//! 正本は TaskStore であり、ここに積まれた ID は古い・重複している可能性があります。
//!
//! # 実装
//! - `InMemoryHintQueue`（プロセス内 FIFO）
//! - `NoopHintQueue`（ヒントなし、常に直接クエリにフォールバック）

use async_trait::async_trait;

use crate::domain::{HintError, TaskId, TaskType};

/// HintQueue は task_type ごとの FIFO
///
/// # 設計原則
/// - task_id のみを保持
/// - 失敗しても呼び出し側はログを出して続行する
#[async_trait]
pub trait HintQueue: Send + Sync {
    async fn push(&self, task_type: TaskType, task_id: TaskId) -> Result<(), HintError>;

    /// Non-blocking; `None` when the queue for `task_type` is empty.
    async fn pop(&self, task_type: TaskType) -> Result<Option<TaskId>, HintError>;

    async fn len(&self, task_type: TaskType) -> Result<usize, HintError>;
}
