//! TaskStore port - タスクの正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - 状態（Waiting / Processing / Success / Fail）
//! - bizId による重複排除（非終端タスクの間だけ一意）
//! - claim / finish / timeout sweep の条件付き更新
//!
//! # 実装
//! - `InMemoryTaskStore`（テスト・単一プロセス用）
//! - `SqliteTaskStore`（sqlx、複数プロセスで共有）

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{FinishState, StoreError, Task, TaskData, TaskId, TaskType};
use crate::observability::{SweepCounts, TaskCounts};

/// Merge function for `create_or_merge`: `(existing, candidate) -> new data`.
pub type MergeFn = dyn Fn(&Task, &Task) -> TaskData + Send + Sync;

/// Result of `create_or_merge`.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// `candidate` was inserted as a new row.
    Created(Task),
    /// A live task with the same bizId absorbed the candidate.
    Merged(Task),
}

impl CreateOutcome {
    pub fn task(&self) -> &Task {
        match self {
            CreateOutcome::Created(t) | CreateOutcome::Merged(t) => t,
        }
    }

    pub fn into_task(self) -> Task {
        match self {
            CreateOutcome::Created(t) | CreateOutcome::Merged(t) => t,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// Timeout recovery parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPolicy {
    /// A Processing row idle for longer than this is considered stuck.
    pub processing_timeout: Duration,
    /// Rows whose `attempts` reached this are failed instead of requeued.
    pub max_attempts: u32,
}

impl SweepPolicy {
    pub fn timeout_delta(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.processing_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(36_500))
    }
}

/// TaskStore は状態・重複排除・claim の正本
///
/// # 設計原則
/// - すべての状態遷移は「現在の行が Precondition と一致する場合のみ」適用
/// - ヒントキューは最適化に過ぎない（空でも重複していても正しく動く）
/// - 終端タスクは削除しない（監査・リプレイ時の重複判定に使う）
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert `candidate`, or fold it into the live task sharing its bizId.
    ///
    /// Never errors because of a concurrent creator: the loser of an insert
    /// race takes the merge path.
    async fn create_or_merge(
        &self,
        candidate: Task,
        merge: &MergeFn,
    ) -> Result<CreateOutcome, StoreError>;

    /// Claim the oldest Waiting task of `task_type` (best effort when hints
    /// are used). `None` when nothing is claimable.
    async fn claim_next(&self, task_type: TaskType) -> Result<Option<Task>, StoreError>;

    /// Persist a terminal state for a task previously returned by
    /// `claim_next`. Repeating the same terminal state is a no-op.
    ///
    /// Fails with `StoreError::Conflict` if the task was requeued and
    /// reclaimed after `task` was read.
    async fn finish(
        &self,
        task: &Task,
        state: FinishState,
        reason: Option<&str>,
    ) -> Result<Task, StoreError>;

    /// Requeue or fail stuck Processing tasks, and re-hint stale Waiting ones.
    async fn sweep_timeouts(&self, policy: SweepPolicy) -> Result<SweepCounts, StoreError>;

    /// Merge `patch` into a claimed task's data and refresh `updated_at`.
    async fn heartbeat(&self, task: &Task, patch: TaskData) -> Result<Task, StoreError>;

    async fn find_task(&self, task_id: TaskId) -> Result<Option<Task>, StoreError>;

    /// The live (non-terminal) task holding `biz_id`, if any.
    async fn find_by_biz_id(&self, biz_id: &str) -> Result<Option<Task>, StoreError>;

    async fn count_by_state(&self) -> Result<TaskCounts, StoreError>;
}
