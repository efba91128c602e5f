//! Task record and its pure state machine.
//!
//! Every transition returns a new [`Task`] together with the [`Precondition`]
//! the store must compare against when persisting it. Nothing here touches
//! storage; concurrency control lives in the store implementations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::TaskError;
use super::ids::TaskId;
use super::state::{FinishState, TaskState};
use super::task_type::TaskType;

/// Opaque, handler-specific payload of a task.
pub type TaskData = serde_json::Map<String, serde_json::Value>;

/// Key under which the failure reason is recorded in `data`.
pub const ERROR_KEY: &str = "error";

/// Set on a Processing row whose `data` changed after it was claimed.
pub const MERGED_AFTER_CLAIM_KEY: &str = "mergedAfterClaim";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: TaskId,

    /// Dedup key; `None` means "always create a new task".
    pub biz_id: Option<String>,

    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub state: TaskState,

    /// The logical subject, e.g. a package name.
    pub target_name: String,

    /// Incremented on every claim and on every timeout requeue.
    pub attempts: u32,

    pub data: TaskData,

    pub author_id: String,
    pub author_ip: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Snapshot of the row a transition was computed from.
///
/// Stores apply a transition only where the row still matches this snapshot,
/// which is what makes claim/finish/sweep safe across processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precondition {
    pub task_id: TaskId,
    pub state: TaskState,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

/// A computed transition: the new logical state plus its precondition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub task: Task,
    pub precondition: Precondition,
}

impl Task {
    pub fn new(
        task_id: TaskId,
        task_type: TaskType,
        target_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            biz_id: None,
            task_type,
            state: TaskState::Waiting,
            target_name: target_name.into(),
            attempts: 0,
            data: TaskData::new(),
            author_id: "unknown".to_string(),
            author_ip: "127.0.0.1".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_biz_id(mut self, biz_id: impl Into<String>) -> Self {
        self.biz_id = Some(biz_id.into());
        self
    }

    pub fn with_data(mut self, data: TaskData) -> Self {
        self.data = data;
        self
    }

    pub fn with_author(
        mut self,
        author_id: impl Into<String>,
        author_ip: impl Into<String>,
    ) -> Self {
        self.author_id = author_id.into();
        self.author_ip = author_ip.into();
        self
    }

    pub fn precondition(&self) -> Precondition {
        Precondition {
            task_id: self.task_id,
            state: self.state,
            attempts: self.attempts,
            updated_at: self.updated_at,
        }
    }

    /// Failure reason recorded by `finish(Fail, ..)` or the timeout sweep.
    pub fn error(&self) -> Option<&str> {
        self.data.get(ERROR_KEY).and_then(|v| v.as_str())
    }

    /// Whether changes were merged in after the current claim, so the worker
    /// holding the claim has not seen them.
    pub fn merged_after_claim(&self) -> bool {
        self.data
            .get(MERGED_AFTER_CLAIM_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// `updated_at` never moves backwards, even if the caller's clock does.
    fn stamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.max(self.updated_at)
    }

    fn transition(&self, next: Task) -> Transition {
        Transition {
            task: next,
            precondition: self.precondition(),
        }
    }

    fn invalid(&self, action: &'static str) -> TaskError {
        TaskError {
            task_id: self.task_id,
            from: self.state,
            action,
        }
    }

    /// Waiting -> Processing; counts one attempt.
    pub fn start(&self, now: DateTime<Utc>) -> Result<Transition, TaskError> {
        if self.state != TaskState::Waiting {
            return Err(self.invalid("start"));
        }
        let mut next = self.clone();
        next.state = TaskState::Processing;
        next.attempts += 1;
        next.updated_at = self.stamp(now);
        next.data.remove(MERGED_AFTER_CLAIM_KEY);
        Ok(self.transition(next))
    }

    /// The transition for a worker reporting `state` on its claim.
    ///
    /// If changes were merged in while the worker ran, the task goes back to
    /// Waiting instead, keeping the merged data, so the next claim sees them.
    pub fn finish_claim(
        &self,
        state: FinishState,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Transition, TaskError> {
        if self.state != TaskState::Processing || !self.merged_after_claim() {
            return self.finish(state, reason, now);
        }
        let mut next = self.clone();
        next.state = TaskState::Waiting;
        next.updated_at = self.stamp(now);
        next.data.remove(MERGED_AFTER_CLAIM_KEY);
        Ok(self.transition(next))
    }

    /// Processing -> Success | Fail.
    ///
    /// Finishing an already finished task with the same state is a no-op
    /// transition (the returned task equals `self`).
    pub fn finish(
        &self,
        state: FinishState,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Transition, TaskError> {
        let target = TaskState::from(state);
        if self.state == target {
            return Ok(self.transition(self.clone()));
        }
        if self.state != TaskState::Processing {
            return Err(self.invalid("finish"));
        }
        let mut next = self.clone();
        next.state = target;
        next.updated_at = self.stamp(now);
        if state == FinishState::Fail {
            let reason = reason.unwrap_or("unknown error");
            next.data
                .insert(ERROR_KEY.to_string(), serde_json::Value::from(reason));
        }
        Ok(self.transition(next))
    }

    /// Processing -> Waiting, attempts + 1. Used by timeout recovery.
    pub fn requeue(&self, now: DateTime<Utc>) -> Result<Transition, TaskError> {
        if self.state != TaskState::Processing {
            return Err(self.invalid("requeue"));
        }
        let mut next = self.clone();
        next.state = TaskState::Waiting;
        next.attempts += 1;
        next.updated_at = self.stamp(now);
        next.data.remove(MERGED_AFTER_CLAIM_KEY);
        Ok(self.transition(next))
    }

    /// Stamp `updated_at` without changing state. Used to re-hint stale
    /// Waiting tasks and to heartbeat Processing ones.
    pub fn refresh(&self, now: DateTime<Utc>) -> Result<Transition, TaskError> {
        if self.state.is_terminal() {
            return Err(self.invalid("refresh"));
        }
        let mut next = self.clone();
        next.updated_at = self.stamp(now);
        Ok(self.transition(next))
    }

    /// Shallow-merge handler fields into `data`. State is left untouched.
    pub fn merge_sync_data(&self, patch: TaskData, now: DateTime<Utc>) -> Task {
        let mut next = self.clone();
        next.data.extend(patch);
        next.updated_at = self.stamp(now);
        next
    }

    /// How long this row has been sitting in its current state.
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.updated_at
    }
}
