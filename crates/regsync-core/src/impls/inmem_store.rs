//! InMemoryTaskStore / InMemoryCursorStore - 単一プロセス用の正本
//!
//! # 実装詳細
//! - tasks: HashMap<TaskId, Task>（すべての行）
//! - live_biz: HashMap<bizId, TaskId>（非終端タスクの一意制約）
//! - tokio::sync::Mutex で排他制御し、遷移は現在の行から計算して
//!   Precondition と一致する場合のみ適用する
//!
//! ヒントキューへの push はロック解放後に行う（失敗はログのみ）。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::task::MERGED_AFTER_CLAIM_KEY;
use crate::domain::{
    Cursor, FinishState, StoreError, Task, TaskData, TaskId, TaskState, TaskType, Transition,
};
use crate::observability::{SweepCounts, TaskCounts};
use crate::ports::cursor_store::moves_forward;
use crate::ports::{Clock, CreateOutcome, CursorStore, HintQueue, MergeFn, SweepPolicy, TaskStore};

#[derive(Debug, Default)]
struct StoreState {
    tasks: HashMap<TaskId, Task>,
    live_biz: HashMap<String, TaskId>,
}

impl StoreState {
    /// Apply `transition` if the stored row still matches its precondition.
    fn compare_and_set(&mut self, transition: Transition) -> bool {
        let pre = &transition.precondition;
        let Some(current) = self.tasks.get_mut(&pre.task_id) else {
            return false;
        };
        if current.state != pre.state
            || current.attempts != pre.attempts
            || current.updated_at != pre.updated_at
        {
            return false;
        }
        let next = transition.task;
        if next.state.is_terminal()
            && let Some(biz_id) = next.biz_id.as_deref()
            && self.live_biz.get(biz_id) == Some(&next.task_id)
        {
            self.live_biz.remove(biz_id);
        }
        *current = next;
        true
    }

    fn current(&self, task_id: TaskId) -> Result<&Task, StoreError> {
        self.tasks.get(&task_id).ok_or(StoreError::NotFound(task_id))
    }

    /// Oldest Waiting task of `task_type`.
    fn oldest_waiting(&self, task_type: TaskType) -> Option<&Task> {
        self.tasks
            .values()
            .filter(|t| t.task_type == task_type && t.state == TaskState::Waiting)
            .min_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.task_id.cmp(&b.task_id))
            })
    }
}

/// Replace `existing.data` with the merge result.
///
/// Processing rows keep their `updated_at`: it is the worker's liveness signal.
/// They are marked instead, so the worker's finish sends them back to Waiting.
pub(crate) fn merged_row(
    existing: &Task,
    data: TaskData,
    now: chrono::DateTime<chrono::Utc>,
) -> Task {
    let mut next = existing.clone();
    next.data = data;
    match existing.state {
        TaskState::Waiting => next.updated_at = now.max(existing.updated_at),
        TaskState::Processing => {
            next.data.insert(MERGED_AFTER_CLAIM_KEY.to_string(), serde_json::Value::Bool(true));
        }
        TaskState::Success | TaskState::Fail => {}
    }
    next
}

pub(crate) fn timeout_reason(task: &Task) -> String {
    format!("processing timeout after {} attempts", task.attempts)
}

pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
    hints: Arc<dyn HintQueue>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>, hints: Arc<dyn HintQueue>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            hints,
            clock,
        }
    }

    async fn hint(&self, task_type: TaskType, task_id: TaskId) {
        if let Err(e) = self.hints.push(task_type, task_id).await {
            tracing::warn!(%task_id, error = %e, "failed to push task hint");
        }
    }

    /// Claim one specific task if it is still Waiting.
    fn try_claim(
        &self,
        state: &mut StoreState,
        task_id: TaskId,
        task_type: TaskType,
    ) -> Result<Option<Task>, StoreError> {
        let Some(current) = state.tasks.get(&task_id) else {
            return Ok(None);
        };
        if current.task_type != task_type || current.state != TaskState::Waiting {
            return Ok(None);
        }
        let transition = current.start(self.clock.now())?;
        let claimed = transition.task.clone();
        Ok(state.compare_and_set(transition).then_some(claimed))
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_or_merge(
        &self,
        candidate: Task,
        merge: &MergeFn,
    ) -> Result<CreateOutcome, StoreError> {
        let now = self.clock.now();
        let outcome = {
            let mut state = self.state.lock().await;
            let existing = candidate
                .biz_id
                .as_deref()
                .and_then(|biz_id| state.live_biz.get(biz_id).copied());
            match existing {
                Some(existing_id) => {
                    let existing = state.current(existing_id)?;
                    let next = merged_row(existing, merge(existing, &candidate), now);
                    state.tasks.insert(existing_id, next.clone());
                    CreateOutcome::Merged(next)
                }
                None => {
                    if candidate.state.is_live()
                        && let Some(biz_id) = candidate.biz_id.clone()
                    {
                        state.live_biz.insert(biz_id, candidate.task_id);
                    }
                    state.tasks.insert(candidate.task_id, candidate.clone());
                    CreateOutcome::Created(candidate)
                }
            }
        };

        if let CreateOutcome::Created(task) = &outcome
            && task.state == TaskState::Waiting
        {
            self.hint(task.task_type, task.task_id).await;
        }
        Ok(outcome)
    }

    async fn claim_next(&self, task_type: TaskType) -> Result<Option<Task>, StoreError> {
        loop {
            let hinted = match self.hints.pop(task_type).await {
                Ok(hinted) => hinted,
                Err(e) => {
                    tracing::warn!(%task_type, error = %e, "hint queue unavailable");
                    None
                }
            };
            let Some(task_id) = hinted else { break };
            let mut state = self.state.lock().await;
            if let Some(task) = self.try_claim(&mut state, task_id, task_type)? {
                return Ok(Some(task));
            }
            tracing::trace!(%task_id, "discarding stale hint");
        }

        let mut state = self.state.lock().await;
        let Some(task_id) = state.oldest_waiting(task_type).map(|t| t.task_id) else {
            return Ok(None);
        };
        self.try_claim(&mut state, task_id, task_type)
    }

    async fn finish(
        &self,
        task: &Task,
        finish: FinishState,
        reason: Option<&str>,
    ) -> Result<Task, StoreError> {
        let mut state = self.state.lock().await;
        let current = state.current(task.task_id)?;
        if current.state == TaskState::from(finish) {
            return Ok(current.clone());
        }
        if current.state != TaskState::Processing || current.attempts != task.attempts {
            return Err(StoreError::Conflict {
                task_id: task.task_id,
                state: current.state,
            });
        }
        let transition = current.finish_claim(finish, reason, self.clock.now())?;
        let finished = transition.task.clone();
        if !state.compare_and_set(transition) {
            return Err(StoreError::Conflict {
                task_id: task.task_id,
                state: TaskState::Processing,
            });
        }
        drop(state);

        if finished.state == TaskState::Waiting {
            self.hint(finished.task_type, finished.task_id).await;
        }
        Ok(finished)
    }

    async fn sweep_timeouts(&self, policy: SweepPolicy) -> Result<SweepCounts, StoreError> {
        let now = self.clock.now();
        let timeout = policy.timeout_delta();
        let mut counts = SweepCounts::default();
        let mut rehint = Vec::new();
        {
            let mut state = self.state.lock().await;
            let stale: Vec<Task> = state
                .tasks
                .values()
                .filter(|t| t.state.is_live() && t.idle_for(now) > timeout)
                .cloned()
                .collect();
            for task in stale {
                let transition = match task.state {
                    TaskState::Processing if task.attempts >= policy.max_attempts => {
                        task.finish(FinishState::Fail, Some(&timeout_reason(&task)), now)?
                    }
                    TaskState::Processing => task.requeue(now)?,
                    _ => task.refresh(now)?,
                };
                let next_state = transition.task.state;
                if !state.compare_and_set(transition) {
                    continue;
                }
                match (task.state, next_state) {
                    (TaskState::Processing, TaskState::Fail) => {
                        counts.processing += 1;
                        counts.failed += 1;
                    }
                    (TaskState::Processing, _) => {
                        counts.processing += 1;
                        counts.requeued += 1;
                        rehint.push((task.task_type, task.task_id));
                    }
                    _ => {
                        counts.waiting += 1;
                        rehint.push((task.task_type, task.task_id));
                    }
                }
            }
        }
        for (task_type, task_id) in rehint {
            self.hint(task_type, task_id).await;
        }
        Ok(counts)
    }

    async fn heartbeat(&self, task: &Task, patch: TaskData) -> Result<Task, StoreError> {
        let mut state = self.state.lock().await;
        let current = state.current(task.task_id)?;
        if current.state != TaskState::Processing || current.attempts != task.attempts {
            return Err(StoreError::Conflict {
                task_id: task.task_id,
                state: current.state,
            });
        }
        let next = current.merge_sync_data(patch, self.clock.now());
        state.tasks.insert(next.task_id, next.clone());
        Ok(next)
    }

    async fn find_task(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.state.lock().await.tasks.get(&task_id).cloned())
    }

    async fn find_by_biz_id(&self, biz_id: &str) -> Result<Option<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .live_biz
            .get(biz_id)
            .and_then(|id| state.tasks.get(id))
            .cloned())
    }

    async fn count_by_state(&self) -> Result<TaskCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = TaskCounts::default();
        for task in state.tasks.values() {
            counts.add(task.state, 1);
        }
        Ok(counts)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCursorStore {
    cursors: Mutex<HashMap<String, Cursor>>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for InMemoryCursorStore {
    async fn load(&self, registry_id: &str) -> Result<Option<Cursor>, StoreError> {
        Ok(self.cursors.lock().await.get(registry_id).cloned())
    }

    async fn advance(
        &self,
        registry_id: &str,
        expected: Option<&Cursor>,
        next: &Cursor,
    ) -> Result<bool, StoreError> {
        let mut cursors = self.cursors.lock().await;
        if cursors.get(registry_id) != expected {
            return Ok(false);
        }
        if moves_forward(expected, next) {
            cursors.insert(registry_id.to_string(), next.clone());
        }
        Ok(true)
    }
}
