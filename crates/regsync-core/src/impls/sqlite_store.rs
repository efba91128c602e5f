//! SqliteTaskStore / SqliteCursorStore - 複数プロセスで共有する正本（sqlx）
//!
//! # 実装詳細
//! - 非終端タスクの bizId は部分一意インデックスで一意にする
//! - すべての遷移は「読んだ行と一致する場合のみ」更新する条件付き UPDATE
//!   （`rows_affected() == 0` なら他のプロセスに負けたので読み直す）
//! - INSERT が一意制約に負けた場合は merge 経路にフォールバック
//! - 時刻はナノ秒精度の RFC 3339 文字列（辞書順 = 時刻順）

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use super::inmem_store::{merged_row, timeout_reason};
use crate::domain::{
    Cursor, FinishState, StoreError, Task, TaskData, TaskId, TaskState, TaskType,
};
use crate::observability::{SweepCounts, TaskCounts};
use crate::ports::cursor_store::moves_forward;
use crate::ports::{Clock, CreateOutcome, CursorStore, HintQueue, MergeFn, SweepPolicy, TaskStore};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    task_id     TEXT PRIMARY KEY,
    biz_id      TEXT,
    task_type   TEXT NOT NULL,
    state       TEXT NOT NULL,
    target_name TEXT NOT NULL,
    attempts    INTEGER NOT NULL DEFAULT 0,
    data        TEXT NOT NULL,
    author_id   TEXT NOT NULL,
    author_ip   TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_live_biz_id
    ON tasks (biz_id) WHERE biz_id IS NOT NULL AND state IN ('waiting', 'processing');
CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks (task_type, state, created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_state_updated ON tasks (state, updated_at);
CREATE TABLE IF NOT EXISTS registry_cursors (
    registry_id TEXT PRIMARY KEY,
    cursor      TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
"#;

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {s:?}: {e}")))
}

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    task_id: String,
    biz_id: Option<String>,
    task_type: String,
    state: String,
    target_name: String,
    attempts: i64,
    data: String,
    author_id: String,
    author_ip: String,
    created_at: String,
    updated_at: String,
}

/// A task together with the exact `data` text it was read with.
struct Loaded {
    task: Task,
    data: String,
}

impl TryFrom<TaskRow> for Loaded {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str, e: &dyn std::fmt::Display| {
            StoreError::Corrupt(format!("task {}: {what}: {e}", row.task_id))
        };
        let task = Task {
            task_id: TaskId::from_str(&row.task_id).map_err(|e| corrupt("task_id", &e))?,
            biz_id: row.biz_id.clone(),
            task_type: TaskType::from_str(&row.task_type).map_err(|e| corrupt("task_type", &e))?,
            state: TaskState::from_str(&row.state).map_err(|e| corrupt("state", &e))?,
            target_name: row.target_name.clone(),
            attempts: u32::try_from(row.attempts).map_err(|e| corrupt("attempts", &e))?,
            data: serde_json::from_str::<TaskData>(&row.data)?,
            author_id: row.author_id.clone(),
            author_ip: row.author_ip.clone(),
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
        };
        Ok(Loaded {
            task,
            data: row.data,
        })
    }
}

/// Another writer inserted a live row for the same bizId first.
fn lost_biz_id_race(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Database(db) if db.is_unique_violation() && db.message().contains("biz_id")
    )
}

/// Open (creating if needed) a SQLite database and apply the schema.
pub async fn connect(url: &str) -> Result<SqlitePool, StoreError> {
    let opts = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(opts)
        .await?;
    sqlx::query(SCHEMA_SQL).execute(&pool).await?;
    Ok(pool)
}

pub async fn open(path: &Path) -> Result<SqlitePool, StoreError> {
    connect(&format!("sqlite://{}", path.display())).await
}

pub struct SqliteTaskStore {
    pool: SqlitePool,
    hints: Arc<dyn HintQueue>,
    clock: Arc<dyn Clock>,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>, hints: Arc<dyn HintQueue>) -> Self {
        Self { pool, hints, clock }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn hint(&self, task_type: TaskType, task_id: TaskId) {
        if let Err(e) = self.hints.push(task_type, task_id).await {
            tracing::warn!(%task_id, error = %e, "failed to push task hint");
        }
    }

    async fn load(&self, task_id: TaskId) -> Result<Option<Loaded>, StoreError> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Loaded::try_from).transpose()
    }

    async fn load_live_biz(&self, biz_id: &str) -> Result<Option<Loaded>, StoreError> {
        let row = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE biz_id = ? AND state IN ('waiting', 'processing')",
        )
        .bind(biz_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Loaded::try_from).transpose()
    }

    async fn insert(&self, task: &Task) -> Result<(), sqlx::Error> {
        let data = serde_json::to_string(&task.data)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        sqlx::query(
            "INSERT INTO tasks (task_id, biz_id, task_type, state, target_name, attempts, data, \
             author_id, author_ip, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task.task_id.to_string())
        .bind(task.biz_id.as_deref())
        .bind(task.task_type.as_str())
        .bind(task.state.as_str())
        .bind(&task.target_name)
        .bind(i64::from(task.attempts))
        .bind(data)
        .bind(&task.author_id)
        .bind(&task.author_ip)
        .bind(ts(task.created_at))
        .bind(ts(task.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Write `next` only if the row still is exactly `from`.
    async fn compare_and_set(&self, from: &Loaded, next: &Task) -> Result<bool, StoreError> {
        let pre = from.task.precondition();
        let result = sqlx::query(
            "UPDATE tasks SET state = ?, attempts = ?, data = ?, updated_at = ? \
             WHERE task_id = ? AND state = ? AND attempts = ? AND updated_at = ? AND data = ?",
        )
        .bind(next.state.as_str())
        .bind(i64::from(next.attempts))
        .bind(serde_json::to_string(&next.data)?)
        .bind(ts(next.updated_at))
        .bind(pre.task_id.to_string())
        .bind(pre.state.as_str())
        .bind(i64::from(pre.attempts))
        .bind(ts(pre.updated_at))
        .bind(&from.data)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn try_claim(
        &self,
        task_id: TaskId,
        task_type: TaskType,
    ) -> Result<Option<Task>, StoreError> {
        let Some(current) = self.load(task_id).await? else {
            return Ok(None);
        };
        if current.task.task_type != task_type || current.task.state != TaskState::Waiting {
            return Ok(None);
        }
        let next = current.task.start(self.clock.now())?.task;
        Ok(self
            .compare_and_set(&current, &next)
            .await?
            .then_some(next))
    }

    /// Load a claimed task, checking it is still owned by the caller.
    async fn load_owned(&self, task: &Task) -> Result<Loaded, StoreError> {
        let current = self
            .load(task.task_id)
            .await?
            .ok_or(StoreError::NotFound(task.task_id))?;
        if current.task.state != TaskState::Processing || current.task.attempts != task.attempts {
            return Err(StoreError::Conflict {
                task_id: task.task_id,
                state: current.task.state,
            });
        }
        Ok(current)
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create_or_merge(
        &self,
        candidate: Task,
        merge: &MergeFn,
    ) -> Result<CreateOutcome, StoreError> {
        // Every lost round means another writer committed its own insert or
        // merge on this bizId, so the loop always makes progress overall.
        let mut lost = 0u32;
        loop {
            if let Some(biz_id) = candidate.biz_id.as_deref()
                && let Some(existing) = self.load_live_biz(biz_id).await?
            {
                let next = merged_row(
                    &existing.task,
                    merge(&existing.task, &candidate),
                    self.clock.now(),
                );
                if self.compare_and_set(&existing, &next).await? {
                    return Ok(CreateOutcome::Merged(next));
                }
            } else {
                match self.insert(&candidate).await {
                    Ok(()) => {
                        if candidate.state == TaskState::Waiting {
                            self.hint(candidate.task_type, candidate.task_id).await;
                        }
                        return Ok(CreateOutcome::Created(candidate));
                    }
                    // a task_id clash is not a race and is never retried
                    Err(e) if candidate.biz_id.is_some() && lost_biz_id_race(&e) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            lost += 1;
            tracing::debug!(biz_id = ?candidate.biz_id, lost, "lost create race, retrying");
            tokio::task::yield_now().await;
        }
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
            if let Some(task) = self.try_claim(task_id, task_type).await? {
                return Ok(Some(task));
            }
            tracing::trace!(%task_id, "discarding stale hint");
        }

        loop {
            let candidate: Option<String> = sqlx::query_scalar(
                "SELECT task_id FROM tasks WHERE task_type = ? AND state = 'waiting' \
                 ORDER BY created_at, task_id LIMIT 1",
            )
            .bind(task_type.as_str())
            .fetch_optional(&self.pool)
            .await?;
            let Some(raw) = candidate else {
                return Ok(None);
            };
            let task_id = TaskId::from_str(&raw)
                .map_err(|e| StoreError::Corrupt(format!("task_id {raw:?}: {e}")))?;
            if let Some(task) = self.try_claim(task_id, task_type).await? {
                return Ok(Some(task));
            }
        }
    }

    async fn finish(
        &self,
        task: &Task,
        finish: FinishState,
        reason: Option<&str>,
    ) -> Result<Task, StoreError> {
        loop {
            let current = match self.load_owned(task).await {
                Ok(current) => current,
                Err(StoreError::Conflict { state, .. }) if state == TaskState::from(finish) => {
                    return self
                        .load(task.task_id)
                        .await?
                        .map(|l| l.task)
                        .ok_or(StoreError::NotFound(task.task_id));
                }
                Err(e) => return Err(e),
            };
            let next = current
                .task
                .finish_claim(finish, reason, self.clock.now())?
                .task;
            if self.compare_and_set(&current, &next).await? {
                if next.state == TaskState::Waiting {
                    self.hint(next.task_type, next.task_id).await;
                }
                return Ok(next);
            }
        }
    }

    async fn sweep_timeouts(&self, policy: SweepPolicy) -> Result<SweepCounts, StoreError> {
        let now = self.clock.now();
        let cutoff = now - policy.timeout_delta();
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE state IN ('waiting', 'processing') AND updated_at < ?",
        )
        .bind(ts(cutoff))
        .fetch_all(&self.pool)
        .await?;

        let mut counts = SweepCounts::default();
        for row in rows {
            let stale = Loaded::try_from(row)?;
            let task = &stale.task;
            let next = match task.state {
                TaskState::Processing if task.attempts >= policy.max_attempts => {
                    task.finish(FinishState::Fail, Some(&timeout_reason(task)), now)?
                }
                TaskState::Processing => task.requeue(now)?,
                _ => task.refresh(now)?,
            }
            .task;
            if !self.compare_and_set(&stale, &next).await? {
                continue;
            }
            match (task.state, next.state) {
                (TaskState::Processing, TaskState::Fail) => {
                    counts.processing += 1;
                    counts.failed += 1;
                }
                (TaskState::Processing, _) => {
                    counts.processing += 1;
                    counts.requeued += 1;
                    self.hint(task.task_type, task.task_id).await;
                }
                _ => {
                    counts.waiting += 1;
                    self.hint(task.task_type, task.task_id).await;
                }
            }
        }
        Ok(counts)
    }

    async fn heartbeat(&self, task: &Task, patch: TaskData) -> Result<Task, StoreError> {
        loop {
            let current = self.load_owned(task).await?;
            let next = current.task.merge_sync_data(patch.clone(), self.clock.now());
            if self.compare_and_set(&current, &next).await? {
                return Ok(next);
            }
        }
    }

    async fn find_task(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.load(task_id).await?.map(|l| l.task))
    }

    async fn find_by_biz_id(&self, biz_id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.load_live_biz(biz_id).await?.map(|l| l.task))
    }

    async fn count_by_state(&self) -> Result<TaskCounts, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM tasks GROUP BY state")
                .fetch_all(&self.pool)
                .await?;
        let mut counts = TaskCounts::default();
        for (state, n) in rows {
            let state = TaskState::from_str(&state)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            counts.add(state, usize::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }
}

pub struct SqliteCursorStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteCursorStore {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    async fn current(&self, registry_id: &str) -> Result<Option<String>, StoreError> {
        Ok(
            sqlx::query_scalar("SELECT cursor FROM registry_cursors WHERE registry_id = ?")
                .bind(registry_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }
}

#[async_trait]
impl CursorStore for SqliteCursorStore {
    async fn load(&self, registry_id: &str) -> Result<Option<Cursor>, StoreError> {
        self.current(registry_id)
            .await?
            .map(|raw| {
                Cursor::from_str(&raw)
                    .map_err(|e| StoreError::Corrupt(format!("cursor of {registry_id}: {e}")))
            })
            .transpose()
    }

    async fn advance(
        &self,
        registry_id: &str,
        expected: Option<&Cursor>,
        next: &Cursor,
    ) -> Result<bool, StoreError> {
        let now = ts(self.clock.now());
        if !moves_forward(expected, next) {
            let current = self.current(registry_id).await?;
            return Ok(current == expected.map(|c| c.to_string()));
        }
        let result = match expected {
            None => {
                sqlx::query(
                    "INSERT INTO registry_cursors (registry_id, cursor, updated_at) \
                     VALUES (?, ?, ?) ON CONFLICT (registry_id) DO NOTHING",
                )
                .bind(registry_id)
                .bind(next.to_string())
                .bind(now)
                .execute(&self.pool)
                .await?
            }
            Some(expected) => {
                sqlx::query(
                    "UPDATE registry_cursors SET cursor = ?, updated_at = ? \
                     WHERE registry_id = ? AND cursor = ?",
                )
                .bind(next.to_string())
                .bind(now)
                .bind(registry_id)
                .bind(expected.to_string())
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }
}
