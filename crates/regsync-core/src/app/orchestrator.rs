//! SyncOrchestrator - change feed から Task への橋渡しと実行ループ
//!
//! - `ingest_once`: 上流の変更を PackageSync タスクに変換し、cursor を進める
//! - `run_execution_loop`: claim → handler → finish を claim が空になるまで繰り返す
//! - `run_timeout_sweep`: 止まったタスクの回収
//!
//! cursor は「そこまでの変更がすべて Task になった」後にだけ進める。
//! 途中で失敗したら進めずに返すので、次の poll で再配送される（at-least-once）。

use std::sync::Arc;

use futures::StreamExt;

use super::runtime::{TaskHandler, run_handler};
use crate::domain::{
    ChangeRecord, Cursor, PackageSyncData, StoreError, SyncError, Task, TaskData, TaskState,
    TaskType, keep_existing, merge_package_sync,
};
use crate::observability::{ExecutionReport, IngestReport, SweepCounts};
use crate::ports::{Clock, CreateOutcome, CursorStore, IdGenerator, SweepPolicy, TaskStore};
use crate::source::RegistrySource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorOptions {
    pub sweep: SweepPolicy,
    /// Persist the cursor after this many ingested records (and at the end).
    pub checkpoint_every: usize,
}

pub struct SyncOrchestrator {
    store: Arc<dyn TaskStore>,
    cursors: Arc<dyn CursorStore>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    options: OrchestratorOptions,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        cursors: Arc<dyn CursorStore>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            store,
            cursors,
            ids,
            clock,
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn cursors(&self) -> &Arc<dyn CursorStore> {
        &self.cursors
    }

    /// One poll cycle of `source`.
    pub async fn ingest_once(
        &self,
        source: &dyn RegistrySource,
    ) -> Result<IngestReport, SyncError> {
        self.ingest(source, None).await
    }

    /// Like `ingest_once`, heartbeating the claimed poll task `lease` at every
    /// checkpoint. Losing the lease aborts the cycle.
    pub async fn ingest_leased(
        &self,
        source: &dyn RegistrySource,
        lease: &Task,
    ) -> Result<IngestReport, SyncError> {
        self.ingest(source, Some(lease.clone())).await
    }

    async fn ingest(
        &self,
        source: &dyn RegistrySource,
        mut lease: Option<Task>,
    ) -> Result<IngestReport, SyncError> {
        let registry = source.registry_id().to_string();
        let since = match self.cursors.load(&registry).await? {
            Some(cursor) => cursor,
            None => {
                let head = source.initial_cursor().await?;
                if !self.cursors.advance(&registry, None, &head).await? {
                    return Err(SyncError::CursorConflict { registry });
                }
                tracing::info!(%registry, cursor = %head, "initialized change feed cursor");
                head
            }
        };

        let mut report = IngestReport {
            registry: registry.clone(),
            since: Some(since.clone()),
            cursor: Some(since.clone()),
            ..IngestReport::default()
        };
        let mut batch = source.fetch_since(&since).await?;
        let mut pending = 0usize;
        let checkpoint_every = self.options.checkpoint_every.max(1);

        while let Some(record) = batch.next().await {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(
                        %registry,
                        error = %e,
                        records = report.records,
                        cursor = ?report.cursor,
                        "change feed failed mid-batch"
                    );
                    return Err(e.into());
                }
            };
            let outcome = self
                .store
                .create_or_merge(self.sync_task(&registry, &record), &merge_package_sync)
                .await?;
            match &outcome {
                CreateOutcome::Created(task) => {
                    report.created += 1;
                    tracing::debug!(
                        %registry,
                        task_id = %task.task_id,
                        name = %record.fullname,
                        cursor = %record.cursor,
                        "created sync task"
                    );
                }
                CreateOutcome::Merged(task) => {
                    report.merged += 1;
                    tracing::debug!(
                        %registry,
                        task_id = %task.task_id,
                        name = %record.fullname,
                        cursor = %record.cursor,
                        "merged into pending sync task"
                    );
                }
            }
            report.records += 1;
            pending += 1;
            if pending >= checkpoint_every {
                self.checkpoint(&mut report, batch.next_cursor(), &mut lease).await?;
                pending = 0;
            }
        }
        report.filtered = batch.filtered();
        self.checkpoint(&mut report, batch.next_cursor(), &mut lease).await?;

        tracing::info!(
            %registry,
            records = report.records,
            created = report.created,
            merged = report.merged,
            filtered = report.filtered,
            cursor = ?report.cursor,
            "change feed ingested"
        );
        Ok(report)
    }

    async fn checkpoint(
        &self,
        report: &mut IngestReport,
        next: &Cursor,
        lease: &mut Option<Task>,
    ) -> Result<(), SyncError> {
        let expected = report.cursor.clone();
        if expected.as_ref().is_some_and(|e| next <= e) {
            return Ok(());
        }
        if !self.cursors.advance(&report.registry, expected.as_ref(), next).await? {
            return Err(SyncError::CursorConflict {
                registry: report.registry.clone(),
            });
        }
        report.cursor = Some(next.clone());
        report.checkpoints += 1;
        tracing::debug!(registry = %report.registry, cursor = %next, "cursor checkpoint");

        if let Some(task) = lease.as_ref() {
            let mut patch = TaskData::new();
            patch.insert("lastCursor".into(), next.to_string().into());
            *lease = Some(self.store.heartbeat(task, patch).await?);
        }
        Ok(())
    }

    fn sync_task(&self, registry: &str, record: &ChangeRecord) -> Task {
        Task::package_sync(
            self.ids.generate_task_id(),
            registry,
            &record.fullname,
            PackageSyncData::from_record(registry, record),
            self.clock.now(),
        )
    }

    /// Claim and run tasks of `task_type` until none is left.
    pub async fn run_execution_loop(
        &self,
        task_type: TaskType,
        handler: &dyn TaskHandler,
    ) -> Result<ExecutionReport, SyncError> {
        let mut report = ExecutionReport::default();
        while let Some(task) = self.store.claim_next(task_type).await? {
            report.claimed += 1;
            let outcome = run_handler(handler, &task).await;
            match self
                .store
                .finish(&task, outcome.state, outcome.reason.as_deref())
                .await
            {
                // changes merged in while the handler ran; the loop claims it again
                Ok(done) if done.state == TaskState::Waiting => {
                    report.rerun += 1;
                    tracing::info!(
                        task_id = %done.task_id,
                        %task_type,
                        target = %done.target_name,
                        "task changed while running, queued again"
                    );
                }
                Ok(done) if outcome.is_success() => {
                    report.succeeded += 1;
                    tracing::info!(
                        task_id = %done.task_id,
                        %task_type,
                        target = %done.target_name,
                        attempts = done.attempts,
                        "task succeeded"
                    );
                }
                Ok(done) => {
                    report.failed += 1;
                    tracing::warn!(
                        task_id = %done.task_id,
                        %task_type,
                        target = %done.target_name,
                        reason = ?outcome.reason,
                        "task failed"
                    );
                }
                Err(StoreError::Conflict { task_id, state }) => {
                    report.conflicts += 1;
                    tracing::warn!(%task_id, %state, "task was taken over before it finished");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(report)
    }

    pub async fn run_timeout_sweep(&self) -> Result<SweepCounts, SyncError> {
        let counts = self.store.sweep_timeouts(self.options.sweep).await?;
        if counts.processing > 0 || counts.waiting > 0 {
            tracing::info!(
                processing = counts.processing,
                waiting = counts.waiting,
                requeued = counts.requeued,
                failed = counts.failed,
                "timeout sweep recovered tasks"
            );
        } else {
            tracing::debug!("timeout sweep found nothing");
        }
        Ok(counts)
    }

    /// Ask for one poll of `registry_id`. Repeated requests collapse onto the
    /// pending poll task, so at most one poller runs per registry.
    pub async fn schedule_poll(&self, registry_id: &str) -> Result<CreateOutcome, SyncError> {
        let task =
            Task::change_feed_poll(self.ids.generate_task_id(), registry_id, self.clock.now());
        Ok(self.store.create_or_merge(task, &keep_existing).await?)
    }

    /// Manual package sync. No versions means a full sync.
    pub async fn enqueue_package_sync(
        &self,
        registry_id: &str,
        fullname: &str,
        versions: Vec<String>,
    ) -> Result<CreateOutcome, SyncError> {
        let data = PackageSyncData {
            registry_id: Some(registry_id.to_string()),
            specific_versions: (!versions.is_empty()).then_some(versions),
            change_count: 1,
            tips: Some("manual sync".to_string()),
            ..PackageSyncData::default()
        };
        let task = Task::package_sync(
            self.ids.generate_task_id(),
            registry_id,
            fullname,
            data,
            self.clock.now(),
        );
        Ok(self.store.create_or_merge(task, &merge_package_sync).await?)
    }
}
